use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;

use crate::error_handling::types::SessionError;
use crate::sandbox::project_path::{absolute, normalize_relative, parent_dir};
use crate::sandbox::test_files::is_test_file;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::storage_trait::Storage;

const FILE_NOT_FOUND: &str = "File not found";

/// The candidate-visible view of a session's project.
///
/// Test files are invisible here: they are filtered from listings and any
/// attempt to read or write one is answered as if the file did not exist.
/// When the sandbox cannot be reached, listings and reads fall back to the
/// stored challenge file set.
pub struct ProjectFiles {
    registry: Arc<SessionRegistry>,
    storage: Arc<dyn Storage>,
    project_root: String,
    list_timeout: Duration,
}

impl ProjectFiles {
    pub fn new(
        registry: Arc<SessionRegistry>,
        storage: Arc<dyn Storage>,
        project_root: String,
        list_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            project_root,
            list_timeout,
        }
    }

    pub async fn list(&self, session_id: Uuid) -> Result<Vec<String>, SessionError> {
        if self.storage.get_session(session_id).await?.is_none() {
            return Err(SessionError::NotFound(String::from("Session not found")));
        }

        let mut files = Vec::new();
        if let Some(handle) = self.registry.get_or_reconnect(session_id).await? {
            let cmd = format!(
                "find {} -type f -not -path \"*/node_modules/*\" -not -path \"*/.*\" | sort",
                self.project_root
            );
            match handle.sandbox().run_command(&cmd, self.list_timeout).await {
                Ok(output) => files = self.parse_listing(&output.stdout),
                Err(e) => warn!("[{}] Sandbox listing failed: {}", session_id, e),
            }
        }
        if files.is_empty() {
            debug!("[{}] Listing from stored file set", session_id);
            files = self
                .stored_files(session_id)
                .await?
                .into_keys()
                .filter(|f| !is_test_file(f))
                .collect();
        }
        Ok(files)
    }

    pub async fn read(&self, session_id: Uuid, path: &str) -> Result<String, SessionError> {
        let relative = self.visible_path(path)?;

        if let Some(handle) = self.registry.get_or_reconnect(session_id).await? {
            match handle
                .sandbox()
                .read_file(&absolute(&self.project_root, &relative))
                .await
            {
                Ok(content) => return Ok(content),
                Err(e) => debug!("[{}] Sandbox read of {} failed: {}", session_id, relative, e),
            }
        }
        self.stored_files(session_id)
            .await?
            .remove(&relative)
            .ok_or_else(|| SessionError::NotFound(String::from(FILE_NOT_FOUND)))
    }

    /// Writes into the live sandbox; there is no offline fallback for writes.
    pub async fn write(
        &self,
        session_id: Uuid,
        path: &str,
        content: &str,
    ) -> Result<String, SessionError> {
        let relative = self.visible_path(path)?;
        let handle = self
            .registry
            .get_or_reconnect(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(String::from("No active sandbox")))?;

        if let Some(dir) = parent_dir(&relative) {
            let mkdir = format!("mkdir -p {}", absolute(&self.project_root, dir));
            handle.sandbox().run_command(&mkdir, self.list_timeout).await?;
        }
        handle
            .sandbox()
            .write_file(&absolute(&self.project_root, &relative), content)
            .await?;
        debug!("[{}] Wrote {} ({} bytes)", session_id, relative, content.len());
        Ok(relative)
    }

    fn visible_path(&self, path: &str) -> Result<String, SessionError> {
        let relative = normalize_relative(path).ok_or_else(|| {
            SessionError::InvalidRequest(format!("Invalid path: {}", path))
        })?;
        if is_test_file(&relative) {
            return Err(SessionError::NotFound(String::from(FILE_NOT_FOUND)));
        }
        Ok(relative)
    }

    fn parse_listing(&self, stdout: &str) -> Vec<String> {
        let prefix = format!("{}/", self.project_root.trim_end_matches('/'));
        stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.strip_prefix(&prefix).unwrap_or(line).to_string())
            .filter(|f| !is_test_file(f))
            .collect()
    }

    async fn stored_files(&self, session_id: Uuid) -> Result<BTreeMap<String, String>, SessionError> {
        let Some(challenge_id) = self
            .storage
            .get_session(session_id)
            .await?
            .and_then(|s| s.challenge_id)
        else {
            return Ok(BTreeMap::new());
        };
        Ok(self
            .storage
            .get_challenge(challenge_id)
            .await?
            .map(|c| c.generated_files)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::activity_capture::CaptureSettings;
    use crate::sandbox::provider::CommandOutput;
    use crate::terminal_relay::broadcast_hub::BroadcastHub;
    use crate::test_support::{FakeProvider, MemStorage};
    use std::sync::atomic::Ordering;

    const ROOT: &str = "/home/user/project";

    fn project_files(storage: &Arc<MemStorage>, provider: &Arc<FakeProvider>) -> ProjectFiles {
        let registry = Arc::new(SessionRegistry::new(
            storage.clone(),
            provider.clone(),
            Arc::new(BroadcastHub::new()),
            CaptureSettings {
                project_root: ROOT.into(),
                cols: 120,
                rows: 40,
                debounce: Duration::from_millis(500),
            },
        ));
        ProjectFiles::new(registry, storage.clone(), ROOT.into(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn listing_hides_test_files() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        fake.respond_to(
            "find /home/user/project",
            Ok(CommandOutput {
                stdout: "/home/user/project/README.md\n/home/user/project/app.py\n/home/user/project/tests/test_app.py\n/home/user/project/util_test.py\n".into(),
                stderr: String::new(),
                exit_code: 0,
            }),
        );
        let session_id = storage.seed_active_session(&[("app.py", "")], "sbx-1");

        let files = project_files(&storage, &provider).list(session_id).await.unwrap();
        assert_eq!(files, vec!["README.md", "app.py"]);
    }

    #[tokio::test]
    async fn listing_falls_back_to_stored_files() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let session_id = storage.seed_session(&[
            ("app.py", "print(1)"),
            ("test_app.py", "def test(): pass"),
            ("lib/util.py", ""),
        ]);

        let files = project_files(&storage, &provider).list(session_id).await.unwrap();
        assert_eq!(files, vec!["app.py", "lib/util.py"]);

        let unknown = project_files(&storage, &provider).list(Uuid::new_v4()).await;
        assert!(matches!(unknown, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_paths_are_rejected_even_when_present() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        fake.put_file("/home/user/project/test_app.py", "secret assertions");
        let session_id =
            storage.seed_active_session(&[("test_app.py", "secret assertions")], "sbx-1");
        let files = project_files(&storage, &provider);

        let read = files.read(session_id, "test_app.py").await;
        assert_eq!(read, Err(SessionError::NotFound(FILE_NOT_FOUND.into())));
        let hidden_dir = files.read(session_id, ".atrium_tests/test_app.py").await;
        assert_eq!(hidden_dir, Err(SessionError::NotFound(FILE_NOT_FOUND.into())));

        let write = files.write(session_id, "tests/test_new.py", "x").await;
        assert_eq!(write, Err(SessionError::NotFound(FILE_NOT_FOUND.into())));
        assert!(!fake.files().contains_key("/home/user/project/tests/test_new.py"));
    }

    #[tokio::test]
    async fn read_prefers_sandbox_then_stored_content() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        fake.put_file("/home/user/project/app.py", "edited");
        let session_id = storage.seed_active_session(&[("app.py", "original")], "sbx-1");
        let files = project_files(&storage, &provider);

        assert_eq!(files.read(session_id, "app.py").await.unwrap(), "edited");

        fake.fail_reads.store(true, Ordering::SeqCst);
        assert_eq!(files.read(session_id, "./app.py").await.unwrap(), "original");
        assert!(matches!(
            files.read(session_id, "missing.py").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn write_requires_live_sandbox_and_safe_path() {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        let active = storage.seed_active_session(&[], "sbx-1");
        let pending = storage.seed_session(&[]);
        let files = project_files(&storage, &provider);

        assert_eq!(
            files.write(active, "src/main.py", "print(2)").await.unwrap(),
            "src/main.py"
        );
        assert_eq!(fake.files()["/home/user/project/src/main.py"], "print(2)");
        assert!(fake
            .commands()
            .contains(&"mkdir -p /home/user/project/src".to_string()));

        assert!(matches!(
            files.write(pending, "main.py", "").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            files.write(active, "../../etc/passwd", "").await,
            Err(SessionError::InvalidRequest(_))
        ));
    }
}
