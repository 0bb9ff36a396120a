use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::configuration::types::{SandboxConfig, TimeoutConfig};
use crate::error_handling::types::{ProvisionError, SandboxError};
use crate::sandbox::project_path::{absolute, normalize_relative, parent_dir};
use crate::sandbox::provider::{CreateOptions, Sandbox, SandboxProvider};
use crate::sandbox::test_files::relocation_script;

const ASSISTANT_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const TEST_RUNNER_INSTALL: &str = "pip install pytest 2>/dev/null";
const TEST_RUNNER_TIMEOUT: Duration = Duration::from_secs(30);
const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A freshly created and seeded sandbox.
pub struct ProvisionedSandbox {
    pub sandbox_id: String,
    pub sandbox: Arc<dyn Sandbox>,
}

/// Creates sandboxes and seeds them with a challenge's file set.
///
/// Steps, in order: create, install assistant tooling, create the project root,
/// write files and the brief, install dependencies by manifest, then move test
/// files into the hidden test directory. Any failure kills the half-built
/// sandbox and is reported once; nothing is retried here.
pub struct SandboxProvisioner {
    provider: Arc<dyn SandboxProvider>,
    config: SandboxConfig,
    timeouts: TimeoutConfig,
    assistant_key: Option<String>,
}

impl SandboxProvisioner {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        config: SandboxConfig,
        timeouts: TimeoutConfig,
        assistant_key: Option<String>,
    ) -> Self {
        Self {
            provider,
            config,
            timeouts,
            assistant_key,
        }
    }

    pub fn project_root(&self) -> &str {
        &self.config.project_root
    }

    pub async fn create(
        &self,
        files: &BTreeMap<String, String>,
        brief: &str,
    ) -> Result<ProvisionedSandbox, ProvisionError> {
        let mut envs = HashMap::new();
        match &self.assistant_key {
            Some(key) => {
                envs.insert(ASSISTANT_KEY_ENV.to_string(), key.clone());
            }
            None => warn!("No assistant API key configured, sandbox tooling will be unauthenticated"),
        }

        let sandbox = self
            .provider
            .create(CreateOptions {
                template: self.config.template.clone(),
                lifetime_secs: self.config.lifetime_secs,
                envs,
            })
            .await
            .map_err(ProvisionError::CreationFailed)?;
        let sandbox_id = sandbox.sandbox_id().to_string();
        info!("[{}] Provisioning sandbox with {} files", sandbox_id, files.len());

        if let Err(e) = self.seed(sandbox.as_ref(), files, brief).await {
            error!("[{}] Provisioning failed: {}", sandbox_id, e);
            if let Err(kill_err) = sandbox.kill().await {
                warn!("[{}] Failed to kill half-provisioned sandbox: {}", sandbox_id, kill_err);
            }
            return Err(e);
        }

        info!("[{}] Sandbox ready", sandbox_id);
        Ok(ProvisionedSandbox {
            sandbox_id,
            sandbox,
        })
    }

    async fn seed(
        &self,
        sandbox: &dyn Sandbox,
        files: &BTreeMap<String, String>,
        brief: &str,
    ) -> Result<(), ProvisionError> {
        let root = self.config.project_root.as_str();

        self.install(sandbox, &self.config.tooling_install_command, self.timeouts.install())
            .await?;
        self.install(sandbox, &format!("mkdir -p {}", root), SHORT_COMMAND_TIMEOUT)
            .await?;

        for (path, content) in files {
            let relative = normalize_relative(path).ok_or_else(|| {
                ProvisionError::FileWriteFailed(
                    path.clone(),
                    SandboxError::Upstream(String::from("path escapes the project root")),
                )
            })?;
            if let Some(dir) = parent_dir(&relative) {
                self.install(
                    sandbox,
                    &format!("mkdir -p {}", absolute(root, dir)),
                    SHORT_COMMAND_TIMEOUT,
                )
                .await?;
            }
            sandbox
                .write_file(&absolute(root, &relative), content)
                .await
                .map_err(|e| ProvisionError::FileWriteFailed(relative.clone(), e))?;
            debug!("[{}] Wrote {}", sandbox.sandbox_id(), relative);
        }
        sandbox
            .write_file(&absolute(root, "README.md"), brief)
            .await
            .map_err(|e| ProvisionError::FileWriteFailed(String::from("README.md"), e))?;

        if files.contains_key("package.json") {
            self.install(
                sandbox,
                &format!("cd {} && npm install", root),
                self.timeouts.install(),
            )
            .await?;
        }
        if files.contains_key("requirements.txt") {
            self.install(
                sandbox,
                &format!("cd {} && pip install -r requirements.txt", root),
                self.timeouts.install(),
            )
            .await?;
        }
        if files.keys().any(|f| f.ends_with(".py")) {
            // Best effort: the template may already ship a test runner.
            match sandbox.run_command(TEST_RUNNER_INSTALL, TEST_RUNNER_TIMEOUT).await {
                Ok(out) if out.exit_code != 0 => {
                    warn!("[{}] pytest install exited with {}", sandbox.sandbox_id(), out.exit_code)
                }
                Ok(_) => {}
                Err(e) => warn!("[{}] pytest install failed: {}", sandbox.sandbox_id(), e),
            }
        }

        self.install(sandbox, &relocation_script(root), SHORT_COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Runs a provisioning command, treating a non-zero exit as failure.
    async fn install(
        &self,
        sandbox: &dyn Sandbox,
        cmd: &str,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        let output = sandbox
            .run_command(cmd, timeout)
            .await
            .map_err(|e| ProvisionError::InstallFailed(format!("`{}`: {}", cmd, e)))?;
        if output.exit_code != 0 {
            return Err(ProvisionError::InstallFailed(format!(
                "`{}` exited with {}: {}",
                cmd,
                output.exit_code,
                output.combined().trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::provider::CommandOutput;
    use crate::test_support::FakeProvider;
    use std::sync::atomic::Ordering;

    fn provisioner(provider: Arc<FakeProvider>) -> SandboxProvisioner {
        SandboxProvisioner::new(
            provider,
            SandboxConfig::default(),
            TimeoutConfig::default(),
            Some("sk-test".into()),
        )
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn seeds_files_brief_and_hides_tests() {
        let provider = Arc::new(FakeProvider::new());
        let provisioned = provisioner(provider.clone())
            .create(
                &files(&[
                    ("app.py", "print('hi')\n"),
                    ("pkg/util.py", "X = 1\n"),
                    ("test_app.py", "def test(): pass\n"),
                ]),
                "# Fix the bug",
            )
            .await
            .unwrap();

        let sandbox = provider.sandbox(&provisioned.sandbox_id).unwrap();
        let written = sandbox.files();
        assert_eq!(written["/home/user/project/app.py"], "print('hi')\n");
        assert_eq!(written["/home/user/project/pkg/util.py"], "X = 1\n");
        assert_eq!(written["/home/user/project/README.md"], "# Fix the bug");

        let commands = sandbox.commands();
        assert_eq!(commands[0], "npm install -g @anthropic-ai/claude-code");
        assert!(commands.contains(&"mkdir -p /home/user/project/pkg".to_string()));
        assert!(commands.contains(&TEST_RUNNER_INSTALL.to_string()));
        assert!(!commands.iter().any(|c| c.contains("npm install") && c.contains("cd ")));
        assert!(commands.last().unwrap().contains(".atrium_tests"));
        assert_eq!(provider.created_envs()[0]["ANTHROPIC_API_KEY"], "sk-test");
    }

    #[tokio::test]
    async fn installs_node_dependencies_for_package_manifest() {
        let provider = Arc::new(FakeProvider::new());
        let provisioned = provisioner(provider.clone())
            .create(&files(&[("package.json", "{}"), ("index.js", "")]), "brief")
            .await
            .unwrap();

        let commands = provider.sandbox(&provisioned.sandbox_id).unwrap().commands();
        assert!(commands.contains(&"cd /home/user/project && npm install".to_string()));
        assert!(!commands.contains(&TEST_RUNNER_INSTALL.to_string()));
    }

    #[tokio::test]
    async fn failed_install_kills_the_sandbox() {
        let provider = Arc::new(FakeProvider::new());
        provider.script_on_create(
            "pip install -r",
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "no such package".into(),
                exit_code: 1,
            }),
        );

        let result = provisioner(provider.clone())
            .create(&files(&[("requirements.txt", "nope==0"), ("app.py", "")]), "brief")
            .await;

        assert!(matches!(result, Err(ProvisionError::InstallFailed(msg)) if msg.contains("no such package")));
        let sandbox = provider.last_created().unwrap();
        assert!(sandbox.killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn escaping_paths_are_refused() {
        let provider = Arc::new(FakeProvider::new());
        let result = provisioner(provider)
            .create(&files(&[("../outside.py", "")]), "brief")
            .await;
        assert!(matches!(result, Err(ProvisionError::FileWriteFailed(path, _)) if path == "../outside.py"));
    }
}
