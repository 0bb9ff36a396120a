use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::data_capture::activity_capture::ActivityCapture;
use crate::error_handling::types::SessionError;
use crate::notification::completion_queue::CompletionQueue;
use crate::notification::evaluation_sink::CompletionNotice;
use crate::sandbox::provisioner::SandboxProvisioner;
use crate::session_management::finalizer::SessionFinalizer;
use crate::session_management::sandbox_handle::SandboxHandle;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{ActivityEvent, EventType, NewEvent, Session, SessionStatus};

/// Reply to a sandbox creation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedSandbox {
    pub sandbox_id: String,
    pub pty_pid: u32,
    pub status: SessionStatus,
}

/// Owns the lifecycle of a session's sandbox, from provisioning to the end flow.
///
/// # Fields Overview
///
/// - `storage`: durable sessions, challenges and the activity log
/// - `registry`: live handles and per-session serialization
/// - `provisioner`: builds a ready sandbox from the challenge file set
/// - `finalizer`: kills the sandbox and closes the log when a session ends
/// - `completions`: hand-off to the evaluation collaborator
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    registry: Arc<SessionRegistry>,
    provisioner: Arc<SandboxProvisioner>,
    finalizer: Arc<SessionFinalizer>,
    completions: CompletionQueue,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<SessionRegistry>,
        provisioner: Arc<SandboxProvisioner>,
        finalizer: Arc<SessionFinalizer>,
        completions: CompletionQueue,
    ) -> Self {
        Self {
            storage,
            registry,
            provisioner,
            finalizer,
            completions,
        }
    }

    async fn load(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(String::from("Session not found")))
    }

    /// Provisions a sandbox for the session's challenge and starts capturing it.
    ///
    /// Idempotent for a session that already has a reachable sandbox: the
    /// existing one is returned instead of building a second VM.
    pub async fn create_session_sandbox(
        &self,
        session_id: Uuid,
    ) -> Result<CreatedSandbox, SessionError> {
        let mut session = self.load(session_id).await?;
        if session.is_completed() {
            return Err(SessionError::InvalidRequest(String::from(
                "Session already completed",
            )));
        }
        let challenge = match session.challenge_id {
            Some(challenge_id) => self.storage.get_challenge(challenge_id).await?,
            None => None,
        }
        .ok_or_else(|| {
            SessionError::InvalidRequest(String::from("No challenge associated with session"))
        })?;

        if session.status == SessionStatus::Active {
            if let Some(handle) = self.registry.get_or_reconnect(session_id).await? {
                info!(
                    "[{}] Reusing running sandbox {}",
                    session_id,
                    handle.sandbox_id()
                );
                return Ok(CreatedSandbox {
                    sandbox_id: handle.sandbox_id().to_string(),
                    pty_pid: handle.pty_pid(),
                    status: SessionStatus::Active,
                });
            }
        }

        let lock = self.registry.session_lock(session_id);
        let _guard = lock.lock().await;
        if let Some(handle) = self.registry.cached(session_id) {
            debug!("[{}] Sandbox created by a concurrent request", session_id);
            return Ok(CreatedSandbox {
                sandbox_id: handle.sandbox_id().to_string(),
                pty_pid: handle.pty_pid(),
                status: SessionStatus::Active,
            });
        }

        let provisioned = self
            .provisioner
            .create(&challenge.generated_files, &challenge.description)
            .await?;
        let capture = match ActivityCapture::attach(
            &provisioned.sandbox,
            session_id,
            self.storage.clone(),
            self.registry.hub().clone(),
            self.registry.capture_settings(),
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                if let Err(kill_err) = provisioned.sandbox.kill().await {
                    warn!(
                        "[{}] Failed to kill sandbox {} after capture failed: {}",
                        session_id, provisioned.sandbox_id, kill_err
                    );
                }
                return Err(e.into());
            }
        };
        let handle = Arc::new(SandboxHandle::new(
            session_id,
            provisioned.sandbox.clone(),
            capture,
        ));
        self.registry.insert(session_id, handle.clone());

        session.sandbox_id = Some(provisioned.sandbox_id.clone());
        session.status = SessionStatus::Active;
        session.started_at = Some(Utc::now());
        self.storage.save_session(&session).await?;
        self.storage
            .append_event(NewEvent::new(
                session_id,
                EventType::SessionStart,
                "Interview session started",
            ))
            .await?;

        info!(
            "[{}] Session active on sandbox {}",
            session_id, provisioned.sandbox_id
        );
        Ok(CreatedSandbox {
            sandbox_id: provisioned.sandbox_id,
            pty_pid: handle.pty_pid(),
            status: SessionStatus::Active,
        })
    }

    /// Ends a session: kills its sandbox, closes the log, marks it completed
    /// and queues it for evaluation. Ending a completed session is a no-op.
    pub async fn end_session(&self, session_id: Uuid) -> Result<SessionStatus, SessionError> {
        let mut session = self.load(session_id).await?;
        if session.is_completed() {
            debug!("[{}] Session already completed", session_id);
            return Ok(SessionStatus::Completed);
        }

        self.finalizer.finalize(session_id).await?;
        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        self.storage.save_session(&session).await?;
        self.completions.enqueue(CompletionNotice::ended(session_id));

        info!("[{}] Session ended", session_id);
        Ok(SessionStatus::Completed)
    }

    pub async fn events(&self, session_id: Uuid) -> Result<Vec<ActivityEvent>, SessionError> {
        self.load(session_id).await?;
        Ok(self.storage.get_events(session_id).await?)
    }
}
