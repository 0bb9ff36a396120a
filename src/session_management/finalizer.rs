use std::sync::Arc;

use log::{error, info, warn};
use uuid::Uuid;

use crate::error_handling::types::SessionError;
use crate::sandbox::provider::SandboxProvider;
use crate::session_management::session_registry::SessionRegistry;
use crate::storage::storage_trait::Storage;
use crate::storage::types::{EventType, NewEvent};
use crate::terminal_relay::broadcast_hub::terminal_topic;

/// Tears down a finished session's sandbox and closes its activity log.
pub struct SessionFinalizer {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn SandboxProvider>,
    storage: Arc<dyn Storage>,
}

impl SessionFinalizer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        provider: Arc<dyn SandboxProvider>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            registry,
            provider,
            storage,
        }
    }

    /// Detaches capture and kills the sandbox, then appends `session_end`.
    pub async fn finalize(&self, session_id: Uuid) -> Result<(), SessionError> {
        self.teardown(session_id).await?;
        self.storage
            .append_event(NewEvent::new(
                session_id,
                EventType::SessionEnd,
                "Interview session ended",
            ))
            .await?;
        info!("[{}] Session finalized", session_id);
        Ok(())
    }

    /// Kills the session's sandbox.
    ///
    /// With no cached handle (the process restarted since provisioning), the
    /// persisted `sandbox_id` is used to connect once purely to issue the kill.
    /// Kill failures are logged, not returned.
    pub async fn teardown(&self, session_id: Uuid) -> Result<(), SessionError> {
        let lock = self.registry.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.registry.remove(session_id) {
            handle.stop_capture();
            if let Err(e) = handle.sandbox().kill().await {
                error!("[{}] Failed to kill sandbox {}: {}", session_id, handle.sandbox_id(), e);
            }
            handle.detach();
        } else {
            let sandbox_id = self
                .storage
                .get_session(session_id)
                .await?
                .and_then(|s| s.sandbox_id);
            if let Some(sandbox_id) = sandbox_id {
                match self.provider.connect(&sandbox_id).await {
                    Ok(sandbox) => {
                        if let Err(e) = sandbox.kill().await {
                            error!("[{}] Failed to kill sandbox {}: {}", session_id, sandbox_id, e);
                        }
                    }
                    Err(e) => warn!(
                        "[{}] Could not reach sandbox {} to kill it: {}",
                        session_id, sandbox_id, e
                    ),
                }
            }
        }
        self.registry.hub().remove_topic(&terminal_topic(session_id));
        self.registry.release_lock(session_id);
        Ok(())
    }
}
