use std::sync::Arc;

use log::warn;
use uuid::Uuid;

use crate::data_capture::activity_capture::ActivityCapture;
use crate::error_handling::types::{SandboxError, SessionError};
use crate::sandbox::provider::Sandbox;

/// A live sandbox connection paired with its attached capture.
///
/// Never persisted; the session's `sandbox_id` is its only durable trace.
pub struct SandboxHandle {
    session_id: Uuid,
    sandbox: Arc<dyn Sandbox>,
    capture: ActivityCapture,
}

impl SandboxHandle {
    pub fn new(session_id: Uuid, sandbox: Arc<dyn Sandbox>, capture: ActivityCapture) -> Self {
        Self {
            session_id,
            sandbox,
            capture,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        self.sandbox.sandbox_id()
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn pty_pid(&self) -> u32 {
        self.capture.pty_pid()
    }

    /// Whether the terminal behind this handle is still producing output.
    pub fn is_live(&self) -> bool {
        self.capture.is_alive()
    }

    pub async fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        self.sandbox
            .send_pty_input(self.pty_pid(), data)
            .await
            .map_err(|e| self.stale(e))
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.sandbox
            .resize_pty(self.pty_pid(), cols, rows)
            .await
            .map_err(|e| self.stale(e))
    }

    /// Detaches the file watcher only.
    pub fn stop_capture(&self) {
        self.capture.stop();
    }

    /// Stops all capture consumers, as when the handle is evicted.
    pub fn detach(&self) {
        self.capture.detach();
    }

    fn stale(&self, err: SandboxError) -> SessionError {
        warn!(
            "[{}] PTY {} on sandbox {} rejected a write: {}",
            self.session_id,
            self.pty_pid(),
            self.sandbox_id(),
            err
        );
        SessionError::StaleHandle(err.to_string())
    }
}
