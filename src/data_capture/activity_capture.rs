use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::data_capture::terminal_log::spawn_terminal_log;
use crate::error_handling::types::CaptureError;
use crate::sandbox::provider::{FileEvent, PtyOptions, Sandbox};
use crate::storage::storage_trait::Storage;
use crate::storage::types::{EventType, NewEvent};
use crate::terminal_relay::broadcast_hub::{terminal_topic, BroadcastHub};

/// Knobs for one capture attachment.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub project_root: String,
    pub cols: u16,
    pub rows: u16,
    pub debounce: Duration,
}

/// Live recording of one sandbox: a file watcher and a terminal.
///
/// Terminal output fans out to two consumers. The pump publishes every chunk
/// to the session's broadcast topic as soon as it arrives, then hands the same
/// chunk to the debounced durable log. File events are stored one by one.
pub struct ActivityCapture {
    session_id: Uuid,
    pty_pid: u32,
    alive: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityCapture {
    pub async fn attach(
        sandbox: &Arc<dyn Sandbox>,
        session_id: Uuid,
        storage: Arc<dyn Storage>,
        hub: Arc<BroadcastHub>,
        settings: &CaptureSettings,
    ) -> Result<Self, CaptureError> {
        let events = sandbox
            .watch_dir(&settings.project_root)
            .await
            .map_err(CaptureError::WatcherFailed)?;
        let watcher = spawn_watcher(session_id, storage.clone(), events);

        let pty = match sandbox
            .create_pty(PtyOptions {
                cols: settings.cols,
                rows: settings.rows,
                cwd: &settings.project_root,
            })
            .await
        {
            Ok(pty) => pty,
            Err(e) => {
                watcher.abort();
                return Err(CaptureError::PtyFailed(e));
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        spawn_terminal_log(session_id, storage, settings.debounce, log_rx);

        let pump_alive = alive.clone();
        let topic = terminal_topic(session_id);
        let mut output = pty.output;
        let pump = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                let preview = &chunk[..chunk.len().min(64)];
                trace!(
                    "[{}] PTY chunk {} bytes: {}{}",
                    session_id,
                    chunk.len(),
                    String::from_utf8_lossy(preview),
                    if chunk.len() > 64 { " ..." } else { "" }
                );
                hub.publish(&topic, chunk.clone());
                let _ = log_tx.send(chunk);
            }
            pump_alive.store(false, Ordering::SeqCst);
            debug!("[{}] PTY output ended", session_id);
        });

        info!(
            "[{}] Capture attached to sandbox {} (pty {})",
            session_id,
            sandbox.sandbox_id(),
            pty.pid
        );
        Ok(Self {
            session_id,
            pty_pid: pty.pid,
            alive,
            watcher: Mutex::new(Some(watcher)),
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn pty_pid(&self) -> u32 {
        self.pty_pid
    }

    /// False once the PTY output stream has ended.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Detaches the file watcher. The sandbox and its terminal keep running.
    pub fn stop(&self) {
        if let Some(watcher) = take(&self.watcher) {
            watcher.abort();
            debug!("[{}] File watcher detached", self.session_id);
        }
    }

    /// Stops both consumers; buffered terminal output is still flushed.
    pub fn detach(&self) {
        self.stop();
        if let Some(pump) = take(&self.pump) {
            pump.abort();
            self.alive.store(false, Ordering::SeqCst);
            debug!("[{}] Terminal pump detached", self.session_id);
        }
    }
}

impl Drop for ActivityCapture {
    fn drop(&mut self) {
        self.detach();
    }
}

fn take(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn spawn_watcher(
    session_id: Uuid,
    storage: Arc<dyn Storage>,
    mut events: mpsc::Receiver<FileEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let raw = match serde_json::to_string(&event) {
                Ok(raw) => raw,
                Err(e) => {
                    error!("[{}] Unserializable file event: {}", session_id, e);
                    continue;
                }
            };
            let record = NewEvent::new(session_id, EventType::FileChange, raw)
                .with_metadata(serde_json::json!({"type": event.kind, "name": event.name}));
            if let Err(e) = storage.append_event(record).await {
                error!("[{}] Failed to record change to {}: {}", session_id, event.name, e);
            }
        }
        debug!("[{}] File watcher stream ended", session_id);
    })
}
