use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, trace};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::storage::storage_trait::Storage;
use crate::storage::types::{EventType, NewEvent};

/// Un-flushed terminal bytes and the pending flush deadline.
#[derive(Debug, Default)]
pub(crate) struct CaptureState {
    buffer: Vec<u8>,
    deadline: Option<Instant>,
}

impl CaptureState {
    /// Appends a chunk and pushes the flush deadline out to `now + window`.
    pub(crate) fn push(&mut self, chunk: &[u8], window: Duration) {
        self.buffer.extend_from_slice(chunk);
        self.deadline = Some(Instant::now() + window);
    }

    /// Empties the buffer, returning its contents as text.
    pub(crate) fn take(&mut self) -> Option<String> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Spawns the durable consumer of a session's terminal output.
///
/// Chunks arriving less than `window` apart are coalesced into one
/// `terminal_output` event; the timer restarts on every chunk. When the
/// sender side closes, whatever is still buffered is written out.
pub(crate) fn spawn_terminal_log(
    session_id: Uuid,
    storage: Arc<dyn Storage>,
    window: Duration,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = CaptureState::default();
        loop {
            let deadline = state.deadline;
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        trace!("[{}] buffered {} terminal bytes", session_id, chunk.len());
                        state.push(&chunk, window);
                    }
                    None => {
                        flush(session_id, storage.as_ref(), &mut state).await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    flush(session_id, storage.as_ref(), &mut state).await;
                }
            }
        }
        debug!("[{}] Terminal log closed", session_id);
    })
}

async fn flush(session_id: Uuid, storage: &dyn Storage, state: &mut CaptureState) {
    let Some(content) = state.take() else {
        return;
    };
    let len = content.len();
    match storage
        .append_event(NewEvent::new(session_id, EventType::TerminalOutput, content))
        .await
    {
        Ok(id) => debug!("[{}] Flushed {} terminal bytes as event #{}", session_id, len, id),
        Err(e) => error!("[{}] Dropped {} terminal bytes: {}", session_id, len, e),
    }
}
