use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::error_handling::types::SessionError;
use crate::session_management::sandbox_handle::SandboxHandle;
use crate::session_management::session_registry::SessionRegistry;
use crate::terminal_relay::broadcast_hub::{terminal_topic, BroadcastHub};

/// Form feed; the shell answers it by redrawing a single clean prompt.
pub const CLEAR_SCREEN: &[u8] = b"\x0c";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Output side of an attached terminal, fed by the session's broadcast topic.
pub struct TerminalStream {
    session_id: Uuid,
    receiver: broadcast::Receiver<Bytes>,
}

impl TerminalStream {
    /// Next output chunk in arrival order; `None` once the topic is gone.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(chunk) => return Some(chunk),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(n)) => {
                    warn!("[{}] Terminal viewer lagged, skipped {} chunks", self.session_id, n);
                }
            }
        }
    }
}

/// Bridges a client terminal emulator to a session's sandbox PTY.
pub struct TerminalRelay {
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    settle_delay: Duration,
}

impl TerminalRelay {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<BroadcastHub>, settle_delay: Duration) -> Self {
        Self {
            registry,
            hub,
            settle_delay,
        }
    }

    /// Forwards keystrokes to the PTY, reconnecting once if the handle is stale.
    pub async fn send_input(&self, session_id: Uuid, data: &[u8]) -> Result<(), SessionError> {
        let data = data.to_vec();
        self.with_retry(session_id, move |handle| {
            let data = data.clone();
            async move { handle.send_input(&data).await }
        })
        .await
    }

    /// Sends a new window size through the input path. Subscribers may see the redraw.
    pub async fn resize(&self, session_id: Uuid, size: TerminalSize) -> Result<(), SessionError> {
        self.with_retry(session_id, move |handle| async move {
            handle.resize(size.cols, size.rows).await
        })
        .await
    }

    /// Attaches a viewer so that its first output is one clean prompt.
    ///
    /// The size is applied before subscribing, so the shell's resize redraw is
    /// published to nobody and dropped. After the settle delay the viewer
    /// subscribes, and only then is a clear-screen sent to produce the prompt
    /// it actually sees. The subscription is live when `subscribe` returns,
    /// so the clear-screen can never race ahead of it.
    pub async fn attach(
        &self,
        session_id: Uuid,
        size: TerminalSize,
    ) -> Result<TerminalStream, SessionError> {
        self.resize(session_id, size).await?;
        tokio::time::sleep(self.settle_delay).await;

        let receiver = self.hub.subscribe(&terminal_topic(session_id));
        self.send_input(session_id, CLEAR_SCREEN).await?;

        info!(
            "[{}] Terminal attached at {}x{}",
            session_id, size.cols, size.rows
        );
        Ok(TerminalStream {
            session_id,
            receiver,
        })
    }

    async fn with_retry<F, Fut>(&self, session_id: Uuid, op: F) -> Result<(), SessionError>
    where
        F: Fn(Arc<SandboxHandle>) -> Fut,
        Fut: std::future::Future<Output = Result<(), SessionError>>,
    {
        let handle = self
            .registry
            .get_or_reconnect(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(String::from("No active sandbox")))?;

        match op(handle.clone()).await {
            Ok(()) => Ok(()),
            Err(SessionError::StaleHandle(reason)) => {
                debug!("[{}] Stale handle ({}), reconnecting once", session_id, reason);
                let handle = self
                    .registry
                    .force_reconnect(session_id, Some(&handle))
                    .await?
                    .ok_or_else(|| {
                        SessionError::Unavailable(String::from("Sandbox reconnection failed"))
                    })?;
                op(handle).await.map_err(|e| {
                    warn!("[{}] Retry after reconnect failed: {}", session_id, e);
                    SessionError::Unavailable(String::from("Sandbox unavailable after reconnect"))
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::activity_capture::CaptureSettings;
    use crate::test_support::{FakeProvider, FakeSandbox, MemStorage, CLEAN_PROMPT};
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        storage: Arc<MemStorage>,
        provider: Arc<FakeProvider>,
        fake: Arc<FakeSandbox>,
        hub: Arc<BroadcastHub>,
        relay: TerminalRelay,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemStorage::new());
        let provider = Arc::new(FakeProvider::new());
        let fake = provider.add_sandbox("sbx-1");
        let hub = Arc::new(BroadcastHub::new());
        let registry = Arc::new(SessionRegistry::new(
            storage.clone(),
            provider.clone(),
            hub.clone(),
            CaptureSettings {
                project_root: "/home/user/project".into(),
                cols: 120,
                rows: 40,
                debounce: Duration::from_millis(500),
            },
        ));
        let relay = TerminalRelay::new(registry, hub.clone(), Duration::from_millis(150));
        Fixture {
            storage,
            provider,
            fake,
            hub,
            relay,
        }
    }

    #[tokio::test]
    async fn input_reaches_the_pty() {
        let f = fixture();
        let session_id = f.storage.seed_active_session(&[], "sbx-1");

        f.relay.send_input(session_id, b"ls\r").await.unwrap();
        assert_eq!(f.fake.pty_input(), vec![b"ls\r".to_vec()]);
    }

    #[tokio::test]
    async fn stale_write_reconnects_once_and_retries() {
        let f = fixture();
        let session_id = f.storage.seed_active_session(&[], "sbx-1");
        f.relay.send_input(session_id, b"a").await.unwrap();

        f.fake.fail_next_pty_writes(1);
        f.relay.send_input(session_id, b"b").await.unwrap();

        assert_eq!(f.fake.pty_input(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(f.provider.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_is_unavailable() {
        let f = fixture();
        let session_id = f.storage.seed_active_session(&[], "sbx-1");

        f.fake.fail_next_pty_writes(2);
        let result = f.relay.send_input(session_id, b"x").await;

        assert!(matches!(result, Err(SessionError::Unavailable(_))));
        assert_eq!(f.provider.connects.load(Ordering::SeqCst), 2);
        assert!(f.fake.pty_input().is_empty());
    }

    #[tokio::test]
    async fn failed_reconnect_is_unavailable() {
        let f = fixture();
        let session_id = f.storage.seed_active_session(&[], "sbx-1");
        f.relay.send_input(session_id, b"a").await.unwrap();

        f.fake.fail_next_pty_writes(1);
        f.provider.fail_connect.store(true, Ordering::SeqCst);
        assert_eq!(
            f.relay.send_input(session_id, b"b").await,
            Err(SessionError::Unavailable("Sandbox reconnection failed".into()))
        );
    }

    #[tokio::test]
    async fn no_sandbox_is_not_found() {
        let f = fixture();
        let session_id = f.storage.seed_session(&[]);
        assert!(matches!(
            f.relay.send_input(session_id, b"x").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn attach_sees_only_the_clean_prompt() {
        let f = fixture();
        let session_id = f.storage.seed_active_session(&[], "sbx-1");

        let mut stream = f
            .relay
            .attach(session_id, TerminalSize { cols: 100, rows: 30 })
            .await
            .unwrap();

        assert_eq!(f.fake.resizes(), vec![(100, 30)]);
        assert_eq!(f.fake.pty_input(), vec![CLEAR_SCREEN.to_vec()]);
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(CLEAN_PROMPT));
        assert!(matches!(stream.receiver.try_recv(), Err(TryRecvError::Empty)));

        f.fake.emit_output(b"$ ls\r\n").await;
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"$ ls\r\n"));
        assert_eq!(f.hub.subscriber_count(&terminal_topic(session_id)), 1);
    }
}
