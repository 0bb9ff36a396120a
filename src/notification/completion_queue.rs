use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::notification::evaluation_sink::{CompletionNotice, CompletionReason, EvaluationSink};
use crate::session_management::finalizer::SessionFinalizer;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for notice delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Producer side of the completion hand-off.
#[derive(Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<CompletionNotice>,
}

impl CompletionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, notice: CompletionNotice) {
        let session_id = notice.session_id;
        match self.tx.send(notice) {
            Ok(()) => debug!("[{}] Completion notice queued", session_id),
            Err(_) => error!("[{}] Completion worker is gone, notice lost", session_id),
        }
    }
}

/// Drains the queue: tears down submitted sessions, then delivers each notice.
pub struct CompletionWorker {
    rx: mpsc::UnboundedReceiver<CompletionNotice>,
    finalizer: Arc<SessionFinalizer>,
    sink: Arc<dyn EvaluationSink>,
    policy: RetryPolicy,
}

impl CompletionWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<CompletionNotice>,
        finalizer: Arc<SessionFinalizer>,
        sink: Arc<dyn EvaluationSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            rx,
            finalizer,
            sink,
            policy,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("Completion worker started");
        while let Some(notice) = self.rx.recv().await {
            if notice.reason == CompletionReason::Submitted {
                if let Err(e) = self.finalizer.finalize(notice.session_id).await {
                    error!("[{}] Teardown after submission failed: {}", notice.session_id, e);
                }
            }
            self.deliver(&notice).await;
        }
        info!("Completion worker stopped");
    }

    /// Retries with backoff until the sink accepts or attempts run out.
    async fn deliver(&self, notice: &CompletionNotice) {
        for attempt in 1..=self.policy.max_attempts {
            match self.sink.deliver(notice).await {
                Ok(()) => {
                    info!(
                        "[{}] Evaluator notified (attempt {})",
                        notice.session_id, attempt
                    );
                    return;
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "[{}] Evaluator delivery failed: {}, retrying in {:?}",
                        notice.session_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => error!(
                    "[{}] Giving up on evaluator after {} attempts: {}",
                    notice.session_id, attempt, e
                ),
            }
        }
    }
}
