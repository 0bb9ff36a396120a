use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::error_handling::types::NotificationError;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// The candidate submitted; the sandbox still has to be torn down.
    Submitted,
    /// The session was ended explicitly and is already torn down.
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionNotice {
    pub session_id: Uuid,
    pub reason: CompletionReason,
    pub tests_passed: Option<bool>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionNotice {
    pub fn submitted(session_id: Uuid, tests_passed: bool) -> Self {
        Self {
            session_id,
            reason: CompletionReason::Submitted,
            tests_passed: Some(tests_passed),
            completed_at: Utc::now(),
        }
    }

    pub fn ended(session_id: Uuid) -> Self {
        Self {
            session_id,
            reason: CompletionReason::Ended,
            tests_passed: None,
            completed_at: Utc::now(),
        }
    }
}

/// Receiver of finished sessions, typically the summary generator.
#[async_trait]
pub trait EvaluationSink: Send + Sync {
    async fn deliver(&self, notice: &CompletionNotice) -> Result<(), NotificationError>;
}

/// Posts each notice as JSON to `{base_url}/sessions/{id}/end`.
pub struct HttpEvaluationSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEvaluationSink {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, session_id: Uuid) -> String {
        format!("{}/sessions/{}/end", self.base_url, session_id)
    }
}

#[async_trait]
impl EvaluationSink for HttpEvaluationSink {
    async fn deliver(&self, notice: &CompletionNotice) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.endpoint(notice.session_id))
            .timeout(DELIVERY_TIMEOUT)
            .json(notice)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected(status.as_u16()))
        }
    }
}

/// Used when no evaluator is configured; notices only reach the log.
pub struct LogEvaluationSink;

#[async_trait]
impl EvaluationSink for LogEvaluationSink {
    async fn deliver(&self, notice: &CompletionNotice) -> Result<(), NotificationError> {
        info!(
            "[{}] Session complete ({:?}, tests passed: {:?}), no evaluator configured",
            notice.session_id, notice.reason, notice.tests_passed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let sink = HttpEvaluationSink::new("http://evaluator.local/api/");
        let id = Uuid::nil();
        assert_eq!(
            sink.endpoint(id),
            "http://evaluator.local/api/sessions/00000000-0000-0000-0000-000000000000/end"
        );
    }

    #[test]
    fn notice_serializes_reason_in_lowercase() {
        let notice = CompletionNotice::submitted(Uuid::nil(), false);
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["reason"], "submitted");
        assert_eq!(json["tests_passed"], false);
        assert_eq!(serde_json::to_value(CompletionNotice::ended(Uuid::nil())).unwrap()["tests_passed"], serde_json::Value::Null);
    }
}
