use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an interview session.
///
/// `Completed` is final: no sandbox may be created or reconnected afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(format!("unknown session status {}", other)),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub challenge_id: Option<Uuid>,
    pub status: SessionStatus,
    /// Persisted once a sandbox exists; the only durable trace of a live handle.
    pub sandbox_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(challenge_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            challenge_id,
            status: SessionStatus::Pending,
            sandbox_id: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// Generated challenge content, read by the core but never written during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Uuid,
    /// Brief written as the project README.
    pub description: String,
    /// Relative path to file content.
    pub generated_files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    FileChange,
    TerminalOutput,
    CodeRun,
    Submission,
    SessionEnd,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::FileChange => "file_change",
            EventType::TerminalOutput => "terminal_output",
            EventType::CodeRun => "code_run",
            EventType::Submission => "submission",
            EventType::SessionEnd => "session_end",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_start" => Ok(EventType::SessionStart),
            "file_change" => Ok(EventType::FileChange),
            "terminal_output" => Ok(EventType::TerminalOutput),
            "code_run" => Ok(EventType::CodeRun),
            "submission" => Ok(EventType::Submission),
            "session_end" => Ok(EventType::SessionEnd),
            other => Err(format!("unknown event type {}", other)),
        }
    }
}

/// One append-only activity log record, ordered by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub session_id: Uuid,
    pub event_type: EventType,
    pub raw_content: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// An activity event before the store assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub session_id: Uuid,
    pub event_type: EventType,
    pub raw_content: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(session_id: Uuid, event_type: EventType, raw_content: impl Into<String>) -> Self {
        Self {
            session_id,
            event_type,
            raw_content: raw_content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
