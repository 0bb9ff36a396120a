//! Storage Trait
//!
//! This module defines the `Storage` trait, the durable store behind sessions,
//! challenges and the append-only activity log.
//!
//! Implementors of this trait are responsible for:
//! - Persisting and retrieving session records
//! - Appending activity events with a monotonically increasing id
//! - Serving the challenge file set a session was provisioned from
//!
//! All methods return a `Result` to handle potential storage errors.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::storage::types::{ActivityEvent, Challenge, NewEvent, Session};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetches a session by id, `None` when it does not exist.
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StorageError>;

    /// Inserts or fully replaces a session record.
    async fn save_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Appends one activity event and returns its assigned id.
    async fn append_event(&self, event: NewEvent) -> Result<i64, StorageError>;

    /// Returns every event of a session in insertion order.
    async fn get_events(&self, session_id: Uuid) -> Result<Vec<ActivityEvent>, StorageError>;

    async fn save_challenge(&self, challenge: &Challenge) -> Result<(), StorageError>;

    async fn get_challenge(&self, challenge_id: Uuid) -> Result<Option<Challenge>, StorageError>;
}
