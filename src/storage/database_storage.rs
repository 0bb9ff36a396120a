use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use uuid::Uuid;

use crate::error_handling::types::StorageError;
use crate::storage::db_entities::{challenges, events, sessions};
use crate::storage::storage_trait::Storage;
use crate::storage::types::{ActivityEvent, Challenge, NewEvent, Session};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS challenges (
        id TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        generated_files TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        challenge_id TEXT,
        status TEXT NOT NULL,
        sandbox_id TEXT,
        started_at TEXT,
        ended_at TEXT
    );",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        raw_content TEXT NOT NULL,
        metadata TEXT,
        timestamp TEXT NOT NULL,
        FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );",
    "CREATE INDEX IF NOT EXISTS events_session_idx ON events(session_id, id);",
];

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            error!("Invalid timestamp {:?} in database: {}", raw, e);
            StorageError::ReadFailed
        })
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|e| {
        error!("Invalid uuid {:?} in database: {}", raw, e);
        StorageError::ReadFailed
    })
}

impl TryFrom<sessions::Model> for Session {
    type Error = StorageError;

    fn try_from(row: sessions::Model) -> Result<Self, Self::Error> {
        Ok(Session {
            id: parse_uuid(&row.id)?,
            challenge_id: row.challenge_id.as_deref().map(parse_uuid).transpose()?,
            status: row.status.parse().map_err(|e: String| {
                error!("{}", e);
                StorageError::ReadFailed
            })?,
            sandbox_id: row.sandbox_id,
            started_at: row.started_at.as_deref().map(parse_time).transpose()?,
            ended_at: row.ended_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

impl TryFrom<events::Model> for ActivityEvent {
    type Error = StorageError;

    fn try_from(row: events::Model) -> Result<Self, Self::Error> {
        let metadata = match row.metadata {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                error!("Invalid metadata JSON for event {}: {}", row.id, e);
                StorageError::ReadFailed
            })?),
            None => None,
        };
        Ok(ActivityEvent {
            id: row.id,
            session_id: parse_uuid(&row.session_id)?,
            event_type: row.event_type.parse().map_err(|e: String| {
                error!("{}", e);
                StorageError::ReadFailed
            })?,
            raw_content: row.raw_content,
            metadata,
            timestamp: parse_time(&row.timestamp)?,
        })
    }
}

/// SQLite-backed durable store built on SeaORM.
pub struct DatabaseStorage {
    db: DatabaseConnection,
}

impl DatabaseStorage {
    /// Opens (creating if missing) the database file and ensures the schema exists.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create database directory {}: {}", parent.display(), e);
                StorageError::WriteFailed
            })?;
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let mut options = ConnectOptions::new(url);
        options
            .max_connections(5)
            .sqlx_logging(false)
            .map_sqlx_sqlite_opts(|opts| opts.foreign_keys(true));
        let db = Database::connect(options).await.map_err(|e| {
            error!("Failed to open database {}: {}", path.display(), e);
            StorageError::ConnectionFailed
        })?;

        for statement in SCHEMA {
            db.execute_unprepared(statement).await.map_err(|e| {
                error!("Failed to create schema: {}", e);
                StorageError::WriteFailed
            })?;
        }

        info!("DatabaseStorage opened at {}", path.display());
        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for DatabaseStorage {
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StorageError> {
        let row = sessions::Entity::find_by_id(session_id.to_string())
            .one(&self.db)
            .await
            .map_err(|e| {
                error!("[{}] Failed to load session: {}", session_id, e);
                StorageError::ReadFailed
            })?;
        row.map(Session::try_from).transpose()
    }

    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let model = sessions::ActiveModel {
            id: Set(session.id.to_string()),
            challenge_id: Set(session.challenge_id.map(|c| c.to_string())),
            status: Set(session.status.as_str().to_string()),
            sandbox_id: Set(session.sandbox_id.clone()),
            started_at: Set(session.started_at.map(|d| d.to_rfc3339())),
            ended_at: Set(session.ended_at.map(|d| d.to_rfc3339())),
        };
        sessions::Entity::insert(model)
            .on_conflict(
                OnConflict::column(sessions::Column::Id)
                    .update_columns([
                        sessions::Column::ChallengeId,
                        sessions::Column::Status,
                        sessions::Column::SandboxId,
                        sessions::Column::StartedAt,
                        sessions::Column::EndedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                error!("[{}] Failed to save session: {}", session.id, e);
                StorageError::WriteFailed
            })?;
        debug!("[{}] Session saved with status {}", session.id, session.status);
        Ok(())
    }

    async fn append_event(&self, event: NewEvent) -> Result<i64, StorageError> {
        let metadata = match &event.metadata {
            Some(value) => Some(serde_json::to_string(value).map_err(|e| {
                error!("[{}] Failed to encode event metadata: {}", event.session_id, e);
                StorageError::WriteFailed
            })?),
            None => None,
        };
        let model = events::ActiveModel {
            session_id: Set(event.session_id.to_string()),
            event_type: Set(event.event_type.as_str().to_string()),
            raw_content: Set(event.raw_content),
            metadata: Set(metadata),
            timestamp: Set(Utc::now().to_rfc3339()),
            ..Default::default()
        };
        let result = events::Entity::insert(model)
            .exec(&self.db)
            .await
            .map_err(|e| {
                error!("[{}] Failed to append event: {}", event.session_id, e);
                StorageError::WriteFailed
            })?;
        debug!(
            "[{}] Appended {} event #{}",
            event.session_id,
            event.event_type.as_str(),
            result.last_insert_id
        );
        Ok(result.last_insert_id)
    }

    async fn get_events(&self, session_id: Uuid) -> Result<Vec<ActivityEvent>, StorageError> {
        let rows = events::Entity::find()
            .filter(events::Column::SessionId.eq(session_id.to_string()))
            .order_by_asc(events::Column::Id)
            .all(&self.db)
            .await
            .map_err(|e| {
                error!("[{}] Failed to load events: {}", session_id, e);
                StorageError::ReadFailed
            })?;
        rows.into_iter().map(ActivityEvent::try_from).collect()
    }

    async fn save_challenge(&self, challenge: &Challenge) -> Result<(), StorageError> {
        let files = serde_json::to_string(&challenge.generated_files).map_err(|e| {
            error!("Failed to encode challenge files: {}", e);
            StorageError::WriteFailed
        })?;
        let model = challenges::ActiveModel {
            id: Set(challenge.id.to_string()),
            description: Set(challenge.description.clone()),
            generated_files: Set(files),
        };
        challenges::Entity::insert(model)
            .on_conflict(
                OnConflict::column(challenges::Column::Id)
                    .update_columns([
                        challenges::Column::Description,
                        challenges::Column::GeneratedFiles,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to save challenge {}: {}", challenge.id, e);
                StorageError::WriteFailed
            })?;
        Ok(())
    }

    async fn get_challenge(&self, challenge_id: Uuid) -> Result<Option<Challenge>, StorageError> {
        let row = challenges::Entity::find_by_id(challenge_id.to_string())
            .one(&self.db)
            .await
            .map_err(|e| {
                error!("Failed to load challenge {}: {}", challenge_id, e);
                StorageError::ReadFailed
            })?;
        match row {
            Some(row) => Ok(Some(Challenge {
                id: parse_uuid(&row.id)?,
                description: row.description,
                generated_files: serde_json::from_str(&row.generated_files).map_err(|e| {
                    error!("Invalid file set for challenge {}: {}", row.id, e);
                    StorageError::ReadFailed
                })?,
            })),
            None => Ok(None),
        }
    }
}
