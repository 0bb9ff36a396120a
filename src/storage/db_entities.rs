//! SeaORM entity models used by the database storage backend.
//!
//! These structs map to the SQLite tables created by `database_storage`:
//! - `sessions`: session lifecycle and the persisted sandbox identifier
//! - `events`: the append-only activity log, ordered by autoincrement id
//! - `challenges`: generated brief and file set a session is provisioned from

/// Sessions table entity models.
pub mod sessions {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "sessions")]
    pub struct Model {
        /// UUID as string primary key
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        /// Optional UUID of the challenge record
        pub challenge_id: Option<String>,
        /// Lowercase status string (`pending`, `active`, `completed`)
        pub status: String,
        /// Remote sandbox identifier, once provisioned
        pub sandbox_id: Option<String>,
        /// RFC3339 timestamps
        pub started_at: Option<String>,
        pub ended_at: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::events::Entity")]
        Events,
    }

    impl Related<super::events::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Events.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// Events table entity models.
pub mod events {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "events")]
    pub struct Model {
        /// Monotonic insertion id
        #[sea_orm(primary_key)]
        pub id: i64,
        /// Foreign key to `sessions.id`
        pub session_id: String,
        pub event_type: String,
        pub raw_content: String,
        /// JSON text, if any
        pub metadata: Option<String>,
        /// RFC3339 timestamp
        pub timestamp: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        /// Belongs to a session
        #[sea_orm(
            belongs_to = "super::sessions::Entity",
            from = "Column::SessionId",
            to = "super::sessions::Column::Id"
        )]
        Session,
    }

    impl Related<super::sessions::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Session.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// Challenges table entity models.
pub mod challenges {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "challenges")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub description: String,
        /// JSON object of path to content
        pub generated_files: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
