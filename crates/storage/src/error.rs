use snafu::Snafu;

/// Failures surfaced by a [`crate::ChatStorage`] backend.
///
/// Every variant carries the `stage` that produced it so log lines can point at
/// the exact query or setup step.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("no {entity} row with id {id} (at `{stage}`)"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("`{raw}` is not a valid {id_type}: {source}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    /// Stored data contradicts itself, e.g. a block row that names another message.
    #[snafu(display("chat data is inconsistent at `{stage}`: {details}"))]
    BrokenInvariant {
        stage: &'static str,
        details: String,
    },

    #[snafu(display("cannot create database directory {path}: {source}"))]
    CreateDatabaseDir {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("`{database_url}` is not a usable sqlite location: {source}"))]
    DatabaseUrl {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open chat database `{database_url}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("`PRAGMA {pragma}` was rejected: {source}"))]
    ApplyPragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("chat schema migration failed: {source}"))]
    Migrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("query `{stage}` failed: {source}"))]
    Query {
        stage: &'static str,
        source: sqlx::Error,
    },

    #[snafu(display("cannot serialize {entity} payload at `{stage}`: {source}"))]
    EncodePayload {
        stage: &'static str,
        entity: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored {entity} payload for {id} is unreadable at `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        entity: &'static str,
        id: String,
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
