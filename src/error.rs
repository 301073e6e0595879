//! Error types for the worker engine.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Ledger database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the external job queue or queryable tables.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue {namespace} query failed: {reason}")]
    Query { namespace: String, reason: String },

    #[error("Job {table_name}/{key_hash} not found in {namespace}")]
    NotFound {
        namespace: String,
        table_name: String,
        key_hash: String,
    },

    #[error("Connection listing failed: {0}")]
    Connections(String),
}

/// Step registration and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Table '{table}' is not an auto-populated table - unable to add to worker")]
    InvalidStep { table: String },

    #[error("Populate of {process} failed: {reason}")]
    Populate { process: String, reason: String },
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected response status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Result type alias for the worker engine.
pub type Result<T> = std::result::Result<T, Error>;
