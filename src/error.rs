//! Error types for the content engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Prediction API error: {0}")]
    Prediction(#[from] PredictionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Deferred-action queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to enqueue action for hook {hook}: {reason}")]
    EnqueueFailed { hook: String, reason: String },

    #[error("No hook registered for {hook}")]
    UnknownHook { hook: String },

    #[error("Queue database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: i64 },

    #[error("No handler registered for task type {task_type}")]
    UnknownTaskType { task_type: String },

    #[error("Job {id} is already in final status {status}")]
    AlreadyFinal { id: i64, status: String },

    #[error("Failed to schedule dispatch for job {id}: {reason}")]
    ScheduleFailed { id: i64, reason: String },
}

/// Task handler execution errors — the unexpected-failure path. Known
/// failure modes are written as failed job statuses, not raised.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Missing parameter {name}")]
    MissingParameter { name: String },

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Prediction API error: {0}")]
    Prediction(#[from] PredictionError),
}

/// Prediction API client errors.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Prediction API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response from prediction API: {0}")]
    InvalidResponse(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
