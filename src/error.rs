use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed store payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid value encoding for key {key}: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Invalid interval {value:?} for scheduled action {id}: {reason}")]
    InvalidInterval {
        id: String,
        value: String,
        reason: String,
    },

    #[error("Scheduled action {id} is missing required field {field}")]
    MissingField { id: String, field: &'static str },

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid action definition: {0}")]
    InvalidDefinition(String),

    #[error("No scheduled action found with id {0}")]
    ActionNotFound(String),

    #[error("Unsupported action type: {0}")]
    UnsupportedActionType(String),

    #[error("Dispatch of action {id} failed: {reason}")]
    Dispatch { id: String, reason: String },

    #[error("Session {0} is no longer valid")]
    SessionLost(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Wrap a store failure with the operation that produced it.
    pub fn store(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        SchedulerError::Store(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
