use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Conflict updating {kind} {name}: stale resource version")]
    Conflict { kind: &'static str, name: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// True for errors that mean the object is gone; queues forget these
    /// instead of retrying.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for optimistic-concurrency failures; callers re-fetch and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
