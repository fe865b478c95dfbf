use thiserror::Error;

use crate::domain::FetchError;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
