use crate::core::rate_limit::RateLimitSnapshot;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentFeedError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config parse error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    // Admission outcomes. Unknown, expired and malformed credentials all
    // collapse into `Unauthenticated`.
    #[error("Invalid or missing API key")]
    Unauthenticated,
    #[error("Rate limit exceeded, retry after {} seconds", .0.retry_after_secs.unwrap_or(1))]
    Throttled(RateLimitSnapshot),
    #[error("Content blocked: potential prompt injection detected ({})", .reasons.join(", "))]
    ContentRejected { reasons: Vec<String> },
    #[error("{0}")]
    Malformed(String),
}

impl AgentFeedError {
    /// Transport status the caller should surface for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Throttled(_) => 429,
            Self::ContentRejected { .. } | Self::Malformed(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// True for the four terminal admission outcomes, false for infrastructure
    /// failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::Throttled(_)
                | Self::ContentRejected { .. }
                | Self::Malformed(_)
        )
    }
}
