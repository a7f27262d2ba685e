//! Error type shared by every component of the counter store.

use thiserror::Error;

/// Errors surfaced by the usage counter store.
///
/// Only the synchronous, caller-observed operations (`enumerate`,
/// `suggest_date_range`, `prune`, construction) ever hand these back to a
/// caller. The record pipeline swallows them after logging.
#[derive(Debug, Error)]
pub enum UsageError {
    /// Invalid or incomplete configuration, detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The durable counter store failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A non-SQL counter store could not serve the request.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The recent-hit cache could not answer.
    #[error("recent-hit cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The sliding-window limiter could not answer.
    #[error("rate limiter unavailable: {0}")]
    LimiterUnavailable(String),

    /// A caller passed an argument the operation cannot serve.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for UsageError {
    fn from(err: toml::de::Error) -> Self {
        UsageError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for UsageError {
    fn from(err: serde_json::Error) -> Self {
        UsageError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UsageError>;
