//! Error types for the flagkit SDK.
//!
//! The public surface is [`SdkError`]. Evaluation never surfaces errors to
//! the caller — invalid input and internal failures degrade to the `control`
//! treatment — so `SdkError` only appears on factory construction, readiness
//! waits, and configuration loading.
use thiserror::Error;

/// Errors surfaced by factory construction and lifecycle operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SdkError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("timed out after {0} ms waiting for the sdk to become ready")]
    ReadyTimeout(u64),
    #[error("factory already destroyed")]
    Destroyed,
    #[error("failed to read localhost flag file {path}: {source}")]
    LocalhostFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse localhost flag file: {0}")]
    LocalhostParse(String),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SdkError>;
