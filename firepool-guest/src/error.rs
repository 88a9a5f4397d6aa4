//! Error types for the guest agent.

use std::path::PathBuf;

/// Errors raised inside the runner VM.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GuestError {
    /// The metadata service could not be reached.
    #[error("metadata request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The metadata service answered with a non-200 status.
    #[error("metadata service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The document is not valid runner metadata JSON.
    #[error("invalid metadata document: {0}")]
    Decode(#[from] serde_json::Error),

    /// The document lacks a field the runner cannot start without.
    #[error("missing required metadata field: {0}")]
    MissingField(&'static str),

    /// Waiting was cancelled before a usable document arrived.
    #[error("cancelled while waiting for metadata")]
    Cancelled,

    /// The runner binary could not be started.
    #[error("failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured owner is not in the guest's account database.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// The runner process exited unsuccessfully.
    #[error("gitlab-runner exited with {}", code.map_or_else(|| "a signal".to_owned(), |c| format!("code {c}")))]
    RunnerFailed { code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
