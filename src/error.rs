use thiserror::Error;

use crate::refine::model::Rid;

/// Errors produced while refining references.
#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Reference {0} has no usable bibliographic text")]
    InputMissing(Rid),

    #[error("Daily search quota exceeded: {requested} queries requested, {remaining} remaining")]
    QuotaExceeded { requested: u32, remaining: u32 },

    #[error("Network request failed: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Remote returned HTTP {0}")]
    HttpStatus(u16),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Every search query failed for reference {rid}: {last_error}")]
    SearchExhausted { rid: Rid, last_error: String },

    #[error("Scoring oracle failed: {0}")]
    OracleFailure(String),

    #[error("Decision for reference {rid} is incomplete: {reason}")]
    DecisionIncomplete { rid: Rid, reason: String },

    #[error("Reference {0} not found")]
    ReferenceNotFound(Rid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefineError {
    /// Whether the failure is worth retrying: transport hiccups, timeouts,
    /// rate limiting and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            RefineError::NetworkError(e) => {
                if e.is_decode() || e.is_builder() {
                    return false;
                }
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    return true;
                }
                e.status()
                    .map(|s| s.as_u16() == 429 || s.is_server_error())
                    .unwrap_or(true)
            }
            RefineError::Timeout => true,
            RefineError::HttpStatus(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Whether the failure was a timeout rather than a hard transport error.
    pub fn is_timeout(&self) -> bool {
        match self {
            RefineError::Timeout => true,
            RefineError::NetworkError(e) => e.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RefineError>;
