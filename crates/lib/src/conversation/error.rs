use serde::Serialize;

use crate::persist::PersistError;
use crate::stream::StreamError;

/// Errors surfaced to the caller. Failures inside a running turn never show up here; they end
/// the turn with [`super::TurnEnd::Failed`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("unknown thread: {0}")]
    UnknownThread(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// User-facing classification of a turn failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    Overloaded,
    Timeout,
    UsageLimit,
    Other(String),
}

impl ErrorKind {
    /// Classify a stream failure. Transport timeouts are recognized by kind because reqwest's
    /// display text does not mention them.
    pub fn from_stream_error(error: &StreamError) -> Self {
        match error {
            StreamError::Request(e) if e.is_timeout() => ErrorKind::Timeout,
            StreamError::Overloaded => ErrorKind::Overloaded,
            other => Self::classify(&other.to_string()),
        }
    }

    pub fn classify(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("high traffic") || lower.contains("overloaded") {
            ErrorKind::Overloaded
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorKind::Timeout
        } else if lower.contains("quota") || lower.contains("rate limit") {
            ErrorKind::UsageLimit
        } else {
            ErrorKind::Other(text.to_string())
        }
    }

    /// Text placed in the synthetic assistant message.
    pub fn user_message(&self) -> String {
        match self {
            ErrorKind::Overloaded => {
                "Claude's servers are busy right now. Please try again in a moment.".to_string()
            }
            ErrorKind::Timeout => {
                "The request took too long to complete. Please try again.".to_string()
            }
            ErrorKind::UsageLimit => {
                "You've reached your usage limit for Claude. Please try again later.".to_string()
            }
            ErrorKind::Other(text) if text.trim().is_empty() => {
                "Something went wrong. Please try again.".to_string()
            }
            ErrorKind::Other(text) => text.clone(),
        }
    }
}
