use std::io;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, RedcellErr>;

#[derive(Error, Debug)]
pub enum RedcellErr {
    /// A permission request was denied: by the user, by the policy hook, or
    /// because the engine was torn down while the request was pending. The
    /// session id is always the root of the requesting tree.
    #[error("permission rejected: {reason}")]
    Rejected {
        session_id: String,
        permission_id: String,
        call_id: Option<String>,
        metadata: Option<Value>,
        reason: String,
    },

    /// The caller aborted the current operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The model stream disconnected or errored out before it finished. The
    /// processor treats this as transient and retries the turn with backoff.
    ///
    /// Optionally includes the delay the transport asked for before retrying.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// A stream error the retry policy refuses to retry. Recorded on the
    /// assistant message and surfaced as a `session.error` event.
    #[error("fatal stream error: {0}")]
    FatalStream(String),

    /// Retry limit exceeded; carries the last stream error message.
    #[error("exceeded retry limit: {0}")]
    RetryLimit(String),

    #[error("unknown session: {0}")]
    SessionNotFound(String),

    #[error("unknown message: {0}")]
    MessageNotFound(String),

    #[error("unknown agent type: {0}")]
    AgentNotFound(String),

    /// The caller's permission ruleset denies dispatching this agent type.
    #[error("agent type denied by caller ruleset: {0}")]
    AgentDenied(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl RedcellErr {
    pub fn is_rejected(&self) -> bool {
        matches!(self, RedcellErr::Rejected { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RedcellErr::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_formats_reason() {
        let err = RedcellErr::Rejected {
            session_id: "ses_000000000000".to_string(),
            permission_id: "per_000000000003".to_string(),
            call_id: None,
            metadata: None,
            reason: "denied by user".to_string(),
        };
        assert_eq!(err.to_string(), "permission rejected: denied by user");
        assert!(err.is_rejected());
    }
}
