use thiserror::Error;

/// Why a socket was refused at join time. Each variant maps to a distinct
/// WebSocket close code so clients can react without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRefusal {
    Unauthenticated,
    Forbidden,
    NotFound,
    Internal,
}

impl JoinRefusal {
    pub fn close_code(&self) -> u16 {
        match self {
            JoinRefusal::Unauthenticated => 4001,
            JoinRefusal::Forbidden => 4003,
            JoinRefusal::NotFound => 4004,
            JoinRefusal::Internal => 1011,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            JoinRefusal::Unauthenticated => "authentication required",
            JoinRefusal::Forbidden => "not a member of this conversation",
            JoinRefusal::NotFound => "conversation not found",
            JoinRefusal::Internal => "internal error",
        }
    }
}

/// Failure taxonomy for session actions. Every variant becomes a direct
/// error reply to the caller; nothing here is ever broadcast.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication required")]
    Unauthenticated,

    /// Capability failure: the caller lacks a role the action requires.
    #[error("{0}")]
    Forbidden(&'static str),

    /// The id does not resolve in this conversation. Also used when a
    /// resource exists but belongs to someone else, so callers cannot
    /// probe for out-of-scope ids; the log records the real cause.
    #[error("{0} not found in this conversation")]
    NotFound(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidInput {
        field: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl SessionError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SessionError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Client-facing reply text. Transient failures collapse to a generic
    /// message; details stay in the log.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Transient(_) => "internal error, please retry".to_string(),
            other => other.to_string(),
        }
    }
}
