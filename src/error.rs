use std::fmt;

/// Crate-wide error taxonomy. Mirrors the teacher's hand-rolled `OrderError`
/// (manual `Display`, no `thiserror`) rather than introducing a new dependency.
#[derive(Debug)]
pub enum AgentError {
    Config(String),
    Auth(String),
    Transport(String),
    Exchange { status: u16, body: String },
    NotFound(String),
    SafetyTrip(String),
    FatalInvariant(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Config(msg) => write!(f, "config error: {msg}"),
            AgentError::Auth(msg) => write!(f, "auth error: {msg}"),
            AgentError::Transport(msg) => write!(f, "transport error: {msg}"),
            AgentError::Exchange { status, body } => {
                write!(f, "exchange error ({status}): {body}")
            }
            AgentError::NotFound(what) => write!(f, "not found: {what}"),
            AgentError::SafetyTrip(reason) => write!(f, "safety trip: {reason}"),
            AgentError::FatalInvariant(reason) => write!(f, "fatal invariant: {reason}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl AgentError {
    /// 404-on-cancel / 404-on-query are benign per the Order Manager's
    /// reconciliation rules; everything else (notably 429) is not.
    pub fn is_benign_not_found(&self) -> bool {
        match self {
            AgentError::NotFound(_) => true,
            AgentError::Exchange { status, body } => {
                *status == 404 || body.to_lowercase().contains("not found")
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AgentError::Exchange { status: 429, .. })
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
