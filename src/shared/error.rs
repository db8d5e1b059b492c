//! Usage: Unified application error model (maps internal failures to `CODE: message` strings)
//! plus the typed OAuth error taxonomy returned by the store and orchestrator APIs.

use std::sync::Arc;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct AppError {
    code: String,
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn split_code_message(raw: &str) -> Option<(&str, &str)> {
    let msg = raw.trim();
    let msg = msg.strip_prefix("Error:").unwrap_or(msg).trim();
    if msg.is_empty() {
        return None;
    }

    let (maybe_code, rest) = msg.split_once(':')?;
    let code = maybe_code.trim();
    if code.is_empty() {
        return None;
    }
    let mut chars = code.chars();
    let first = chars.next()?;
    if !first.is_ascii_uppercase() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_') {
        return None;
    }
    Some((code, rest.trim()))
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        if let Some((code, rest)) = split_code_message(&value) {
            let message = if rest.is_empty() { value.trim() } else { rest };
            return AppError::new(code.to_string(), message.to_string());
        }
        AppError::new("INTERNAL_ERROR", value)
    }
}

impl From<&'static str> for AppError {
    fn from(value: &'static str) -> Self {
        AppError::from(value.to_string())
    }
}

impl From<AppError> for String {
    fn from(value: AppError) -> Self {
        value.to_string()
    }
}

/// Failure taxonomy of the OAuth subsystem.
///
/// Every variant is a reported, terminal outcome; nothing in the subsystem aborts the
/// process to signal an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    #[error("unsupported oauth provider: {0}")]
    UnknownProvider(String),
    /// The worker could not be started (interpreter missing, script not writable, ...).
    #[error("failed to start authentication worker: {0}")]
    Spawn(String),
    /// Device-flow polling or the attempt deadline ran out.
    #[error("authentication timed out: {0}")]
    Timeout(String),
    /// Worker exited without reporting success; carries truncated diagnostics.
    #[error("authentication failed: {0}")]
    WorkerFailure(String),
    #[error("authentication already in progress for provider {0}")]
    AlreadyInProgress(String),
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("credential io error: {0}")]
    Io(String),
    #[error("authentication cancelled for provider {0}")]
    Cancelled(String),
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "SEC_INVALID_INPUT",
            Self::Spawn(_) => "OAUTH_SPAWN",
            Self::Timeout(_) => "OAUTH_TIMEOUT",
            Self::WorkerFailure(_) => "OAUTH_WORKER_FAILURE",
            Self::AlreadyInProgress(_) => "OAUTH_ALREADY_IN_PROGRESS",
            Self::NotFound(_) => "OAUTH_NOT_FOUND",
            Self::Io(_) => "OAUTH_IO",
            Self::Cancelled(_) => "OAUTH_CANCELLED",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<OAuthError> for AppError {
    fn from(value: OAuthError) -> Self {
        AppError::new(value.code(), value.to_string())
    }
}
