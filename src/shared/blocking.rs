//! Usage: Run blocking filesystem work on the tokio blocking pool with a stable label.

use crate::shared::error::{AppError, AppResult, OAuthError};

pub async fn run<T, E>(
    label: &'static str,
    f: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> AppResult<T>
where
    T: Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    match join(label, f).await {
        Ok(result) => result.map_err(Into::into),
        Err(message) => Err(AppError::new("TASK_JOIN", message)),
    }
}

/// Same as [`run`] for orchestrator work; a join failure becomes `OAuthError::Io`.
pub async fn run_oauth<T>(
    label: &'static str,
    f: impl FnOnce() -> Result<T, OAuthError> + Send + 'static,
) -> Result<T, OAuthError>
where
    T: Send + 'static,
{
    match join(label, f).await {
        Ok(result) => result,
        Err(message) => Err(OAuthError::Io(message)),
    }
}

async fn join<T, E>(
    label: &'static str,
    f: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<Result<T, E>, String>
where
    T: Send + 'static,
    E: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result),
        Err(join_err) => {
            // Avoid forwarding JoinError display text to the UI: panic payloads may contain
            // credential content (e.g. a slicing error quoting part of a token).
            if join_err.is_panic() {
                tracing::error!(label, "blocking task panicked");
                return Err(format!("{label}: task panicked"));
            }

            tracing::warn!(label, "blocking task cancelled");
            Err(format!("{label}: task cancelled"))
        }
    }
}
