mod app;
pub mod commands;
pub mod domain;
pub mod infra;
pub mod oauth;
mod shared;
pub mod test_support;

pub use app::app_state::AppContext;
pub use app::{cli, logging};
pub(crate) use shared::blocking;
pub use shared::error::{AppError, AppResult, OAuthError};

/// Resolve the working dir, install logging and run one parsed command.
pub async fn run(cli: cli::Cli) -> AppResult<()> {
    let working_dir = infra::app_paths::resolve_working_dir(cli.working_dir.as_deref())?;
    // Dropping the guard flushes the file log.
    let _log_guard = logging::init(&working_dir, cli.verbose)?;

    // Global panic hook: the payload is not logged to avoid leaking credential material.
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(location = %location, "PANIC: aio-oauth-hub panicked at {location}");
    }));

    tracing::debug!(working_dir = %working_dir.display(), "aio-oauth-hub starting");
    let ctx = AppContext::load(&working_dir)?;
    let result = cli::run(cli, &ctx).await;
    let cancelled = ctx.orchestrator().shutdown();
    if cancelled > 0 {
        tracing::warn!(cancelled, "exited with live oauth attempts");
    }
    result
}
