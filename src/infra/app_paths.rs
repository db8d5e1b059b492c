//! Usage: Resolve the hub working directory (credential store root, settings, logs).

use crate::shared::error::AppResult;
use std::path::{Path, PathBuf};

pub const ENV_WORKING_DIR: &str = "OAUTH_HUB_WORKING_DIR";
const LOGS_DIR_NAME: &str = "logs";

/// Precedence: explicit flag, then `OAUTH_HUB_WORKING_DIR`, then the current directory.
pub fn resolve_working_dir(explicit: Option<&Path>) -> AppResult<PathBuf> {
    resolve_with(explicit, std::env::var_os(ENV_WORKING_DIR).map(PathBuf::from))
}

fn resolve_with(explicit: Option<&Path>, from_env: Option<PathBuf>) -> AppResult<PathBuf> {
    let chosen = explicit
        .map(Path::to_path_buf)
        .or_else(|| from_env.filter(|p| !p.as_os_str().is_empty()));

    let dir = match chosen {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => std::env::current_dir()
            .map_err(|e| format!("OAUTH_IO: failed to resolve current dir: {e}"))?
            .join(dir),
        None => std::env::current_dir()
            .map_err(|e| format!("OAUTH_IO: failed to resolve current dir: {e}"))?,
    };

    if dir.exists() && !dir.is_dir() {
        return Err(format!(
            "SEC_INVALID_INPUT: working dir is not a directory: {}",
            dir.display()
        )
        .into());
    }
    Ok(dir)
}

pub fn logs_dir(working_dir: &Path) -> PathBuf {
    working_dir.join(LOGS_DIR_NAME)
}
