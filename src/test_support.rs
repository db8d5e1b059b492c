//! Usage: Public test helpers for integration tests.

use crate::app::app_state::AppContext;
use crate::domain::oauth_credentials::{credential_file_name, CREDENTIALS_DIR_NAME};
use crate::infra::settings::HubSettings;
use crate::oauth::browser::BrowserOpener;
use crate::oauth::orchestrator::{OrchestratorConfig, WorkerRuntime};
use crate::oauth::worker_script::{ScriptMaterializer, WorkerTemplate};
use crate::shared::error::AppResult;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Write `<working_dir>/oauth_creds/<provider>_oauth_<n>.json` verbatim.
pub fn write_credential_json(
    working_dir: &Path,
    provider_id: &str,
    sequence_number: u32,
    value: &serde_json::Value,
) -> AppResult<PathBuf> {
    let dir = working_dir.join(CREDENTIALS_DIR_NAME);
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("SYSTEM_ERROR: failed to create {}: {e}", dir.display()))?;
    let path = dir.join(credential_file_name(provider_id, sequence_number));
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize json: {e}"))?;
    std::fs::write(&path, bytes)
        .map_err(|e| format!("SYSTEM_ERROR: failed to write {}: {e}", path.display()))?;
    Ok(path)
}

/// A worker runtime that feeds the rendered template to `sh` instead of Python.
pub fn sh_runtime(template_source: &str, script_dir: &Path) -> WorkerRuntime {
    WorkerRuntime {
        interpreter: OsString::from("sh"),
        interpreter_args: Vec::new(),
        materializer: ScriptMaterializer::new(WorkerTemplate::new(template_source, "sh"), script_dir),
        extra_env: Vec::new(),
    }
}

/// Orchestrator timings short enough for tests.
pub fn fast_config(working_dir: &Path, runtime: WorkerRuntime) -> OrchestratorConfig {
    OrchestratorConfig {
        working_dir: working_dir.to_path_buf(),
        runtime,
        cancel_grace: Duration::from_millis(500),
        settle_delay: Duration::from_millis(10),
        attempt_timeout: Duration::from_secs(20),
        failure_detail_max_chars: 1500,
        open_browser: true,
        callback_port_overrides: BTreeMap::new(),
    }
}

pub fn app_context(
    working_dir: &Path,
    config: OrchestratorConfig,
    opener: Arc<dyn BrowserOpener>,
) -> AppContext {
    AppContext::from_parts(working_dir, HubSettings::default(), config, opener)
}
