//! Usage: Persisted hub settings (`<working_dir>/oauth_hub_settings.json`: schema + read/write helpers).

use crate::domain::oauth_providers;
use crate::infra::atomic_file::write_file_atomic;
use crate::shared::error::AppResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCHEMA_VERSION: u32 = 1;
pub const SETTINGS_FILE_NAME: &str = "oauth_hub_settings.json";

pub const ENV_PYTHON: &str = "OAUTH_HUB_PYTHON";
pub const ENV_NO_BROWSER: &str = "OAUTH_HUB_NO_BROWSER";

const DEFAULT_CANCEL_GRACE_SECONDS: u32 = 5;
const DEFAULT_SETTLE_DELAY_MS: u32 = 1000;
const DEFAULT_ATTEMPT_TIMEOUT_SECONDS: u32 = 300;
const DEFAULT_FAILURE_DETAIL_MAX_CHARS: u32 = 1500;
const MAX_CANCEL_GRACE_SECONDS: u32 = 60;
const MAX_SETTLE_DELAY_MS: u32 = 10_000;
const MAX_ATTEMPT_TIMEOUT_SECONDS: u32 = 60 * 60;
const MAX_FAILURE_DETAIL_MAX_CHARS: u32 = 20_000;

#[cfg(windows)]
const DEFAULT_PYTHON_INTERPRETER: &str = "python";
#[cfg(not(windows))]
const DEFAULT_PYTHON_INTERPRETER: &str = "python3";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub schema_version: u32,
    pub python_interpreter: String,
    // Custom worker template; the bundled Python worker is used when unset.
    pub worker_template_path: Option<String>,
    // Directory for materialized worker scripts; the OS temp dir when unset.
    pub script_dir: Option<String>,
    pub cancel_grace_seconds: u32,
    pub settle_delay_ms: u32,
    pub attempt_timeout_seconds: u32,
    pub failure_detail_max_chars: u32,
    pub open_browser: bool,
    pub callback_port_overrides: BTreeMap<String, u16>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            python_interpreter: DEFAULT_PYTHON_INTERPRETER.to_string(),
            worker_template_path: None,
            script_dir: None,
            cancel_grace_seconds: DEFAULT_CANCEL_GRACE_SECONDS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            attempt_timeout_seconds: DEFAULT_ATTEMPT_TIMEOUT_SECONDS,
            failure_detail_max_chars: DEFAULT_FAILURE_DETAIL_MAX_CHARS,
            open_browser: true,
            callback_port_overrides: BTreeMap::new(),
        }
    }
}

impl HubSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(u64::from(self.cancel_grace_seconds))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.settle_delay_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.attempt_timeout_seconds))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(python) = lookup(ENV_PYTHON) {
            let python = python.trim();
            if !python.is_empty() {
                self.python_interpreter = python.to_string();
            }
        }
        if let Some(flag) = lookup(ENV_NO_BROWSER) {
            if is_truthy(&flag) {
                self.open_browser = false;
            }
        }
    }
}

pub(crate) fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn sanitize_timing_settings(settings: &mut HubSettings) -> bool {
    let mut changed = false;

    if settings.cancel_grace_seconds == 0 {
        settings.cancel_grace_seconds = DEFAULT_CANCEL_GRACE_SECONDS;
        changed = true;
    }
    if settings.cancel_grace_seconds > MAX_CANCEL_GRACE_SECONDS {
        settings.cancel_grace_seconds = MAX_CANCEL_GRACE_SECONDS;
        changed = true;
    }

    if settings.settle_delay_ms > MAX_SETTLE_DELAY_MS {
        settings.settle_delay_ms = MAX_SETTLE_DELAY_MS;
        changed = true;
    }

    if settings.attempt_timeout_seconds == 0 {
        settings.attempt_timeout_seconds = DEFAULT_ATTEMPT_TIMEOUT_SECONDS;
        changed = true;
    }
    if settings.attempt_timeout_seconds > MAX_ATTEMPT_TIMEOUT_SECONDS {
        settings.attempt_timeout_seconds = MAX_ATTEMPT_TIMEOUT_SECONDS;
        changed = true;
    }

    changed
}

fn sanitize_failure_detail_limit(settings: &mut HubSettings) -> bool {
    if settings.failure_detail_max_chars == 0 {
        settings.failure_detail_max_chars = DEFAULT_FAILURE_DETAIL_MAX_CHARS;
        return true;
    }
    if settings.failure_detail_max_chars > MAX_FAILURE_DETAIL_MAX_CHARS {
        settings.failure_detail_max_chars = MAX_FAILURE_DETAIL_MAX_CHARS;
        return true;
    }
    false
}

fn sanitize_interpreter(settings: &mut HubSettings) -> bool {
    let trimmed = settings.python_interpreter.trim();
    if trimmed.is_empty() {
        settings.python_interpreter = DEFAULT_PYTHON_INTERPRETER.to_string();
        return true;
    }
    if trimmed.len() != settings.python_interpreter.len() {
        settings.python_interpreter = trimmed.to_string();
        return true;
    }
    false
}

fn sanitize_port_overrides(settings: &mut HubSettings) -> bool {
    let before = settings.callback_port_overrides.len();
    settings.callback_port_overrides.retain(|provider_id, _| {
        let known = oauth_providers::find(provider_id).is_some();
        if !known {
            tracing::warn!(provider_id = %provider_id, "ignoring callback port override for unknown provider");
        }
        known
    });
    before != settings.callback_port_overrides.len()
}

fn sanitize(settings: &mut HubSettings) -> bool {
    let mut repaired = false;
    repaired |= sanitize_timing_settings(settings);
    repaired |= sanitize_failure_detail_limit(settings);
    repaired |= sanitize_interpreter(settings);
    repaired |= sanitize_port_overrides(settings);
    if settings.schema_version != SCHEMA_VERSION {
        settings.schema_version = SCHEMA_VERSION;
        repaired = true;
    }
    repaired
}

pub fn settings_path(working_dir: &Path) -> PathBuf {
    working_dir.join(SETTINGS_FILE_NAME)
}

fn parse_settings_json(content: &str) -> AppResult<HubSettings> {
    serde_json::from_str(content)
        .map_err(|e| format!("SEC_INVALID_INPUT: failed to parse {SETTINGS_FILE_NAME}: {e}").into())
}

/// Read settings; a missing file yields defaults. Values are sanitized but not persisted.
pub fn read(working_dir: &Path) -> AppResult<HubSettings> {
    let path = settings_path(working_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HubSettings::default());
        }
        Err(err) => {
            return Err(format!("OAUTH_IO: failed to read {}: {err}", path.display()).into());
        }
    };

    let mut settings = parse_settings_json(&content)?;
    if sanitize(&mut settings) {
        tracing::debug!(path = %path.display(), "hub settings repaired in memory");
    }
    Ok(settings)
}

/// Fail-open variant for startup: warns and falls back to defaults, then applies env overrides.
pub fn load_effective(working_dir: &Path) -> HubSettings {
    let mut settings = match read(working_dir) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!("hub settings unreadable, using defaults: {}", err);
            HubSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

pub fn write(working_dir: &Path, settings: &HubSettings) -> AppResult<HubSettings> {
    if settings.cancel_grace_seconds == 0 || settings.cancel_grace_seconds > MAX_CANCEL_GRACE_SECONDS {
        return Err(format!(
            "SEC_INVALID_INPUT: cancel_grace_seconds must be between 1 and {MAX_CANCEL_GRACE_SECONDS}"
        )
        .into());
    }
    if settings.attempt_timeout_seconds == 0
        || settings.attempt_timeout_seconds > MAX_ATTEMPT_TIMEOUT_SECONDS
    {
        return Err(format!(
            "SEC_INVALID_INPUT: attempt_timeout_seconds must be between 1 and {MAX_ATTEMPT_TIMEOUT_SECONDS}"
        )
        .into());
    }
    if settings.settle_delay_ms > MAX_SETTLE_DELAY_MS {
        return Err(format!(
            "SEC_INVALID_INPUT: settle_delay_ms must be <= {MAX_SETTLE_DELAY_MS}"
        )
        .into());
    }
    if settings.failure_detail_max_chars == 0
        || settings.failure_detail_max_chars > MAX_FAILURE_DETAIL_MAX_CHARS
    {
        return Err(format!(
            "SEC_INVALID_INPUT: failure_detail_max_chars must be between 1 and {MAX_FAILURE_DETAIL_MAX_CHARS}"
        )
        .into());
    }
    if settings.python_interpreter.trim().is_empty() {
        return Err("SEC_INVALID_INPUT: python_interpreter is required".into());
    }
    if let Some(unknown) = settings
        .callback_port_overrides
        .keys()
        .find(|id| oauth_providers::find(id).is_none())
    {
        return Err(format!("SEC_INVALID_INPUT: unknown provider in callback_port_overrides: {unknown}").into());
    }

    let mut next = settings.clone();
    next.schema_version = SCHEMA_VERSION;

    let path = settings_path(working_dir);
    let content = serde_json::to_vec_pretty(&next)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize settings: {e}"))?;
    write_file_atomic(&path, &content)
        .map_err(|e| format!("OAUTH_IO: failed to write {}: {e}", path.display()))?;

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = read(dir.path()).expect("read");
        assert_eq!(settings, HubSettings::default());
        assert_eq!(settings.attempt_timeout(), Duration::from_secs(300));
        assert_eq!(settings.cancel_grace(), Duration::from_secs(5));
    }

    #[test]
    fn read_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            settings_path(dir.path()),
            r#"{"open_browser": false, "settle_delay_ms": 0}"#,
        )
        .expect("write");

        let settings = read(dir.path()).expect("read");
        assert!(!settings.open_browser);
        assert_eq!(settings.settle_delay_ms, 0);
        assert_eq!(settings.failure_detail_max_chars, 1500);
        assert_eq!(settings.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn read_rejects_invalid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(settings_path(dir.path()), "{oops").expect("write");
        let err = read(dir.path()).expect_err("invalid json");
        assert_eq!(err.code(), "SEC_INVALID_INPUT");
    }

    #[test]
    fn sanitize_resets_zero_and_clamps_excessive_values() {
        let mut settings = HubSettings {
            cancel_grace_seconds: 0,
            attempt_timeout_seconds: 999_999,
            settle_delay_ms: 999_999,
            failure_detail_max_chars: 0,
            python_interpreter: "  ".to_string(),
            ..HubSettings::default()
        };
        assert!(sanitize(&mut settings));
        assert_eq!(settings.cancel_grace_seconds, DEFAULT_CANCEL_GRACE_SECONDS);
        assert_eq!(settings.attempt_timeout_seconds, MAX_ATTEMPT_TIMEOUT_SECONDS);
        assert_eq!(settings.settle_delay_ms, MAX_SETTLE_DELAY_MS);
        assert_eq!(settings.failure_detail_max_chars, DEFAULT_FAILURE_DETAIL_MAX_CHARS);
        assert_eq!(settings.python_interpreter, DEFAULT_PYTHON_INTERPRETER);
    }

    #[test]
    fn sanitize_no_change_for_defaults() {
        let mut settings = HubSettings::default();
        assert!(!sanitize(&mut settings));
    }

    #[test]
    fn sanitize_drops_overrides_for_unknown_providers() {
        let mut settings = HubSettings::default();
        settings.callback_port_overrides.insert("iflow".to_string(), 12000);
        settings.callback_port_overrides.insert("nope".to_string(), 1);
        assert!(sanitize(&mut settings));
        assert_eq!(settings.callback_port_overrides.get("iflow"), Some(&12000));
        assert!(!settings.callback_port_overrides.contains_key("nope"));
    }

    #[test]
    fn env_overrides_replace_interpreter_and_disable_browser() {
        let mut settings = HubSettings::default();
        settings.apply_overrides_from(|key| match key {
            ENV_PYTHON => Some(" /opt/py/bin/python ".to_string()),
            ENV_NO_BROWSER => Some("YES".to_string()),
            _ => None,
        });
        assert_eq!(settings.python_interpreter, "/opt/py/bin/python");
        assert!(!settings.open_browser);

        let mut untouched = HubSettings::default();
        untouched.apply_overrides_from(|key| (key == ENV_NO_BROWSER).then(|| "0".to_string()));
        assert!(untouched.open_browser);
    }

    #[test]
    fn write_validates_then_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bad = HubSettings {
            cancel_grace_seconds: 0,
            ..HubSettings::default()
        };
        assert!(write(dir.path(), &bad).is_err());

        let mut good = HubSettings::default();
        good.callback_port_overrides.insert("antigravity".to_string(), 51200);
        write(dir.path(), &good).expect("write");
        assert_eq!(read(dir.path()).expect("read"), good);
    }
}
