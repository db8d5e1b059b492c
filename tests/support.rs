#![allow(dead_code)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use aio_oauth_hub_lib::oauth::browser::BrowserOpener;
use aio_oauth_hub_lib::oauth::orchestrator::OrchestratorConfig;
use aio_oauth_hub_lib::{test_support, AppContext, AppResult};
use tempfile::TempDir;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct EnvRestore {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvRestore {
    fn save_once(&mut self, key: &'static str) {
        if self.saved.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.saved.push((key, std::env::var_os(key)));
    }

    fn remove_var(&mut self, key: &'static str) {
        self.save_once(key);
        std::env::remove_var(key);
    }

    pub fn set_var(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.save_once(key);
        std::env::set_var(key, value.into());
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Isolated working dir (credentials, settings, rendered scripts) with the hub's env
/// overrides cleared for the lifetime of the test.
pub struct TestWorkspace {
    _lock: MutexGuard<'static, ()>,
    env: EnvRestore,
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let lock = env_lock();
        let dir = tempfile::tempdir().expect("tempdir");

        let mut env = EnvRestore::default();
        env.remove_var("OAUTH_HUB_WORKING_DIR");
        env.remove_var("OAUTH_HUB_PYTHON");
        env.remove_var("OAUTH_HUB_NO_BROWSER");

        std::fs::create_dir_all(dir.path().join("scripts")).expect("scripts dir");
        Self {
            _lock: lock,
            env,
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn creds_dir(&self) -> PathBuf {
        self.path().join("oauth_creds")
    }

    pub fn script_dir(&self) -> PathBuf {
        self.path().join("scripts")
    }

    pub fn set_env(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.env.set_var(key, value);
    }

    pub fn write_credential(
        &self,
        provider_id: &str,
        sequence_number: u32,
        value: serde_json::Value,
    ) -> PathBuf {
        test_support::write_credential_json(self.path(), provider_id, sequence_number, &value)
            .expect("write credential")
    }

    /// Orchestrator config running `template` under `sh`.
    pub fn sh_config(&self, template: &str) -> OrchestratorConfig {
        let runtime = test_support::sh_runtime(template, &self.script_dir());
        test_support::fast_config(self.path(), runtime)
    }

    pub fn context(&self, config: OrchestratorConfig, opener: Arc<dyn BrowserOpener>) -> AppContext {
        test_support::app_context(self.path(), config, opener)
    }

    /// Rendered worker scripts still on disk.
    pub fn leftover_scripts(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.script_dir())
            .expect("read scripts dir")
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect()
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Records every URL it is asked to open.
#[derive(Default)]
pub struct RecordingBrowser {
    opened: Mutex<Vec<String>>,
}

impl RecordingBrowser {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("lock").clone()
    }
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) -> AppResult<()> {
        self.opened.lock().expect("lock").push(url.to_string());
        Ok(())
    }
}

/// `sh` worker that prints the URL marker, writes the next numbered record the way the
/// Python worker does, then reports success.
pub const SUCCESS_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
WORKING_DIR={{WORKING_DIR}}
CALLBACK_PORT={{CALLBACK_PORT}}
echo "Starting authentication for $PROVIDER_ID on port $CALLBACK_PORT"
echo "OAUTH_URL: https://auth.example.com/authorize?client=$PROVIDER_ID"
echo "OAUTH_URL: https://auth.example.com/authorize?client=$PROVIDER_ID"
mkdir -p "$WORKING_DIR/oauth_creds"
n=1
while [ -e "$WORKING_DIR/oauth_creds/${PROVIDER_ID}_oauth_${n}.json" ]; do n=$((n + 1)); done
tmp="$WORKING_DIR/oauth_creds/.${PROVIDER_ID}_${n}.tmp"
printf '{"access_token":"stub-access-token-0001","refresh_token":"r","expiry_date":4102444800000,"_proxy_metadata":{"email":"stub@example.com","provider_name":"%s"}}' "$PROVIDER_ID" > "$tmp"
mv "$tmp" "$WORKING_DIR/oauth_creds/${PROVIDER_ID}_oauth_${n}.json"
echo "AUTHENTICATION_SUCCESS"
"#;

/// Prints a bare URL without the marker and succeeds without writing a record.
pub const FALLBACK_URL_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
printf '\033[1mVisit https://device.example.com/verify?code=ABCD to continue\033[0m\n'
echo "AUTHENTICATION_SUCCESS"
"#;

pub const FAILING_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
echo "contacting provider"
echo "AUTHENTICATION_FAILED: invalid_grant from token endpoint" 1>&2
exit 1
"#;

/// Waits on the browser forever; only cancellation or the deadline ends it.
pub const HANGING_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
echo "OAUTH_URL: https://auth.example.com/slow"
exec sleep 60
"#;

/// Exits 0 without the success marker and with an error line on stderr.
pub const SILENT_ERROR_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
echo "Error: browser callback never arrived" 1>&2
exit 0
"#;

/// qwen device flow into an empty store: the URL, a pause for the user, then record #1.
pub const DEVICE_FLOW_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
WORKING_DIR={{WORKING_DIR}}
echo "OAUTH_URL:https://chat.qwen.ai/auth"
echo "Waiting for device authorization..."
sleep 0.3
mkdir -p "$WORKING_DIR/oauth_creds"
tmp="$WORKING_DIR/oauth_creds/.${PROVIDER_ID}_1.tmp"
printf '{"access_token":"qwen-device-token-0001","refresh_token":"r","expiry_date":4102444800000,"resource_url":"portal.qwen.ai","_proxy_metadata":{"email":"device@example.com"}}' > "$tmp"
mv "$tmp" "$WORKING_DIR/oauth_creds/${PROVIDER_ID}_oauth_1.json"
echo "AUTHENTICATION_SUCCESS"
"#;

/// Prints the URL and exits 0 straight away.
pub const QUICK_EXIT_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
echo "OAUTH_URL:https://chat.qwen.ai/auth"
exit 0
"#;

/// Ignores SIGTERM, so cancellation has to wait out the grace period.
pub const TERM_IGNORING_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
trap '' TERM
echo "OAUTH_URL: https://auth.example.com/stubborn"
while :; do sleep 0.1; done
"#;

/// Answers SIGTERM by claiming success and exiting cleanly.
pub const SUCCESS_ON_TERM_WORKER: &str = r#"PROVIDER_ID={{PROVIDER_ID}}
trap 'echo AUTHENTICATION_SUCCESS; exit 0' TERM
echo "OAUTH_URL: https://auth.example.com/pending"
while :; do sleep 0.1; done
"#;
