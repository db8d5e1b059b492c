//! Usage: Per-provider authentication attempts (spawn worker, open browser, reconcile the store).
//!
//! At most one attempt per provider is live at a time. `start` resolves only when its
//! attempt reaches a terminal state; progress is published on a broadcast channel.

use super::browser::BrowserOpener;
use super::protocol::{self, Disposition, ProtocolEvent, ProtocolParser};
use super::supervisor::{self, CancelHandle, ExitReport, StreamKind, WorkerCommand};
use super::worker_script::{ScriptMaterializer, WorkerTemplate};
use crate::domain::oauth_credentials::{CredentialStore, CredentialSummary};
use crate::domain::oauth_providers::{self, ProviderDescriptor};
use crate::infra::settings::HubSettings;
use crate::shared::blocking;
use crate::shared::error::OAuthError;
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::now_unix_millis;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Starting,
    Running,
    BrowserReady,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::BrowserReady => "browser_ready",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSnapshot {
    pub provider_id: String,
    pub attempt_id: u64,
    pub state: AttemptState,
    pub callback_port: u16,
    pub authorization_url: Option<String>,
    pub script_path: Option<PathBuf>,
    pub worker_pid: Option<u32>,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEventKind {
    StateChanged { state: AttemptState },
    BrowserReady { url: String, opened: bool },
    Progress { stream: StreamKind, line: String },
    Finished { state: AttemptState, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthEvent {
    pub provider_id: String,
    pub attempt_id: u64,
    #[serde(flatten)]
    pub kind: AuthEventKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub provider_id: String,
    pub attempt_id: u64,
    pub credentials: Vec<CredentialSummary>,
    /// Highest-numbered record that did not exist before the attempt started.
    pub new_record: Option<CredentialSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelOutcome {
    pub updated: bool,
    pub path: PathBuf,
    /// Another record of the same provider already carrying this label.
    pub duplicate_of: Option<u32>,
}

/// How the worker is launched: `<interpreter> <interpreter_args...> <script>`.
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    pub interpreter: OsString,
    pub interpreter_args: Vec<OsString>,
    pub materializer: ScriptMaterializer,
    pub extra_env: Vec<(String, String)>,
}

impl WorkerRuntime {
    pub fn python(interpreter: impl Into<OsString>, materializer: ScriptMaterializer) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: vec![OsString::from("-u")],
            materializer,
            extra_env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub working_dir: PathBuf,
    pub runtime: WorkerRuntime,
    pub cancel_grace: Duration,
    pub settle_delay: Duration,
    pub attempt_timeout: Duration,
    pub failure_detail_max_chars: usize,
    pub open_browser: bool,
    pub callback_port_overrides: BTreeMap<String, u16>,
}

impl OrchestratorConfig {
    pub fn from_settings(working_dir: &Path, settings: &HubSettings) -> Result<Self, OAuthError> {
        let template = match settings.worker_template_path.as_deref() {
            Some(path) if !path.trim().is_empty() => WorkerTemplate::from_file(Path::new(path))?,
            _ => WorkerTemplate::default(),
        };
        let script_dir = settings
            .script_dir
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            runtime: WorkerRuntime::python(
                settings.python_interpreter.clone(),
                ScriptMaterializer::new(template, script_dir),
            ),
            cancel_grace: settings.cancel_grace(),
            settle_delay: settings.settle_delay(),
            attempt_timeout: settings.attempt_timeout(),
            failure_detail_max_chars: settings.failure_detail_max_chars as usize,
            open_browser: settings.open_browser,
            callback_port_overrides: settings.callback_port_overrides.clone(),
        })
    }

    fn callback_port(&self, provider: &ProviderDescriptor, explicit: Option<u16>) -> u16 {
        explicit
            .or_else(|| self.callback_port_overrides.get(provider.id).copied())
            .unwrap_or(provider.default_callback_port)
    }
}

struct LiveAttempt {
    snapshot: AttemptSnapshot,
    cancel: CancelHandle,
}

pub struct OAuthOrchestrator {
    store: CredentialStore,
    config: OrchestratorConfig,
    browser: Arc<dyn BrowserOpener>,
    attempts: Mutex<HashMap<String, LiveAttempt>>,
    next_attempt_id: AtomicU64,
    events: broadcast::Sender<AuthEvent>,
}

/// Removes the live-attempt entry on every exit path of `start`. If the `start` future is
/// dropped mid-attempt the worker is cancelled too.
struct AttemptGuard<'a> {
    orchestrator: &'a OAuthOrchestrator,
    provider_id: &'static str,
    attempt_id: u64,
    cancel: CancelHandle,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let mut attempts = self.orchestrator.attempts.lock_or_recover();
        if attempts
            .get(self.provider_id)
            .is_some_and(|a| a.snapshot.attempt_id == self.attempt_id)
        {
            attempts.remove(self.provider_id);
        }
    }
}

impl OAuthOrchestrator {
    pub fn new(
        store: CredentialStore,
        config: OrchestratorConfig,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            config,
            browser,
            attempts: Mutex::new(HashMap::new()),
            next_attempt_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn providers(&self) -> &'static [ProviderDescriptor] {
        oauth_providers::all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn attempt_snapshot(&self, provider_id: &str) -> Option<AttemptSnapshot> {
        self.attempts
            .lock_or_recover()
            .get(provider_id)
            .map(|a| a.snapshot.clone())
    }

    pub fn live_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.attempts.lock_or_recover().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request cancellation of the live attempt; `false` when none is live.
    pub fn cancel(&self, provider_id: &str) -> bool {
        let attempts = self.attempts.lock_or_recover();
        let Some(attempt) = attempts.get(provider_id.trim()) else {
            return false;
        };
        // The flag is set before the worker is signalled, so the exit is seen as cancelled.
        if attempt.cancel.cancel() {
            tracing::info!(
                provider_id = %attempt.snapshot.provider_id,
                attempt_id = attempt.snapshot.attempt_id,
                "oauth attempt cancel requested"
            );
        }
        true
    }

    /// Cancel every live attempt; returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let attempts = self.attempts.lock_or_recover();
        let mut cancelled = 0;
        for attempt in attempts.values() {
            attempt.cancel.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "oauth orchestrator shutdown: live attempts cancelled");
        }
        cancelled
    }

    fn emit(&self, provider_id: &str, attempt_id: u64, kind: AuthEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(AuthEvent {
            provider_id: provider_id.to_string(),
            attempt_id,
            kind,
        });
    }

    fn update_snapshot(&self, provider_id: &str, attempt_id: u64, f: impl FnOnce(&mut AttemptSnapshot)) {
        let mut attempts = self.attempts.lock_or_recover();
        if let Some(attempt) = attempts
            .get_mut(provider_id)
            .filter(|a| a.snapshot.attempt_id == attempt_id)
        {
            f(&mut attempt.snapshot);
        }
    }

    fn set_state(&self, provider_id: &str, attempt_id: u64, state: AttemptState) {
        self.update_snapshot(provider_id, attempt_id, |s| s.state = state);
        if !state.is_terminal() {
            self.emit(provider_id, attempt_id, AuthEventKind::StateChanged { state });
        }
    }

    fn finish<T>(
        &self,
        provider_id: &str,
        attempt_id: u64,
        result: Result<T, OAuthError>,
        success_message: impl FnOnce(&T) -> String,
    ) -> Result<T, OAuthError> {
        let (state, message) = match &result {
            Ok(value) => (AttemptState::Succeeded, success_message(value)),
            Err(err) if err.is_cancelled() => (AttemptState::Cancelled, "authentication cancelled".to_string()),
            Err(err) => (AttemptState::Failed, err.to_string()),
        };
        self.update_snapshot(provider_id, attempt_id, |s| s.state = state);

        match state {
            AttemptState::Succeeded => {
                tracing::info!(provider_id, attempt_id, "oauth attempt succeeded");
            }
            AttemptState::Cancelled => {
                tracing::info!(provider_id, attempt_id, "oauth attempt cancelled");
            }
            _ => {
                tracing::warn!(provider_id, attempt_id, "oauth attempt failed: {}", message);
            }
        }
        self.emit(provider_id, attempt_id, AuthEventKind::Finished { state, message });
        result
    }

    /// Run one authentication attempt to its terminal state.
    pub async fn start(
        &self,
        provider_id: &str,
        callback_port: Option<u16>,
    ) -> Result<LoginOutcome, OAuthError> {
        let provider = oauth_providers::find(provider_id)
            .ok_or_else(|| OAuthError::UnknownProvider(provider_id.trim().to_string()))?;
        let port = self.config.callback_port(provider, callback_port);

        let attempt_id = self.next_attempt_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelHandle::default();
        {
            let mut attempts = self.attempts.lock_or_recover();
            if attempts.contains_key(provider.id) {
                return Err(OAuthError::AlreadyInProgress(provider.id.to_string()));
            }
            attempts.insert(
                provider.id.to_string(),
                LiveAttempt {
                    snapshot: AttemptSnapshot {
                        provider_id: provider.id.to_string(),
                        attempt_id,
                        state: AttemptState::Starting,
                        callback_port: port,
                        authorization_url: None,
                        script_path: None,
                        worker_pid: None,
                        started_at_ms: now_unix_millis(),
                    },
                    cancel: cancel.clone(),
                },
            );
        }
        let _guard = AttemptGuard {
            orchestrator: self,
            provider_id: provider.id,
            attempt_id,
            cancel: cancel.clone(),
        };

        tracing::info!(provider_id = provider.id, attempt_id, callback_port = port, "oauth attempt started");
        self.emit(
            provider.id,
            attempt_id,
            AuthEventKind::StateChanged {
                state: AttemptState::Starting,
            },
        );

        let result = self.run_attempt(provider, attempt_id, port, cancel).await;
        self.finish(provider.id, attempt_id, result, |outcome| match &outcome.new_record {
            Some(record) => format!(
                "authentication succeeded; saved {} ({})",
                record.file_name,
                record.email.as_deref().unwrap_or("no email")
            ),
            None => "authentication succeeded; no new credential file found".to_string(),
        })
    }

    async fn run_attempt(
        &self,
        provider: &'static ProviderDescriptor,
        attempt_id: u64,
        port: u16,
        cancel: CancelHandle,
    ) -> Result<LoginOutcome, OAuthError> {
        let baseline = {
            let store = self.store.clone();
            blocking::run_oauth("oauth_next_sequence_number", move || {
                store.next_sequence_number(provider.id)
            })
            .await?
        };

        if cancel.is_requested() {
            return Err(OAuthError::Cancelled(provider.id.to_string()));
        }

        let runtime = &self.config.runtime;
        let script = runtime
            .materializer
            .materialize(provider.id, port, &self.config.working_dir)?;
        let script_path = script.path().to_path_buf();
        self.update_snapshot(provider.id, attempt_id, |s| s.script_path = Some(script_path.clone()));

        let mut command = WorkerCommand::new(runtime.interpreter.clone(), &self.config.working_dir);
        for arg in &runtime.interpreter_args {
            command = command.arg(arg.clone());
        }
        command = command
            .arg(script_path.as_os_str())
            .env("ELECTRON_OAUTH_MODE", "1");
        if port != 0 {
            command = command.env("OAUTH_CALLBACK_PORT", port.to_string());
        }
        for (key, value) in &runtime.extra_env {
            command = command.env(key.clone(), value.clone());
        }

        let (process, mut output) = supervisor::spawn(&command, self.config.cancel_grace, cancel.clone())?;
        let pid = process.pid();
        self.update_snapshot(provider.id, attempt_id, |s| s.worker_pid = pid);
        self.set_state(provider.id, attempt_id, AttemptState::Running);
        tracing::debug!(provider_id = provider.id, attempt_id, pid = ?pid, "oauth worker running");

        let mut parser = ProtocolParser::default();
        let mut browser_opened = false;
        let mut output_open = true;
        let mut deadline_passed = false;
        let mut timed_out = false;

        let mut waiter = tokio::spawn(process.wait());
        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);

        let report = loop {
            tokio::select! {
                biased;
                chunk = output.recv(), if output_open => match chunk {
                    Some(chunk) => {
                        let events = parser.feed(chunk.stream, &chunk.bytes);
                        self.apply_events(provider.id, attempt_id, events, &mut browser_opened);
                    }
                    None => output_open = false,
                },
                joined = &mut waiter => {
                    break joined.unwrap_or_else(|err| {
                        tracing::error!(provider_id = provider.id, attempt_id, "worker wait task failed: {}", err);
                        ExitReport {
                            code: None,
                            cancel_requested: cancel.is_requested(),
                            forced: false,
                        }
                    });
                }
                _ = &mut deadline, if !deadline_passed => {
                    deadline_passed = true;
                    // An explicit cancel already in flight keeps its outcome.
                    timed_out = !cancel.is_requested();
                    tracing::warn!(
                        provider_id = provider.id,
                        attempt_id,
                        timeout_ms = self.config.attempt_timeout.as_millis() as u64,
                        cancelled = !timed_out,
                        "oauth attempt deadline reached, terminating worker"
                    );
                    cancel.cancel();
                }
            }
        };

        // Output still buffered in the pipes belongs to this attempt. The worker's process
        // group is gone by now; a helper that left the group must not stall the result.
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while output_open {
            match tokio::time::timeout_at(drain_deadline, output.recv()).await {
                Ok(Some(chunk)) => {
                    let events = parser.feed(chunk.stream, &chunk.bytes);
                    self.apply_events(provider.id, attempt_id, events, &mut browser_opened);
                }
                _ => output_open = false,
            }
        }
        let tail = parser.finish();
        self.apply_events(provider.id, attempt_id, tail, &mut browser_opened);

        tracing::debug!(
            provider_id = provider.id,
            attempt_id,
            exit_code = ?report.code,
            cancel_requested = report.cancel_requested,
            forced = report.forced,
            completed = parser.completed(),
            "oauth worker exited"
        );

        if timed_out {
            return Err(OAuthError::Timeout(format!(
                "no result within {:?}",
                self.config.attempt_timeout
            )));
        }

        // A cancel that lands after the exit but before it is processed here still wins.
        let cancel_requested = report.cancel_requested || cancel.is_requested();
        match protocol::disposition(
            parser.completed(),
            report.code,
            parser.stderr_text(),
            cancel_requested,
        ) {
            Disposition::Cancelled => Err(OAuthError::Cancelled(provider.id.to_string())),
            Disposition::Failed => Err(protocol::failure_error(protocol::failure_detail(
                parser.stdout_text(),
                parser.stderr_text(),
                report.code,
                self.config.failure_detail_max_chars,
            ))),
            Disposition::Succeeded => {
                // Let the worker's rename settle before re-listing the store.
                tokio::time::sleep(self.config.settle_delay).await;
                let store = self.store.clone();
                let credentials = blocking::run_oauth("oauth_list_after_login", move || {
                    store.list(provider.id)
                })
                .await?;
                let new_record = credentials
                    .iter()
                    .filter(|c| c.sequence_number >= baseline)
                    .max_by_key(|c| c.sequence_number)
                    .cloned();
                Ok(LoginOutcome {
                    provider_id: provider.id.to_string(),
                    attempt_id,
                    credentials,
                    new_record,
                })
            }
        }
    }

    fn apply_events(
        &self,
        provider_id: &str,
        attempt_id: u64,
        events: Vec<ProtocolEvent>,
        browser_opened: &mut bool,
    ) {
        for event in events {
            match event {
                ProtocolEvent::BrowserReady { url, from_marker } => {
                    let first = !*browser_opened;
                    *browser_opened = true;
                    let opened = first && self.try_open_browser(provider_id, attempt_id, &url);
                    tracing::info!(provider_id, attempt_id, from_marker, opened, "authorization url received");

                    let mut entered_browser_ready = false;
                    self.update_snapshot(provider_id, attempt_id, |s| {
                        s.authorization_url = Some(url.clone());
                        if s.state == AttemptState::Running {
                            s.state = AttemptState::BrowserReady;
                            entered_browser_ready = true;
                        }
                    });
                    if entered_browser_ready {
                        self.emit(
                            provider_id,
                            attempt_id,
                            AuthEventKind::StateChanged {
                                state: AttemptState::BrowserReady,
                            },
                        );
                    }
                    self.emit(provider_id, attempt_id, AuthEventKind::BrowserReady { url, opened });
                }
                ProtocolEvent::Progress { stream, line } => {
                    tracing::debug!(provider_id, attempt_id, stream = stream.as_str(), "worker: {}", line);
                    self.emit(provider_id, attempt_id, AuthEventKind::Progress { stream, line });
                }
            }
        }
    }

    fn try_open_browser(&self, provider_id: &str, attempt_id: u64, url: &str) -> bool {
        if !self.config.open_browser {
            return false;
        }
        match self.browser.open(url) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(provider_id, attempt_id, "failed to open browser: {}", err);
                false
            }
        }
    }

    /// Attach a human label (stored as `_proxy_metadata.email`) to a record.
    /// `None` or blank leaves the record untouched.
    pub async fn label_credential(
        &self,
        provider_id: &str,
        sequence_number: u32,
        label: Option<&str>,
    ) -> Result<LabelOutcome, OAuthError> {
        let provider = oauth_providers::find(provider_id)
            .ok_or_else(|| OAuthError::UnknownProvider(provider_id.trim().to_string()))?;
        let path = self.store.credential_path(provider.id, sequence_number);
        let Some(label) = label.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(LabelOutcome {
                updated: false,
                path,
                duplicate_of: None,
            });
        };

        let store = self.store.clone();
        let label = label.to_string();
        blocking::run_oauth("oauth_label_credential", move || {
            let duplicate_of = store
                .find_by_email(provider.id, &label)?
                .filter(|n| *n != sequence_number);
            store.update_email(&path, &label)?;
            if let Some(other) = duplicate_of {
                tracing::warn!(
                    provider_id = provider.id,
                    sequence_number,
                    duplicate_of = other,
                    "label already used by another credential"
                );
            }
            Ok(LabelOutcome {
                updated: true,
                path,
                duplicate_of,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::browser::NoBrowser;

    #[test]
    fn attempt_state_serializes_snake_case() {
        let json = serde_json::to_string(&AttemptState::BrowserReady).expect("serialize");
        assert_eq!(json, "\"browser_ready\"");
        assert!(AttemptState::Cancelled.is_terminal());
        assert!(!AttemptState::Running.is_terminal());
    }

    #[test]
    fn auth_event_flattens_kind() {
        let event = AuthEvent {
            provider_id: "qwen_code".to_string(),
            attempt_id: 7,
            kind: AuthEventKind::BrowserReady {
                url: "https://x.example".to_string(),
                opened: false,
            },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "browser_ready");
        assert_eq!(value["provider_id"], "qwen_code");
        assert_eq!(value["opened"], false);
    }

    #[test]
    fn config_from_settings_resolves_ports_and_timing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = HubSettings::default();
        settings.callback_port_overrides.insert("iflow".to_string(), 12345);
        settings.script_dir = Some(dir.path().display().to_string());

        let config = OrchestratorConfig::from_settings(dir.path(), &settings).expect("config");
        assert_eq!(config.callback_port(&oauth_providers::IFLOW, None), 12345);
        assert_eq!(config.callback_port(&oauth_providers::IFLOW, Some(1)), 1);
        assert_eq!(config.callback_port(&oauth_providers::QWEN_CODE, None), 0);
        assert_eq!(config.attempt_timeout, Duration::from_secs(300));
        assert_eq!(config.runtime.materializer.script_dir(), dir.path());
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_without_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig::from_settings(dir.path(), &HubSettings::default()).expect("config");
        let orchestrator = OAuthOrchestrator::new(
            CredentialStore::for_working_dir(dir.path()),
            config,
            Arc::new(NoBrowser),
        );
        let err = orchestrator.start("nope", None).await.expect_err("unknown");
        assert!(matches!(err, OAuthError::UnknownProvider(_)));
        assert!(orchestrator.live_providers().is_empty());
        assert!(!orchestrator.cancel("nope"));
    }

    #[tokio::test]
    async fn blank_label_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrchestratorConfig::from_settings(dir.path(), &HubSettings::default()).expect("config");
        let orchestrator = OAuthOrchestrator::new(
            CredentialStore::for_working_dir(dir.path()),
            config,
            Arc::new(NoBrowser),
        );
        let outcome = orchestrator
            .label_credential("qwen_code", 1, Some("   "))
            .await
            .expect("no-op");
        assert!(!outcome.updated);
        assert!(!outcome.path.exists());
    }
}
