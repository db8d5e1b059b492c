//! Usage: Process-wide context shared by `commands/*` (settings and the orchestrator).

use crate::domain::oauth_credentials::CredentialStore;
use crate::infra::settings::{self, HubSettings};
use crate::oauth::browser::{self, BrowserOpener, NoBrowser, SystemBrowser};
use crate::oauth::orchestrator::{OAuthOrchestrator, OrchestratorConfig};
use crate::shared::error::AppResult;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    settings: HubSettings,
    orchestrator: Arc<OAuthOrchestrator>,
}

impl AppContext {
    /// Load settings (fail-open) and wire the orchestrator with the system browser.
    pub fn load(working_dir: &Path) -> AppResult<Self> {
        let settings = settings::load_effective(working_dir);
        let headless = browser::is_headless_environment();
        if headless && settings.open_browser {
            tracing::info!("headless session detected; authorization urls will be printed only");
        }
        let opener: Arc<dyn BrowserOpener> = if settings.open_browser && !headless {
            Arc::new(SystemBrowser)
        } else {
            Arc::new(NoBrowser)
        };
        Self::with_browser(working_dir, settings, opener)
    }

    pub fn with_browser(
        working_dir: &Path,
        settings: HubSettings,
        opener: Arc<dyn BrowserOpener>,
    ) -> AppResult<Self> {
        let config = OrchestratorConfig::from_settings(working_dir, &settings)?;
        Ok(Self::from_parts(working_dir, settings, config, opener))
    }

    pub fn from_parts(
        working_dir: &Path,
        settings: HubSettings,
        config: OrchestratorConfig,
        opener: Arc<dyn BrowserOpener>,
    ) -> Self {
        let store = CredentialStore::for_working_dir(working_dir);
        Self {
            settings,
            orchestrator: Arc::new(OAuthOrchestrator::new(store, config, opener)),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Arc<OAuthOrchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &CredentialStore {
        self.orchestrator.store()
    }
}
