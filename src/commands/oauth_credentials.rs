//! Usage: Front-end operations over the credential store and the orchestrator.

use crate::app::app_state::AppContext;
use crate::blocking;
use crate::domain::oauth_credentials::CredentialSummary;
use crate::domain::oauth_providers::{self, ProviderDescriptor};
use crate::oauth::orchestrator::{LabelOutcome, LoginOutcome};
use crate::shared::error::{AppResult, OAuthError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct EnvExport {
    pub provider_id: String,
    pub sequence_number: u32,
    pub content: String,
    pub written_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedExport {
    pub path: PathBuf,
    pub credentials: usize,
}

fn registered(provider_id: &str) -> Result<&'static ProviderDescriptor, OAuthError> {
    oauth_providers::find(provider_id)
        .ok_or_else(|| OAuthError::UnknownProvider(provider_id.trim().to_string()))
}

pub fn oauth_providers_list() -> Vec<ProviderDescriptor> {
    oauth_providers::all().to_vec()
}

pub async fn oauth_credentials_list(
    ctx: &AppContext,
    provider_id: Option<String>,
) -> AppResult<BTreeMap<String, Vec<CredentialSummary>>> {
    let provider = provider_id.as_deref().map(registered).transpose()?;
    let store = ctx.store().clone();
    blocking::run("oauth_credentials_list", move || match provider {
        Some(provider) => {
            let list = store.list(provider.id)?;
            let mut grouped = BTreeMap::new();
            if !list.is_empty() {
                grouped.insert(provider.id.to_string(), list);
            }
            Ok::<_, OAuthError>(grouped)
        }
        None => store.list_all(),
    })
    .await
}

pub async fn oauth_login_start(
    ctx: &AppContext,
    provider_id: &str,
    callback_port: Option<u16>,
) -> AppResult<LoginOutcome> {
    Ok(ctx
        .orchestrator()
        .start(provider_id, callback_port)
        .await?)
}

pub fn oauth_login_cancel(ctx: &AppContext, provider_id: &str) -> bool {
    ctx.orchestrator().cancel(provider_id)
}

pub async fn oauth_credential_export(
    ctx: &AppContext,
    provider_id: &str,
    sequence_number: u32,
    write: bool,
) -> AppResult<EnvExport> {
    let provider = registered(provider_id)?;
    let store = ctx.store().clone();
    blocking::run("oauth_credential_export", move || {
        let content = store.export_env_block(provider.id, sequence_number)?;
        let written_to = if write {
            Some(store.write_env_export(provider.id, sequence_number)?)
        } else {
            None
        };
        Ok::<_, OAuthError>(EnvExport {
            provider_id: provider.id.to_string(),
            sequence_number,
            content,
            written_to,
        })
    })
    .await
}

pub async fn oauth_credentials_combine(
    ctx: &AppContext,
    provider_id: Option<String>,
) -> AppResult<CombinedExport> {
    let provider = provider_id.as_deref().map(registered).transpose()?;
    let store = ctx.store().clone();
    blocking::run("oauth_credentials_combine", move || {
        let (path, credentials) = store.combine_env(provider.map(|p| p.id))?;
        Ok::<_, OAuthError>(CombinedExport { path, credentials })
    })
    .await
}

pub async fn oauth_credential_delete(
    ctx: &AppContext,
    provider_id: &str,
    sequence_number: u32,
) -> AppResult<()> {
    let provider = registered(provider_id)?;
    let store = ctx.store().clone();
    blocking::run("oauth_credential_delete", move || {
        store.delete(provider.id, sequence_number)
    })
    .await
}

pub async fn oauth_credential_label(
    ctx: &AppContext,
    provider_id: &str,
    sequence_number: u32,
    label: Option<&str>,
) -> AppResult<LabelOutcome> {
    Ok(ctx
        .orchestrator()
        .label_credential(provider_id, sequence_number, label)
        .await?)
}
