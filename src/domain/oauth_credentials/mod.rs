//! Usage: File-backed OAuth credential store (`<working_dir>/oauth_creds/<provider>_oauth_<n>.json`).
//!
//! The store owns listing, export and deletion. The authentication worker writes each
//! record once; the labeling flow may rewrite `_proxy_metadata.email` exactly once
//! afterwards. Every other field is left untouched.

mod env_export;


use crate::domain::oauth_providers;
use crate::infra::atomic_file::write_file_atomic;
use crate::shared::error::OAuthError;
use crate::shared::security::mask_token;
use crate::shared::time::{format_epoch_millis, local_timestamp_label, now_unix_millis};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub(crate) use env_export::render_env_lines;

pub const CREDENTIALS_DIR_NAME: &str = "oauth_creds";
const FILE_MARKER: &str = "_oauth_";
const FILE_EXTENSION: &str = ".json";
const METADATA_KEY: &str = "_proxy_metadata";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Expired,
}

impl CredentialStatus {
    /// Unknown expiry is not expiry: a record without `expiry_date` stays active.
    pub fn at(expiry_epoch_millis: Option<i64>, now_unix_millis: i64) -> Self {
        match expiry_epoch_millis {
            Some(expiry) if expiry <= now_unix_millis => Self::Expired,
            _ => Self::Active,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialMetadata {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub last_check_timestamp: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parsed view of one credential file. Provider-specific keys stay in `fields`.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expiry_millis")]
    pub expiry_date: Option<i64>,
    #[serde(default, rename = "_proxy_metadata", deserialize_with = "deserialize_metadata")]
    pub metadata: CredentialMetadata,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CredentialRecord {
    /// Non-empty string form of a top-level provider field.
    pub fn field(&self, key: &str) -> Option<String> {
        value_as_text(self.fields.get(key)?)
    }

    pub fn metadata_field(&self, key: &str) -> Option<String> {
        value_as_text(self.metadata.extra.get(key)?)
    }

    pub fn email(&self) -> Option<&str> {
        self.metadata
            .email
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn status_at(&self, now_unix_millis: i64) -> CredentialStatus {
        CredentialStatus::at(self.expiry_date, now_unix_millis)
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn deserialize_expiry_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    // Workers written in dynamic languages store `expiry_date` as float millis.
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f as i64),
        _ => None,
    })
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<CredentialMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<CredentialMetadata>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CredentialSummary {
    pub provider_id: String,
    pub sequence_number: u32,
    pub file_name: String,
    pub path: PathBuf,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub expiry_epoch_millis: Option<i64>,
    pub expiry_date: Option<String>,
    pub status: CredentialStatus,
    pub last_check_timestamp: Option<f64>,
    pub access_token_preview: String,
}

impl CredentialSummary {
    fn from_record(
        provider_id: &str,
        sequence_number: u32,
        path: PathBuf,
        record: &CredentialRecord,
        now_unix_millis: i64,
    ) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            sequence_number,
            file_name: credential_file_name(provider_id, sequence_number),
            path,
            email: record.email().map(str::to_string),
            display_name: record.metadata.display_name.clone(),
            expiry_epoch_millis: record.expiry_date,
            expiry_date: record.expiry_date.and_then(format_epoch_millis),
            status: record.status_at(now_unix_millis),
            last_check_timestamp: record.metadata.last_check_timestamp,
            access_token_preview: mask_token(&record.access_token),
        }
    }
}

pub fn credential_file_name(provider_id: &str, sequence_number: u32) -> String {
    format!("{provider_id}{FILE_MARKER}{sequence_number}{FILE_EXTENSION}")
}

/// Split `<provider>_oauth_<n>.json` into its provider id and sequence number.
pub fn parse_credential_file_name(file_name: &str) -> Option<(&str, u32)> {
    let stem = file_name.strip_suffix(FILE_EXTENSION)?;
    let (provider_id, digits) = stem.rsplit_once(FILE_MARKER)?;
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    if !oauth_providers::is_valid_provider_id(provider_id) {
        return None;
    }
    let sequence_number = digits.parse::<u32>().ok()?;
    if sequence_number == 0 {
        return None;
    }
    Some((provider_id, sequence_number))
}

fn io_error(path: &Path, err: &std::io::Error) -> OAuthError {
    if err.kind() == ErrorKind::NotFound {
        return OAuthError::NotFound(path.display().to_string());
    }
    OAuthError::Io(format!("{}: {err}", path.display()))
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_working_dir(working_dir: &Path) -> Self {
        Self::new(working_dir.join(CREDENTIALS_DIR_NAME))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn credential_path(&self, provider_id: &str, sequence_number: u32) -> PathBuf {
        self.dir
            .join(credential_file_name(provider_id, sequence_number))
    }

    /// Every `(provider, sequence, path)` currently in the directory; missing dir is empty.
    fn scan(&self) -> Result<Vec<(String, u32, PathBuf)>, OAuthError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.dir, &err)),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(dir = %self.dir.display(), "credential dir entry unreadable: {}", err);
                    continue;
                }
            };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((provider_id, sequence_number)) = parse_credential_file_name(file_name)
            else {
                continue;
            };
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }
            found.push((provider_id.to_string(), sequence_number, entry.path()));
        }
        Ok(found)
    }

    fn load_summaries(
        &self,
        mut files: Vec<(String, u32, PathBuf)>,
    ) -> Vec<CredentialSummary> {
        files.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let now = now_unix_millis();
        let mut out = Vec::with_capacity(files.len());
        for (provider_id, sequence_number, path) in files {
            match read_record(&path) {
                Ok(record) => out.push(CredentialSummary::from_record(
                    &provider_id,
                    sequence_number,
                    path,
                    &record,
                    now,
                )),
                Err(err) => {
                    tracing::warn!(
                        provider_id = %provider_id,
                        sequence_number,
                        path = %path.display(),
                        "skipping unreadable credential record: {}",
                        err
                    );
                }
            }
        }
        out
    }

    /// Records of one provider, ascending by sequence number. Corrupt files are skipped.
    pub fn list(&self, provider_id: &str) -> Result<Vec<CredentialSummary>, OAuthError> {
        let files = self
            .scan()?
            .into_iter()
            .filter(|(p, _, _)| p == provider_id)
            .collect();
        Ok(self.load_summaries(files))
    }

    /// Every record in the directory grouped by provider id.
    pub fn list_all(&self) -> Result<BTreeMap<String, Vec<CredentialSummary>>, OAuthError> {
        let mut grouped: BTreeMap<String, Vec<CredentialSummary>> = BTreeMap::new();
        for summary in self.load_summaries(self.scan()?) {
            grouped
                .entry(summary.provider_id.clone())
                .or_default()
                .push(summary);
        }
        Ok(grouped)
    }

    /// `max(existing) + 1`, or 1. Gaps left by deletions are never reused.
    pub fn next_sequence_number(&self, provider_id: &str) -> Result<u32, OAuthError> {
        let max = self
            .scan()?
            .into_iter()
            .filter(|(p, _, _)| p == provider_id)
            .map(|(_, n, _)| n)
            .max();
        Ok(max.map_or(1, |n| n.saturating_add(1)))
    }

    pub fn read(&self, provider_id: &str, sequence_number: u32) -> Result<CredentialRecord, OAuthError> {
        read_record(&self.credential_path(provider_id, sequence_number))
    }

    pub fn export_env_block(
        &self,
        provider_id: &str,
        sequence_number: u32,
    ) -> Result<String, OAuthError> {
        let path = self.credential_path(provider_id, sequence_number);
        let record = read_record(&path).map_err(|err| match err {
            OAuthError::NotFound(_) => err,
            other => OAuthError::NotFound(format!("{} ({other})", path.display())),
        })?;
        let mut lines =
            env_export::render_header(provider_id, sequence_number, &record, &local_timestamp_label());
        lines.push(String::new());
        lines.extend(render_env_lines(provider_id, sequence_number, &record));
        Ok(lines.join("\n"))
    }

    /// Write the env block of one record to `<provider>_<n>_<safe_email>.env` in the store dir.
    pub fn write_env_export(
        &self,
        provider_id: &str,
        sequence_number: u32,
    ) -> Result<PathBuf, OAuthError> {
        let block = self.export_env_block(provider_id, sequence_number)?;
        let record = self.read(provider_id, sequence_number)?;
        let safe_email = env_export::safe_email_fragment(record.email().unwrap_or("unknown"));
        let path = self
            .dir
            .join(format!("{provider_id}_{sequence_number}_{safe_email}.env"));
        write_file_atomic(&path, block.as_bytes()).map_err(|e| io_error(&path, &e))?;
        tracing::info!(provider_id, sequence_number, path = %path.display(), "credential exported to env file");
        Ok(path)
    }

    /// Merge the variable lines of every record (of one provider, or all) into one env file.
    pub fn combine_env(&self, provider_id: Option<&str>) -> Result<(PathBuf, usize), OAuthError> {
        let grouped = self.list_all()?;
        let mut lines = vec![
            match provider_id {
                Some(p) => format!("# Combined ALL {} credentials", oauth_providers::env_prefix(p)),
                None => "# Combined ALL credentials from ALL providers".to_string(),
            },
            format!("# Generated at: {}", local_timestamp_label()),
            "# ".to_string(),
            "# Each credential uses a unique number (1, 2, 3, etc.)".to_string(),
            "#".to_string(),
        ];

        let mut combined = 0usize;
        for (group_provider, summaries) in &grouped {
            if provider_id.is_some_and(|p| p != group_provider) {
                continue;
            }
            for summary in summaries {
                let record = match read_record(&summary.path) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(path = %summary.path.display(), "skipping record in combine: {}", err);
                        continue;
                    }
                };
                lines.push(String::new());
                lines.push(format!(
                    "# {} Credential #{} for: {}",
                    oauth_providers::env_prefix(group_provider),
                    summary.sequence_number,
                    record.email().unwrap_or("unknown")
                ));
                lines.extend(render_env_lines(group_provider, summary.sequence_number, &record));
                combined += 1;
            }
        }

        if combined == 0 {
            return Err(OAuthError::NotFound(match provider_id {
                Some(p) => format!("no credentials for provider {p}"),
                None => "no credentials in store".to_string(),
            }));
        }

        let file_name = match provider_id {
            Some(p) => format!("{p}_all_combined.env"),
            None => "all_combined.env".to_string(),
        };
        let path = self.dir.join(file_name);
        write_file_atomic(&path, lines.join("\n").as_bytes()).map_err(|e| io_error(&path, &e))?;
        Ok((path, combined))
    }

    pub fn delete(&self, provider_id: &str, sequence_number: u32) -> Result<(), OAuthError> {
        let path = self.credential_path(provider_id, sequence_number);
        std::fs::remove_file(&path).map_err(|e| io_error(&path, &e))?;
        tracing::info!(provider_id, sequence_number, "credential deleted");
        Ok(())
    }

    /// Set `_proxy_metadata.email` and rewrite the whole record; no other field changes.
    pub fn update_email(&self, path: &Path, email: &str) -> Result<(), OAuthError> {
        let raw = std::fs::read(path).map_err(|e| io_error(path, &e))?;
        let mut doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| OAuthError::Io(format!("{}: invalid credential json: {e}", path.display())))?;
        let Some(root) = doc.as_object_mut() else {
            return Err(OAuthError::Io(format!(
                "{}: credential json is not an object",
                path.display()
            )));
        };

        let metadata = root
            .entry(METADATA_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("email".to_string(), Value::String(email.to_string()));
        }

        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| OAuthError::Io(format!("{}: serialize failed: {e}", path.display())))?;
        write_file_atomic(path, &bytes).map_err(|e| io_error(path, &e))?;
        Ok(())
    }

    /// Sequence number of another record of `provider_id` already labeled with `email`.
    pub fn find_by_email(
        &self,
        provider_id: &str,
        email: &str,
    ) -> Result<Option<u32>, OAuthError> {
        let needle = email.trim();
        Ok(self
            .list(provider_id)?
            .into_iter()
            .find(|s| {
                s.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(needle))
            })
            .map(|s| s.sequence_number))
    }
}

pub(crate) fn read_record(path: &Path) -> Result<CredentialRecord, OAuthError> {
    let raw = std::fs::read(path).map_err(|e| io_error(path, &e))?;
    serde_json::from_slice(&raw)
        .map_err(|e| OAuthError::Io(format!("{}: invalid credential json: {e}", path.display())))
}
