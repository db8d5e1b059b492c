//! Usage: Render credential records as numbered `.env` variable blocks.

use super::{credential_file_name, CredentialRecord};
use crate::domain::oauth_providers::{self, ExtraFieldSource};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_TOKEN_TYPE: &str = "Bearer";
const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";
const UNKNOWN_EMAIL: &str = "unknown";

pub(super) fn render_header(
    provider_id: &str,
    sequence_number: u32,
    record: &CredentialRecord,
    generated_at: &str,
) -> Vec<String> {
    let prefix = oauth_providers::env_prefix(provider_id);
    vec![
        format!(
            "# {prefix} Credential #{sequence_number} for: {}",
            record.email().unwrap_or(UNKNOWN_EMAIL)
        ),
        format!(
            "# Exported from: {}",
            credential_file_name(provider_id, sequence_number)
        ),
        format!("# Generated at: {generated_at}"),
        "# ".to_string(),
        "# To combine multiple credentials into one .env file, copy these lines".to_string(),
        "# and ensure each credential has a unique number (1, 2, 3, etc.)".to_string(),
    ]
}

/// `<PROVIDER>_<N>_<FIELD>=<value>` lines, fixed fields first, then provider extras.
pub(crate) fn render_env_lines(
    provider_id: &str,
    sequence_number: u32,
    record: &CredentialRecord,
) -> Vec<String> {
    let prefix = format!("{}_{sequence_number}", oauth_providers::env_prefix(provider_id));
    let text = |key: &str, default: &str| record.field(key).unwrap_or_else(|| default.to_string());

    let mut lines = vec![
        format!("{prefix}_ACCESS_TOKEN={}", record.access_token),
        format!(
            "{prefix}_REFRESH_TOKEN={}",
            record.refresh_token.as_deref().unwrap_or_default()
        ),
        format!("{prefix}_SCOPE={}", text("scope", "")),
        format!("{prefix}_TOKEN_TYPE={}", text("token_type", DEFAULT_TOKEN_TYPE)),
        format!("{prefix}_ID_TOKEN={}", text("id_token", "")),
        format!("{prefix}_EXPIRY_DATE={}", record.expiry_date.unwrap_or(0)),
        format!("{prefix}_CLIENT_ID={}", text("client_id", "")),
        format!("{prefix}_CLIENT_SECRET={}", text("client_secret", "")),
        format!("{prefix}_TOKEN_URI={}", text("token_uri", DEFAULT_TOKEN_URI)),
        format!(
            "{prefix}_UNIVERSE_DOMAIN={}",
            text("universe_domain", DEFAULT_UNIVERSE_DOMAIN)
        ),
        format!("{prefix}_EMAIL={}", record.email().unwrap_or(UNKNOWN_EMAIL)),
    ];

    let extras = oauth_providers::find(provider_id)
        .map(|p| p.extra_export_fields)
        .unwrap_or_default();
    for extra in extras {
        let value = match extra.source {
            ExtraFieldSource::Record(key) => record.field(key),
            ExtraFieldSource::Metadata(key) => record.metadata_field(key),
        }
        .or_else(|| extra.default.map(str::to_string));
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            lines.push(format!("{prefix}_{}={value}", extra.env_name));
        }
    }

    lines
}

/// Filename-safe form of an email: `@` → `_at_`, `.` → `_`, anything else odd → `_`.
pub(super) fn safe_email_fragment(email: &str) -> String {
    email
        .trim()
        .replace('@', "_at_")
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
