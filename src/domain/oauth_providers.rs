//! Usage: Static registry of identity providers that support OAuth credential onboarding.
//!
//! The registry is process-wide and read-only; presentation layers enumerate it and the
//! orchestrator resolves provider ids through it.

use serde::Serialize;

/// Where an extra export field is read from in a credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtraFieldSource {
    /// Top-level key of the credential JSON.
    Record(&'static str),
    /// Key inside `_proxy_metadata`.
    Metadata(&'static str),
}

/// Provider-specific line appended to the exported env block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtraExportField {
    pub(crate) env_name: &'static str,
    pub(crate) source: ExtraFieldSource,
    pub(crate) default: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    /// Local redirect port handed to the worker; `0` means the flow needs no listener.
    pub default_callback_port: u16,
    #[serde(skip)]
    pub(crate) extra_export_fields: &'static [ExtraExportField],
}

/// Prefix used for exported variables, e.g. `QWEN_CODE`.
pub fn env_prefix(provider_id: &str) -> String {
    provider_id.to_ascii_uppercase()
}

const GOOGLE_EXTRA_FIELDS: &[ExtraExportField] = &[
    ExtraExportField {
        env_name: "PROJECT_ID",
        source: ExtraFieldSource::Metadata("project_id"),
        default: None,
    },
    ExtraExportField {
        env_name: "TIER",
        source: ExtraFieldSource::Metadata("tier"),
        default: None,
    },
];

pub const GEMINI_CLI: ProviderDescriptor = ProviderDescriptor {
    id: "gemini_cli",
    display_name: "Gemini CLI (OAuth)",
    description: "Google account login used by the Gemini CLI (authorization code + local redirect).",
    default_callback_port: 8085,
    extra_export_fields: GOOGLE_EXTRA_FIELDS,
};

pub const QWEN_CODE: ProviderDescriptor = ProviderDescriptor {
    id: "qwen_code",
    display_name: "Qwen Code (OAuth)",
    description: "Qwen chat account login via device flow; also supports API keys.",
    default_callback_port: 0,
    extra_export_fields: &[ExtraExportField {
        env_name: "RESOURCE_URL",
        source: ExtraFieldSource::Record("resource_url"),
        default: Some("https://portal.qwen.ai/v1"),
    }],
};

pub const IFLOW: ProviderDescriptor = ProviderDescriptor {
    id: "iflow",
    display_name: "iFlow (OAuth)",
    description: "iFlow account login (authorization code + local redirect); also supports API keys.",
    default_callback_port: 11451,
    extra_export_fields: &[
        ExtraExportField {
            env_name: "API_KEY",
            source: ExtraFieldSource::Record("api_key"),
            default: None,
        },
        ExtraExportField {
            env_name: "USER_ID",
            source: ExtraFieldSource::Record("user_id"),
            default: None,
        },
    ],
};

pub const ANTIGRAVITY: ProviderDescriptor = ProviderDescriptor {
    id: "antigravity",
    display_name: "Antigravity (OAuth)",
    description: "Google account login for Antigravity (authorization code + local redirect).",
    default_callback_port: 51121,
    extra_export_fields: GOOGLE_EXTRA_FIELDS,
};

static PROVIDERS: [ProviderDescriptor; 4] = [GEMINI_CLI, QWEN_CODE, IFLOW, ANTIGRAVITY];

pub fn all() -> &'static [ProviderDescriptor] {
    &PROVIDERS
}

pub fn find(provider_id: &str) -> Option<&'static ProviderDescriptor> {
    let provider_id = provider_id.trim();
    PROVIDERS.iter().find(|p| p.id == provider_id)
}

/// Provider ids double as filename prefixes and script literals, so only `[a-z0-9_]` is valid.
pub(crate) fn is_valid_provider_id(provider_id: &str) -> bool {
    !provider_id.is_empty()
        && provider_id
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_four_providers() {
        let ids: Vec<&str> = all().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["gemini_cli", "qwen_code", "iflow", "antigravity"]);
    }

    #[test]
    fn find_trims_and_rejects_unknown() {
        assert_eq!(find(" qwen_code ").map(|p| p.id), Some("qwen_code"));
        assert!(find("unknown").is_none());
        assert!(find("").is_none());
    }

    #[test]
    fn registered_ids_are_valid_filename_prefixes() {
        for provider in all() {
            assert!(is_valid_provider_id(provider.id), "{}", provider.id);
        }
        assert!(!is_valid_provider_id("Qwen"));
        assert!(!is_valid_provider_id("a/b"));
        assert!(!is_valid_provider_id(""));
    }

    #[test]
    fn env_prefix_is_upper_snake_case() {
        assert_eq!(env_prefix(QWEN_CODE.id), "QWEN_CODE");
        assert_eq!(env_prefix(GEMINI_CLI.id), "GEMINI_CLI");
    }

    #[test]
    fn default_ports_are_stable() {
        assert_eq!(GEMINI_CLI.default_callback_port, 8085);
        assert_eq!(QWEN_CODE.default_callback_port, 0);
        assert_eq!(IFLOW.default_callback_port, 11451);
    }
}
