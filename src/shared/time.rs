//! Usage: Wall-clock helpers shared by the credential store and the orchestrator.

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Render epoch millis as an RFC3339 UTC string; `None` for out-of-range values.
pub(crate) fn format_epoch_millis(millis: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

pub(crate) fn local_timestamp_label() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
