//! Usage: Hand authorization URLs to the host browser; detect sessions that have none.

use crate::shared::error::AppResult;
use std::process::Command;

pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> AppResult<()>;
}

/// Launches the OS default browser (`open`, `xdg-open`, or the Windows URL protocol handler).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> AppResult<()> {
        open_browser(url)
    }
}

/// Never launches anything; used for headless sessions and `open_browser = false`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

impl BrowserOpener for NoBrowser {
    fn open(&self, _url: &str) -> AppResult<()> {
        Err("SYSTEM_ERROR: browser launch disabled".into())
    }
}

fn open_browser(url: &str) -> AppResult<()> {
    #[cfg(target_os = "windows")]
    {
        build_windows_open_browser_command(url)
            .spawn()
            .map_err(|e| format!("SYSTEM_ERROR: failed to open browser: {e}"))?;
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        Command::new("open")
            .arg(url)
            .spawn()
            .map_err(|e| format!("SYSTEM_ERROR: failed to open browser: {e}"))?;
        return Ok(());
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Command::new("xdg-open")
            .arg(url)
            .spawn()
            .map_err(|e| format!("SYSTEM_ERROR: failed to open browser: {e}"))?;
        return Ok(());
    }

    #[allow(unreachable_code)]
    Err(format!("SYSTEM_ERROR: browser open is unsupported on this platform: {url}").into())
}

#[cfg(target_os = "windows")]
fn build_windows_open_browser_command(url: &str) -> Command {
    let mut cmd = Command::new("rundll32.exe");
    // `explorer <url>` may open File Explorer for some URL shapes.
    cmd.arg("url.dll,FileProtocolHandler").arg(url);
    cmd
}

const HEADLESS_FLAG_VARS: &[&str] = &["CI", "CONTINUOUS_INTEGRATION", "HEADLESS", "NO_GUI"];

/// True when no interactive desktop is available to show a browser.
pub fn is_headless_environment() -> bool {
    is_headless_with(|key| std::env::var(key).ok())
}

fn is_headless_with(lookup: impl Fn(&str) -> Option<String>) -> bool {
    let set = |key: &str| lookup(key).is_some_and(|v| !v.trim().is_empty());

    if HEADLESS_FLAG_VARS.iter().any(|key| set(key)) {
        return true;
    }

    if cfg!(windows) {
        return lookup("SESSIONNAME").is_some_and(|v| v.starts_with("Services"));
    }

    if cfg!(all(unix, not(target_os = "macos"))) && !set("DISPLAY") && !set("WAYLAND_DISPLAY") {
        return true;
    }

    lookup("TERM").is_some_and(|v| v == "dumb") && !set("TERM_PROGRAM")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn ci_flags_mark_headless() {
        assert!(is_headless_with(env(&[("CI", "true"), ("DISPLAY", ":0")])));
        assert!(is_headless_with(env(&[("NO_GUI", "1"), ("DISPLAY", ":0")])));
    }

    #[test]
    fn empty_flag_values_are_ignored() {
        assert!(!is_headless_with(env(&[
            ("CI", ""),
            ("DISPLAY", ":0"),
            ("TERM", "xterm-256color")
        ])));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn missing_display_is_headless_on_linux() {
        assert!(is_headless_with(env(&[("TERM", "xterm")])));
        assert!(!is_headless_with(env(&[("WAYLAND_DISPLAY", "wayland-0")])));
    }

    #[test]
    fn no_browser_refuses_to_open() {
        let err = NoBrowser.open("https://example.com").expect_err("disabled");
        assert_eq!(err.code(), "SYSTEM_ERROR");
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn windows_browser_command_uses_protocol_handler() {
        use std::ffi::OsStr;

        let cmd = build_windows_open_browser_command("https://example.com/auth?x=1&y=2");
        assert_eq!(cmd.get_program(), OsStr::new("rundll32.exe"));
        let args = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            vec!["url.dll,FileProtocolHandler", "https://example.com/auth?x=1&y=2"]
        );
    }
}
