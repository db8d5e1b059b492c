//! Usage: Line protocol spoken by the authentication worker.
//!
//! - `OAUTH_URL:<url>` announces the authorization URL (authoritative).
//! - A line containing `AUTHENTICATION_SUCCESS` on either stream marks completion.
//! - Everything else is progress. A bare `http(s)://` URL is used as a fallback
//!   only while no URL has been announced.

use super::supervisor::StreamKind;
use crate::shared::error::OAuthError;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const URL_MARKER: &str = "OAUTH_URL:";
pub const SUCCESS_MARKER: &str = "AUTHENTICATION_SUCCESS";

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI_REGEX should compile - this is a bug")
    })
}

fn bare_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^\s'"<>\]\[)(]+"#).expect("URL_REGEX should compile - this is a bug")
    })
}

pub fn strip_ansi(line: &str) -> String {
    ansi_regex().replace_all(line, "").into_owned()
}

/// Splits a byte stream into `\n`-terminated lines; a trailing `\r` is dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            lines.push(decode_line(line));
        }
        lines
    }

    /// Flush a final unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode_line(std::mem::take(&mut self.pending)))
    }
}

fn decode_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMatch<'a> {
    Marker(&'a str),
    Fallback(&'a str),
}

impl<'a> UrlMatch<'a> {
    pub fn url(self) -> &'a str {
        match self {
            Self::Marker(url) | Self::Fallback(url) => url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineClass<'a> {
    pub url: Option<UrlMatch<'a>>,
    pub completed: bool,
}

/// Classify one ANSI-free line. Pure: callers own de-duplication state.
pub fn classify_line(line: &str, url_already_emitted: bool) -> LineClass<'_> {
    let completed = line.contains(SUCCESS_MARKER);

    if let Some(idx) = line.find(URL_MARKER) {
        let rest = line[idx + URL_MARKER.len()..].trim_start();
        let url = rest.split_whitespace().next().unwrap_or_default();
        if !url.is_empty() {
            return LineClass {
                url: Some(UrlMatch::Marker(url)),
                completed,
            };
        }
    }

    let url = if url_already_emitted {
        None
    } else {
        bare_url_regex()
            .find(line)
            .map(|m| UrlMatch::Fallback(trim_sentence_punctuation(m.as_str())))
    };
    LineClass { url, completed }
}

/// Prose like "Visit https://x/y." ends the sentence right after the url.
fn trim_sentence_punctuation(url: &str) -> &str {
    url.trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    BrowserReady { url: String, from_marker: bool },
    Progress { stream: StreamKind, line: String },
}

/// Per-attempt parser state: splitters, accumulated output, URL and completion flags.
#[derive(Debug, Default)]
pub struct ProtocolParser {
    stdout: LineSplitter,
    stderr: LineSplitter,
    stdout_text: String,
    stderr_text: String,
    last_url: Option<String>,
    completed: bool,
}

impl ProtocolParser {
    pub fn feed(&mut self, stream: StreamKind, bytes: &[u8]) -> Vec<ProtocolEvent> {
        let lines = match stream {
            StreamKind::Stdout => self.stdout.push(bytes),
            StreamKind::Stderr => self.stderr.push(bytes),
        };
        let mut events = Vec::new();
        for line in lines {
            self.handle_line(stream, &line, &mut events);
        }
        events
    }

    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        if let Some(line) = self.stdout.finish() {
            self.handle_line(StreamKind::Stdout, &line, &mut events);
        }
        if let Some(line) = self.stderr.finish() {
            self.handle_line(StreamKind::Stderr, &line, &mut events);
        }
        events
    }

    fn handle_line(&mut self, stream: StreamKind, raw: &str, events: &mut Vec<ProtocolEvent>) {
        let line = strip_ansi(raw);
        let class = classify_line(&line, self.last_url.is_some());
        if class.completed {
            self.completed = true;
        }
        match class.url {
            Some(UrlMatch::Marker(url)) if self.last_url.as_deref() != Some(url) => {
                self.last_url = Some(url.to_string());
                events.push(ProtocolEvent::BrowserReady {
                    url: url.to_string(),
                    from_marker: true,
                });
            }
            Some(UrlMatch::Fallback(url)) => {
                self.last_url = Some(url.to_string());
                events.push(ProtocolEvent::BrowserReady {
                    url: url.to_string(),
                    from_marker: false,
                });
            }
            _ => {}
        }

        let acc = match stream {
            StreamKind::Stdout => &mut self.stdout_text,
            StreamKind::Stderr => &mut self.stderr_text,
        };
        acc.push_str(&line);
        acc.push('\n');
        events.push(ProtocolEvent::Progress { stream, line });
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn stdout_text(&self) -> &str {
        &self.stdout_text
    }

    pub fn stderr_text(&self) -> &str {
        &self.stderr_text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Succeeded,
    Failed,
    Cancelled,
}

pub fn stderr_indicates_failure(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        let lower = line.trim().to_ascii_lowercase();
        lower.starts_with("traceback")
            || lower.starts_with("error")
            || lower.starts_with("failed")
            || lower.starts_with("authentication_failed")
            || lower.contains("error:")
    })
}

/// Terminal disposition of an attempt from its exit facts.
pub fn disposition(
    completed: bool,
    exit_code: Option<i32>,
    stderr: &str,
    cancel_requested: bool,
) -> Disposition {
    if cancel_requested {
        return Disposition::Cancelled;
    }
    if completed || (exit_code == Some(0) && !stderr_indicates_failure(stderr)) {
        return Disposition::Succeeded;
    }
    Disposition::Failed
}

/// Keep the last `max_chars` characters; the end of the output carries the error.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    format!("...{}", &text[start..])
}

pub fn failure_detail(stdout: &str, stderr: &str, exit_code: Option<i32>, max_chars: usize) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();
    let raw = if !stderr.is_empty() {
        stderr.to_string()
    } else if !stdout.is_empty() {
        stdout.to_string()
    } else {
        match exit_code {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker terminated by signal".to_string(),
        }
    };
    truncate_tail(&raw, max_chars)
}

/// Map a failure detail to the error surfaced to callers.
pub fn failure_error(detail: String) -> OAuthError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        return OAuthError::Timeout(detail);
    }
    OAuthError::WorkerFailure(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- LineSplitter --

    #[test]
    fn splitter_buffers_partial_lines_and_strips_cr() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\r\nwor"), vec!["hello".to_string()]);
        assert_eq!(splitter.push(b"ld\n\n"), vec!["world".to_string(), String::new()]);
        assert_eq!(splitter.push(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_keeps_multibyte_chars_split_across_chunks() {
        let mut splitter = LineSplitter::default();
        let bytes = "✓ ok\n".as_bytes();
        assert!(splitter.push(&bytes[..2]).is_empty());
        assert_eq!(splitter.push(&bytes[2..]), vec!["✓ ok".to_string()]);
    }

    // -- classify_line --

    #[test]
    fn marker_url_wins_even_after_emission() {
        let class = classify_line("OAUTH_URL:https://a.example/x?y=1", true);
        assert_eq!(class.url, Some(UrlMatch::Marker("https://a.example/x?y=1")));
        assert!(!class.completed);
    }

    #[test]
    fn marker_inside_decorated_line_is_found() {
        let class = classify_line("  >> OAUTH_URL: https://b.example/auth extra", false);
        assert_eq!(class.url.map(UrlMatch::url), Some("https://b.example/auth"));
    }

    #[test]
    fn fallback_url_only_until_first_emission() {
        let line = "Visit 'https://chat.qwen.ai/authorize?user_code=AB-12' to continue";
        assert_eq!(
            classify_line(line, false).url,
            Some(UrlMatch::Fallback("https://chat.qwen.ai/authorize?user_code=AB-12"))
        );
        assert_eq!(classify_line(line, true).url, None);
    }

    #[test]
    fn fallback_url_drops_trailing_sentence_punctuation() {
        assert_eq!(
            classify_line("Visit https://x.example/y.", false).url,
            Some(UrlMatch::Fallback("https://x.example/y"))
        );
        assert_eq!(
            classify_line("Open https://x.example/device?code=AB-12!? then wait", false).url,
            Some(UrlMatch::Fallback("https://x.example/device?code=AB-12"))
        );
        // Marker urls are taken verbatim.
        assert_eq!(
            classify_line("OAUTH_URL:https://x.example/y.", false).url,
            Some(UrlMatch::Marker("https://x.example/y."))
        );
    }

    #[test]
    fn success_marker_detected_anywhere_in_line() {
        let class = classify_line("[done] AUTHENTICATION_SUCCESS for x", false);
        assert!(class.completed);
        assert_eq!(classify_line("plain progress", false), LineClass { url: None, completed: false });
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(
            strip_ansi("\x1b[1mOAUTH_URL:https://x.example\x1b[0m"),
            "OAUTH_URL:https://x.example"
        );
    }

    // -- ProtocolParser --

    #[test]
    fn parser_emits_browser_ready_once_per_distinct_url() {
        let mut parser = ProtocolParser::default();
        let events = parser.feed(
            StreamKind::Stdout,
            b"starting\nOAUTH_URL:https://u.example/1\nOAUTH_URL:https://u.example/1\n",
        );
        let ready: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::BrowserReady { .. }))
            .collect();
        assert_eq!(
            ready,
            vec![&ProtocolEvent::BrowserReady {
                url: "https://u.example/1".to_string(),
                from_marker: true,
            }]
        );

        let events = parser.feed(StreamKind::Stdout, b"see https://other.example too\n");
        assert!(events
            .iter()
            .all(|e| !matches!(e, ProtocolEvent::BrowserReady { .. })));
    }

    #[test]
    fn parser_tracks_success_on_stderr_and_flushes_tail() {
        let mut parser = ProtocolParser::default();
        parser.feed(StreamKind::Stderr, b"log line\nAUTHENTICATION_SUCCESS");
        assert!(!parser.completed());

        let events = parser.finish();
        assert!(parser.completed());
        assert_eq!(
            events,
            vec![ProtocolEvent::Progress {
                stream: StreamKind::Stderr,
                line: "AUTHENTICATION_SUCCESS".to_string(),
            }]
        );
        assert_eq!(parser.stderr_text(), "log line\nAUTHENTICATION_SUCCESS\n");
        assert_eq!(parser.stdout_text(), "");
    }

    // -- disposition --

    #[test]
    fn disposition_table() {
        assert_eq!(disposition(true, Some(1), "", true), Disposition::Cancelled);
        assert_eq!(disposition(true, Some(1), "Traceback", false), Disposition::Succeeded);
        assert_eq!(disposition(false, Some(0), "", false), Disposition::Succeeded);
        assert_eq!(disposition(false, Some(0), "warning: slow\n", false), Disposition::Succeeded);
        assert_eq!(
            disposition(false, Some(0), "Error: token exchange failed\n", false),
            Disposition::Failed
        );
        assert_eq!(disposition(false, Some(2), "", false), Disposition::Failed);
        assert_eq!(disposition(false, None, "", false), Disposition::Failed);
    }

    #[test]
    fn failure_detail_prefers_stderr_then_stdout_then_code() {
        assert_eq!(failure_detail("out", "err", Some(1), 100), "err");
        assert_eq!(failure_detail("out", "  ", Some(1), 100), "out");
        assert_eq!(failure_detail("", "", Some(7), 100), "worker exited with code 7");
    }

    #[test]
    fn truncate_tail_keeps_end_on_char_boundary() {
        assert_eq!(truncate_tail("abcdef", 10), "abcdef");
        assert_eq!(truncate_tail("abcdef", 3), "...def");
        assert_eq!(truncate_tail("ééééé", 2), "...éé");
    }

    #[test]
    fn failure_error_detects_timeouts() {
        assert!(matches!(
            failure_error("Device flow timed out after 300s".to_string()),
            OAuthError::Timeout(_)
        ));
        assert!(matches!(
            failure_error("invalid_grant".to_string()),
            OAuthError::WorkerFailure(_)
        ));
    }
}
