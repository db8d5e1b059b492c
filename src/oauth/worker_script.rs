//! Usage: Render the authentication worker from a template and write it to a unique temp path.
//!
//! A template has three substitution points: `{{PROVIDER_ID}}` and `{{WORKING_DIR}}` become
//! double-quoted string literals, `{{CALLBACK_PORT}}` becomes a bare integer.

use crate::shared::error::OAuthError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const PLACEHOLDER_PROVIDER_ID: &str = "{{PROVIDER_ID}}";
const PLACEHOLDER_WORKING_DIR: &str = "{{WORKING_DIR}}";
const PLACEHOLDER_CALLBACK_PORT: &str = "{{CALLBACK_PORT}}";

const DEFAULT_TEMPLATE: &str = include_str!("worker_template.py");

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTemplate {
    source: String,
    extension: String,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            extension: "py".to_string(),
        }
    }
}

impl WorkerTemplate {
    pub fn new(source: impl Into<String>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            source: source.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Load a template file; the extension of the rendered script follows the file's.
    pub fn from_file(path: &Path) -> Result<Self, OAuthError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            OAuthError::Spawn(format!("failed to read worker template {}: {e}", path.display()))
        })?;
        let extension = path
            .extension()
            .and_then(|v| v.to_str())
            .unwrap_or("py")
            .to_string();
        Ok(Self::new(source, extension))
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn render(&self, provider_id: &str, callback_port: u16, working_dir: &Path) -> String {
        let working_dir = working_dir.to_string_lossy();
        self.source
            .replace(PLACEHOLDER_PROVIDER_ID, &quoted_literal(provider_id))
            .replace(PLACEHOLDER_WORKING_DIR, &quoted_literal(&working_dir))
            .replace(PLACEHOLDER_CALLBACK_PORT, &callback_port.to_string())
    }
}

/// JSON string escaping yields a literal valid in Python and POSIX sh double quotes alike
/// for the characters provider ids and ordinary paths contain.
fn quoted_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

/// Materialized worker script; the file is removed when this guard drops.
#[derive(Debug)]
pub struct WorkerScript {
    path: PathBuf,
}

impl WorkerScript {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkerScript {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "worker script removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "failed to remove worker script: {}", err)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptMaterializer {
    template: WorkerTemplate,
    script_dir: PathBuf,
}

impl ScriptMaterializer {
    pub fn new(template: WorkerTemplate, script_dir: impl Into<PathBuf>) -> Self {
        Self {
            template,
            script_dir: script_dir.into(),
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    fn unique_path(&self, provider_id: &str) -> PathBuf {
        let counter = SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = crate::shared::time::now_unix_millis();
        self.script_dir.join(format!(
            "oauth_worker_{provider_id}_{}_{millis}_{counter}.{}",
            std::process::id(),
            self.template.extension()
        ))
    }

    pub fn materialize(
        &self,
        provider_id: &str,
        callback_port: u16,
        working_dir: &Path,
    ) -> Result<WorkerScript, OAuthError> {
        std::fs::create_dir_all(&self.script_dir).map_err(|e| {
            OAuthError::Spawn(format!(
                "failed to create script dir {}: {e}",
                self.script_dir.display()
            ))
        })?;

        let path = self.unique_path(provider_id);
        let content = self.template.render(provider_id, callback_port, working_dir);
        // Guard first so a partial write is still cleaned up.
        let script = WorkerScript { path };
        std::fs::write(script.path(), content).map_err(|e| {
            OAuthError::Spawn(format!(
                "failed to write worker script {}: {e}",
                script.path().display()
            ))
        })?;

        tracing::debug!(provider_id, path = %script.path().display(), "worker script materialized");
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_strings_and_keeps_port_bare() {
        let template = WorkerTemplate::new(
            "p={{PROVIDER_ID}}\nw={{WORKING_DIR}}\nport={{CALLBACK_PORT}}\n",
            "sh",
        );
        let rendered = template.render("qwen_code", 8085, Path::new("/srv/hub dir"));
        assert_eq!(rendered, "p=\"qwen_code\"\nw=\"/srv/hub dir\"\nport=8085\n");
    }

    #[test]
    fn render_escapes_quotes_and_backslashes() {
        let template = WorkerTemplate::new("{{WORKING_DIR}}", "py");
        let rendered = template.render("iflow", 0, Path::new(r#"C:\a "b""#));
        assert_eq!(rendered, r#""C:\\a \"b\"""#);
    }

    #[test]
    fn default_template_has_all_substitution_points() {
        let template = WorkerTemplate::default();
        assert_eq!(template.extension(), "py");
        let rendered = template.render("gemini_cli", 8085, Path::new("/w"));
        assert!(rendered.contains("PROVIDER_ID = \"gemini_cli\""));
        assert!(rendered.contains("WORKING_DIR = \"/w\""));
        assert!(rendered.contains("CALLBACK_PORT = 8085"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn materialize_writes_unique_files_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let materializer =
            ScriptMaterializer::new(WorkerTemplate::new("echo {{PROVIDER_ID}}", ".sh"), dir.path());

        let first = materializer
            .materialize("qwen_code", 0, Path::new("/w"))
            .expect("first");
        let second = materializer
            .materialize("qwen_code", 0, Path::new("/w"))
            .expect("second");

        assert_ne!(first.path(), second.path());
        let name = first
            .path()
            .file_name()
            .and_then(|v| v.to_str())
            .expect("file name")
            .to_string();
        assert!(name.starts_with("oauth_worker_qwen_code_"));
        assert!(name.ends_with(".sh"));
        assert_eq!(
            std::fs::read_to_string(first.path()).expect("read"),
            "echo \"qwen_code\""
        );

        let first_path = first.path().to_path_buf();
        drop(first);
        assert!(!first_path.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn from_file_missing_is_spawn_error() {
        let err = WorkerTemplate::from_file(Path::new("/definitely/missing/template.py"))
            .expect_err("missing");
        assert!(matches!(err, OAuthError::Spawn(_)));
    }
}
