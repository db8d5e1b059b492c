//! Usage: Command-line front end (clap) over `commands::oauth_credentials`.

use crate::app::app_state::AppContext;
use crate::commands::oauth_credentials as cmd;
use crate::domain::oauth_credentials::CredentialSummary;
use crate::oauth::orchestrator::{AuthEvent, AuthEventKind, LoginOutcome};
use crate::oauth::supervisor::StreamKind;
use crate::shared::error::AppResult;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

const PRINTER_FLUSH_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(
    name = "aio-oauth-hub",
    version,
    about = "Onboard OAuth credentials for LLM providers and manage the credential store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding `oauth_creds/`, settings and logs.
    #[arg(long, global = true, env = "OAUTH_HUB_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Print results as JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the providers that support OAuth onboarding.
    Providers,
    /// Run an interactive login and store the resulting credential.
    Login {
        /// Provider id (e.g. "qwen_code").
        provider: String,
        /// Callback port handed to the worker (defaults per provider).
        #[arg(long)]
        port: Option<u16>,
        /// Label (email) to attach to the new credential.
        #[arg(long)]
        label: Option<String>,
    },
    /// List stored credentials.
    List {
        /// Limit to one provider.
        provider: Option<String>,
    },
    /// Print a credential as numbered `.env` variables.
    Export {
        provider: String,
        number: u32,
        /// Also write `<provider>_<n>_<email>.env` next to the records.
        #[arg(long, default_value_t = false)]
        write: bool,
    },
    /// Merge credentials into one `.env` file.
    Combine {
        /// Limit to one provider.
        provider: Option<String>,
    },
    /// Delete a stored credential.
    Delete { provider: String, number: u32 },
    /// Set the label (email) of a stored credential.
    Label {
        provider: String,
        number: u32,
        label: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize output: {e}"))?;
    println!("{text}");
    Ok(())
}

fn print_credentials(grouped: &BTreeMap<String, Vec<CredentialSummary>>) {
    if grouped.is_empty() {
        println!("No stored credentials.");
        return;
    }
    for (provider_id, list) in grouped {
        println!("{provider_id}:");
        for c in list {
            println!(
                "  #{:<3} {:<32} {:<8} expires {:<22} {}",
                c.sequence_number,
                c.email.as_deref().unwrap_or("-"),
                c.status.as_str(),
                c.expiry_date.as_deref().unwrap_or("unknown"),
                c.access_token_preview
            );
        }
    }
}

fn render_event(event: &AuthEvent, verbose: bool) {
    match &event.kind {
        AuthEventKind::StateChanged { state } => {
            if verbose {
                eprintln!("[{}] {}", event.provider_id, state.as_str());
            }
        }
        AuthEventKind::BrowserReady { url, opened } => {
            if *opened {
                eprintln!("Browser opened. If nothing appeared, visit:\n  {url}");
            } else {
                eprintln!("Open this URL to continue authentication:\n  {url}");
            }
        }
        AuthEventKind::Progress { stream, line } => {
            if verbose && !line.trim().is_empty() {
                let tag = match stream {
                    StreamKind::Stdout => "worker",
                    StreamKind::Stderr => "worker!",
                };
                eprintln!("  {tag}: {line}");
            }
        }
        AuthEventKind::Finished { message, .. } => eprintln!("{message}"),
    }
}

fn spawn_event_printer(
    mut rx: broadcast::Receiver<AuthEvent>,
    verbose: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let finished = matches!(event.kind, AuthEventKind::Finished { .. });
                    render_event(&event, verbose);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn prompt_label(outcome: &LoginOutcome) -> Option<String> {
    let record = outcome.new_record.as_ref()?;
    if !std::io::stdin().is_terminal() {
        return None;
    }
    eprint!(
        "Label for {} (email or name, empty to keep '{}'): ",
        record.file_name,
        record.email.as_deref().unwrap_or("unknown")
    );
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

async fn login(
    ctx: &AppContext,
    provider: &str,
    port: Option<u16>,
    label: Option<String>,
    cli: &Cli,
) -> AppResult<()> {
    let mut printer = spawn_event_printer(ctx.orchestrator().subscribe(), cli.verbose);

    let start = cmd::oauth_login_start(ctx, provider, port);
    tokio::pin!(start);
    let result = tokio::select! {
        result = &mut start => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            cmd::oauth_login_cancel(ctx, provider);
            start.await
        }
    };
    // Rejected starts (unknown provider, already running) never emit `Finished`.
    if tokio::time::timeout(PRINTER_FLUSH_TIMEOUT, &mut printer).await.is_err() {
        printer.abort();
    }
    let outcome = result?;

    let label = match label {
        Some(label) => Some(label),
        None if !cli.json => prompt_label(&outcome),
        None => None,
    };
    let labeled = match (&outcome.new_record, label.as_deref()) {
        (Some(record), Some(label)) => {
            let labeled =
                cmd::oauth_credential_label(ctx, provider, record.sequence_number, Some(label))
                    .await?;
            if let Some(other) = labeled.duplicate_of {
                eprintln!("Warning: credential #{other} already uses the label '{label}'.");
            }
            Some(labeled)
        }
        _ => None,
    };

    if cli.json {
        return print_json(&serde_json::json!({
            "outcome": outcome,
            "label": labeled,
        }));
    }
    match &outcome.new_record {
        Some(record) => println!("Saved {}", record.path.display()),
        None => println!("Worker reported success but no new credential file was found."),
    }
    Ok(())
}

pub async fn run(cli: Cli, ctx: &AppContext) -> AppResult<()> {
    match &cli.command {
        Command::Providers => {
            let providers = cmd::oauth_providers_list();
            if cli.json {
                return print_json(&providers);
            }
            for p in providers {
                let port = match p.default_callback_port {
                    0 => "device flow".to_string(),
                    port => format!("callback port {port}"),
                };
                println!(
                    "{:<12} {:<22} {port}\n             {}",
                    p.id, p.display_name, p.description
                );
            }
            Ok(())
        }
        Command::Login {
            provider,
            port,
            label,
        } => login(ctx, provider, *port, label.clone(), &cli).await,
        Command::List { provider } => {
            let grouped = cmd::oauth_credentials_list(ctx, provider.clone()).await?;
            if cli.json {
                return print_json(&grouped);
            }
            print_credentials(&grouped);
            Ok(())
        }
        Command::Export {
            provider,
            number,
            write,
        } => {
            let export = cmd::oauth_credential_export(ctx, provider, *number, *write).await?;
            if cli.json {
                return print_json(&export);
            }
            println!("{}", export.content);
            if let Some(path) = &export.written_to {
                eprintln!("Written to {}", path.display());
            }
            Ok(())
        }
        Command::Combine { provider } => {
            let combined = cmd::oauth_credentials_combine(ctx, provider.clone()).await?;
            if cli.json {
                return print_json(&combined);
            }
            println!(
                "Combined {} credential(s) into {}",
                combined.credentials,
                combined.path.display()
            );
            Ok(())
        }
        Command::Delete { provider, number } => {
            cmd::oauth_credential_delete(ctx, provider, *number).await?;
            if !cli.json {
                println!("Deleted {provider} credential #{number}");
            }
            Ok(())
        }
        Command::Label {
            provider,
            number,
            label,
        } => {
            let outcome =
                cmd::oauth_credential_label(ctx, provider, *number, Some(label.as_str())).await?;
            if cli.json {
                return print_json(&outcome);
            }
            if let Some(other) = outcome.duplicate_of {
                eprintln!("Warning: credential #{other} already uses this label.");
            }
            if outcome.updated {
                println!("Labeled {provider} credential #{number} as '{}'", label.trim());
            } else {
                println!("Empty label; {provider} credential #{number} left unchanged");
            }
            Ok(())
        }
    }
}
