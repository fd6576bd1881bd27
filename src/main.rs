//! Command-line front end: one-shot instruction execution or an interactive
//! loop, with confirmation prompts on the terminal.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adjutant::orchestrator::{ConfirmationHandler, ConfirmationRequest, DenyAll};
use adjutant::types::{RunStatus, StepStatus};
use adjutant::{AssistantConfig, Instruction, Orchestrator, RunOutcome};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum OutputFormat {
    /// Human-readable per-step summary.
    Plain,
    /// Full execution trace as JSON.
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "adjutant", about = "Instruction-driven task orchestrator")]
struct Cli {
    /// Path to a TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "ADJUTANT_CONFIG")]
    config: Option<PathBuf>,

    /// Execute a single instruction and exit. Without it, read instructions
    /// interactively from stdin.
    #[arg(long, short = 'i')]
    instruction: Option<String>,

    #[arg(long, short = 'o', value_enum, default_value = "plain")]
    output: OutputFormat,

    /// Answer every confirmation with denial instead of prompting.
    #[arg(long)]
    non_interactive: bool,
}

/// Prompts on the terminal and reads one line for each confirmation request.
struct TerminalConfirmation {
    stdin: Mutex<BufReader<Stdin>>,
}

impl TerminalConfirmation {
    fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait::async_trait]
impl ConfirmationHandler for TerminalConfirmation {
    async fn deliver(&self, request: ConfirmationRequest) {
        println!(
            "confirm step '{}' ({:?})? [y/N]",
            request.step.capability, request.reason
        );
        let mut stdin = self.stdin.lock().await;
        let mut line = String::new();
        match stdin.read_line(&mut line).await {
            Ok(_) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => {
                request.approve()
            }
            _ => request.deny(),
        }
    }
}

fn render(outcome: &RunOutcome, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(&outcome.trace).context("serializing trace")
        }
        OutputFormat::Plain => {
            let mut out = String::new();
            for entry in &outcome.trace.entries {
                let mark = match entry.step.status {
                    StepStatus::Succeeded => "ok  ",
                    StepStatus::Failed => "FAIL",
                    StepStatus::Skipped => "skip",
                    _ => "??  ",
                };
                out.push_str(&format!("{} {} {}", mark, entry.step.id, entry.step.capability));
                if let Some(result) = &entry.result {
                    if let Some(error) = &result.error {
                        out.push_str(&format!(" ({})", error));
                    } else if let Some(output) = &result.output {
                        let text = output.as_binding_text();
                        let mut lines = text.lines();
                        if let Some(first) = lines.next() {
                            out.push_str(&format!(": {}", first));
                        }
                        let rest = lines.count();
                        if rest > 0 {
                            out.push_str(&format!(" (+{} more lines)", rest));
                        }
                    }
                }
                out.push('\n');
            }
            out.push_str(&format!("run {:?}", outcome.status));
            if let Some(error) = &outcome.error {
                out.push_str(&format!(": {}", error));
            }
            out.push('\n');
            Ok(out)
        }
    }
}

async fn run_once(
    orchestrator: &Orchestrator,
    text: &str,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<RunStatus> {
    let outcome = orchestrator
        .run(Instruction::new(text), cancel.clone())
        .await;
    print!("{}", render(&outcome, format)?);
    Ok(outcome.status)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AssistantConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AssistantConfig::default(),
    };

    let confirmations: Arc<dyn ConfirmationHandler> = if cli.non_interactive {
        Arc::new(DenyAll)
    } else {
        Arc::new(TerminalConfirmation::new())
    };
    let orchestrator =
        Orchestrator::bootstrap(config, confirmations).context("building orchestrator")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, aborting run");
                cancel.cancel();
            }
        });
    }

    if let Some(text) = &cli.instruction {
        let status = run_once(&orchestrator, text, cli.output, &cancel).await?;
        std::process::exit(match status {
            RunStatus::Completed => 0,
            RunStatus::Failed => 1,
            RunStatus::Aborted => 130,
        });
    }

    // Interactive loop: one instruction per line, empty line to quit.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            break;
        }
        run_once(&orchestrator, text, cli.output, &cancel).await?;
    }
    Ok(())
}
