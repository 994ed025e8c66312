//! vaultpilot
//!
//! Command-line front end for the orchestration core: run one prompt
//! against a vault, or list the agent's commands.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use vaultpilot::config::default_settings_path;
use vaultpilot::logging::{init_logging, LogConfig};
use vaultpilot::permission::HandlerError;
use vaultpilot::{
    AgentService, ApproveAll, PermissionHandler, QueryOptions, QueryRequest, Settings,
    SharedSettings,
};
use vaultpilot_connectors::ClaudeCliLauncher;
use vaultpilot_protocol::{PermissionDecision, StreamChunk, ToolPermissionRequest};

#[derive(Parser, Debug)]
#[command(name = "vaultpilot")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "VAULTPILOT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Vault folder the agent works in
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one prompt and stream the answer
    Ask {
        /// Run on a disposable connection
        #[arg(long)]
        cold: bool,

        /// Model override for this prompt
        #[arg(long)]
        model: Option<String>,

        /// Restrict the turn to these tools (repeatable)
        #[arg(long = "tool")]
        tools: Vec<String>,

        /// Approve every tool request without asking
        #[arg(short, long)]
        yes: bool,

        prompt: String,
    },

    /// List the commands the agent advertises
    Commands,
}

/// Asks on the terminal before each tool call.
struct TerminalPrompt;

#[async_trait]
impl PermissionHandler for TerminalPrompt {
    async fn request_permission(
        &self,
        request: &ToolPermissionRequest,
    ) -> Result<PermissionDecision, HandlerError> {
        let question = format!("Allow {}? {} [y/N/a] ", request.tool_name, request.description);
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            stderr.write_all(question.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await??;

        Ok(match answer.trim() {
            "y" | "Y" => PermissionDecision::Allow,
            "a" | "A" => PermissionDecision::AllowAndRemember,
            _ => PermissionDecision::Deny {
                message: "Denied from the terminal".to_string(),
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logging = init_logging(LogConfig::from_env())?;

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = Settings::load(&settings_path)
        .with_context(|| format!("reading {}", settings_path.display()))?;
    if let Some(vault) = cli.vault {
        settings.vault_path = Some(vault);
    }
    if settings.vault_path.is_none() {
        settings.vault_path = Some(std::env::current_dir()?);
    }
    info!(
        component = "cli",
        event = "cli.start",
        run_id = %logging.run_id,
        settings = %settings_path.display(),
    );

    let settings = Arc::new(SharedSettings::new(settings));
    let diagnostics = Arc::new(|message: &str| eprintln!("[queue] {}", message));

    match cli.command {
        Command::Ask {
            cold,
            model,
            tools,
            yes,
            prompt,
        } => {
            let permissions: Arc<dyn PermissionHandler> = if yes {
                Arc::new(ApproveAll)
            } else {
                Arc::new(TerminalPrompt)
            };
            let service = AgentService::new(
                Arc::new(ClaudeCliLauncher),
                settings,
                permissions,
                diagnostics,
            );
            let options = QueryOptions {
                allowed_tools: (!tools.is_empty()).then_some(tools),
                model,
                force_cold_start: cold,
                ..Default::default()
            };
            let request = QueryRequest::new(prompt).with_options(options);
            let ok = stream_answer(&service, request).await;
            service.shutdown().await;
            if !ok {
                drop(logging);
                std::process::exit(1);
            }
        }
        Command::Commands => {
            let service = AgentService::new(
                Arc::new(ClaudeCliLauncher),
                settings,
                Arc::new(ApproveAll),
                diagnostics,
            );
            let commands = service.supported_commands().await;
            service.shutdown().await;
            for command in commands? {
                match command.argument_hint {
                    Some(hint) => println!("/{} {}  {}", command.name, hint, command.description),
                    None => println!("/{}  {}", command.name, command.description),
                }
            }
        }
    }

    Ok(())
}

/// Print chunks as they arrive. Returns false when the answer ended in an error.
async fn stream_answer(service: &AgentService, request: QueryRequest) -> bool {
    let mut rx = service.query(request);
    let mut stdout = std::io::stdout();
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::Text { content } => {
                let _ = stdout.write_all(content.as_bytes());
                let _ = stdout.flush();
            }
            StreamChunk::Thinking { .. } => {}
            StreamChunk::ToolUse { name, .. } => eprintln!("\n[tool] {}", name),
            StreamChunk::ToolResult {
                is_error: true,
                content,
                ..
            } => eprintln!("[tool error] {}", content),
            StreamChunk::ToolResult { .. } => {}
            StreamChunk::Usage { usage } => eprintln!(
                "\n[usage] in={} out={} cached={} cost=${:.4}",
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
                usage.cost_usd.unwrap_or(0.0)
            ),
            StreamChunk::Error { message } => {
                eprintln!("\nerror: {}", message);
                return false;
            }
            StreamChunk::Done => {
                println!();
                return true;
            }
        }
    }
    false
}
