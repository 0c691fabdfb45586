use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskgraph_agent::{ApprovalPrompt, AutoDenyApprovalPrompt, Orchestrator};
use taskgraph_core::RiskLevel;
use taskgraph_errors::ErrorHandler;
use taskgraph_store::ApprovalStore;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "taskgraph")]
#[command(about = "Agent orchestration core: classify, plan, execute, verify, replan", long_about = None)]
struct Cli {
    /// Workspace root the turn runs against. Defaults to the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Non-interactive mode: auto-deny every approval request instead of prompting.
    #[arg(long = "no-input", global = true)]
    no_input: bool,

    /// Override the configured LLM model for this invocation.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn: classify, plan, execute, replan as needed, then print the outcome.
    Run {
        /// The request to send. Reads stdin instead if omitted.
        prompt: Option<String>,

        /// Project identifier attached to every emitted event (defaults to the workspace's folder name).
        #[arg(long)]
        project_id: Option<String>,
    },
    /// Inspect and decide pending approval requests (§4.12).
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },
    /// Generate shell completions for this binary.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List every request still awaiting a decision.
    List,
    /// Approve a pending request by id.
    Approve { id: Uuid, #[arg(long)] comment: Option<String> },
    /// Reject a pending request by id.
    Reject { id: Uuid, #[arg(long)] comment: Option<String> },
}

fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;
    if let Err(e) = run(cli) {
        handle_error(e, json_mode);
    }
}

fn handle_error(error: anyhow::Error, json_mode: bool) -> ! {
    let handler = ErrorHandler::new().verbose(false);
    let message = handler.handle(&error);
    if json_mode {
        let payload = serde_json::json!({"error": error.to_string(), "message": message, "success": false});
        eprintln!("{}", serde_json::to_string_pretty(&payload).unwrap());
    } else {
        eprintln!("{message}");
    }
    std::process::exit(1);
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli
        .workspace
        .clone()
        .unwrap_or(std::env::current_dir().context("resolving current directory")?);
    taskgraph_observe::init_tracing(cli.verbose);

    match cli.command {
        Command::Run { prompt, project_id } => run_turn(&cli, &workspace, prompt, project_id),
        Command::Approvals { action } => run_approvals(&workspace, action, cli.json),
        Command::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn run_turn(cli: &Cli, workspace: &PathBuf, prompt: Option<String>, project_id: Option<String>) -> Result<()> {
    let prompt = match prompt {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_line(&mut buf)
                .context("reading prompt from stdin")?;
            buf.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("no prompt given: pass one as an argument or pipe it over stdin");
    }

    let project_id = project_id.unwrap_or_else(|| {
        workspace
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string())
    });

    let llm = build_llm_client(workspace)?;
    let approval_prompt: Box<dyn ApprovalPrompt> = if cli.no_input {
        Box::new(AutoDenyApprovalPrompt)
    } else {
        Box::new(TerminalApprovalPrompt)
    };
    let mut orchestrator =
        Orchestrator::with_model_override(workspace.clone(), llm, approval_prompt, cli.model.clone())
            .context("initializing orchestrator")?;

    let outcome = orchestrator.run_turn(&prompt, Uuid::now_v7(), &project_id);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.summary);
        if cli.verbose {
            eprintln!(
                "trace={} stop_reason={:?} last_step={:?}",
                outcome.trace_id, outcome.stop_reason, outcome.last_step_id
            );
        }
    }
    Ok(())
}

fn build_llm_client(workspace: &PathBuf) -> Result<Box<dyn taskgraph_llm::LlmClient>> {
    let config = taskgraph_core::AppConfig::ensure(workspace)?;
    let api_key = std::env::var(&config.llm.api_key_env).with_context(|| {
        format!(
            "missing API key: set the {} environment variable",
            config.llm.api_key_env
        )
    })?;
    let client = taskgraph_llm::HttpLlmClient::new(config.llm.endpoint.clone(), api_key)?;
    Ok(Box::new(client))
}

fn run_approvals(workspace: &PathBuf, action: ApprovalAction, json: bool) -> Result<()> {
    let store = ApprovalStore::new(workspace)?;
    match action {
        ApprovalAction::List => {
            let pending = store.list_pending()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("No pending approvals.");
            } else {
                for req in pending {
                    println!(
                        "{}  [{}]  {} — {}",
                        req.id, req.risk_level, req.intent_name, req.plan_summary
                    );
                }
            }
        }
        ApprovalAction::Approve { id, comment } => {
            let req = store.approve(id, "operator", comment)?;
            print_decision(&req, json)?;
        }
        ApprovalAction::Reject { id, comment } => {
            let req = store.reject(id, "operator", comment)?;
            print_decision(&req, json)?;
        }
    }
    Ok(())
}

fn print_decision(req: &taskgraph_core::ApprovalRequest, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(req)?);
    } else {
        println!("{}: {:?}", req.id, req.status);
    }
    Ok(())
}

/// Blocks on a terminal yes/no prompt (§4.12's one human-facing wait point).
/// Grounded on the teacher's interactive approval flow in
/// `deepseek-cli/src/commands/chat.rs`, narrowed from a rich TUI confirm
/// dialog to a plain stdin y/n since this binary has no chat surface.
struct TerminalApprovalPrompt;

impl ApprovalPrompt for TerminalApprovalPrompt {
    fn ask(&self, risk: RiskLevel, tool_name: &str, summary: &str) -> bool {
        print!("[{risk}] approve `{tool_name}`: {summary}? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}
