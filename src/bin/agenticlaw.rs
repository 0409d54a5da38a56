//! agenticlaw — terminal-resident AI coding agent
//!
//! Usage:
//!   agenticlaw --ask "prompt" [session-id]   → headless single turn
//!   agenticlaw --task "description"          → fire-and-forget background turn
//!   agenticlaw --task-list                   → list queued/recent background tasks
//!   agenticlaw --sse [--sse-port N]          → run the embedded SSE/WS gateway
//!   agenticlaw --sse-daemon                  → same, detached in the background
//!   agenticlaw --sse-stop / --sse-status     → control a running daemon
//!   agenticlaw chat --session X              → interactive TUI chat mode
//!   agenticlaw -c --ask "..."                 → resume the most recent session

use agenticlaw_agent::{bootstrap, AgentConfig, AgentEvent, AgentRuntime};
use agenticlaw_core::{AuthConfig, AuthMode, BindMode, GatewayConfig};
use agenticlaw_gateway::{service, start_gateway, ExtendedConfig};
use agenticlaw_tools::permission::AutoApproveSink;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "agenticlaw",
    about = "Terminal-resident AI coding agent",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Headless turn: send a prompt and print the transcript, then exit.
    /// Takes an optional session id as a second value.
    #[arg(long, num_args = 1..=2, value_names = ["PROMPT", "SESSION_ID"])]
    ask: Option<Vec<String>>,

    /// Queue a background turn and return immediately.
    #[arg(long, value_name = "DESCRIPTION")]
    task: Option<String>,

    /// List background tasks queued via --task.
    #[arg(long, default_value_t = false)]
    task_list: bool,

    /// Run the embedded SSE/WebSocket gateway in the foreground.
    #[arg(long, default_value_t = false)]
    sse: bool,

    /// Run the embedded gateway detached from the terminal.
    #[arg(long, default_value_t = false)]
    sse_daemon: bool,

    /// Stop a gateway started with --sse-daemon.
    #[arg(long, default_value_t = false)]
    sse_stop: bool,

    /// Query a running gateway's /health endpoint.
    #[arg(long, default_value_t = false)]
    sse_status: bool,

    /// Port for --sse/--sse-daemon/--sse-status (default 18789).
    #[arg(long)]
    sse_port: Option<u16>,

    /// Idle timeout in seconds before --sse-daemon shuts itself down (0 = never).
    #[arg(long, default_value_t = 0)]
    sse_timeout: u64,

    /// Workspace directory (default: current directory).
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Resume the most recently active session in --work-dir.
    #[arg(short = 'c', long = "continue", default_value_t = false)]
    resume: bool,

    /// Verbose logging and unbuffered output.
    #[arg(long, default_value_t = false)]
    dev: bool,

    /// Model override.
    #[arg(short, long)]
    model: Option<String>,

    /// Bind mode for --sse/--sse-daemon: lan or loopback.
    #[arg(long, default_value = "lan")]
    bind: String,

    /// Auth token for the gateway (or set AGENTICLAW_GATEWAY_TOKEN).
    #[arg(long)]
    token: Option<String>,

    /// Disable gateway authentication.
    #[arg(long, default_value_t = false)]
    no_auth: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive TUI chat
    Chat {
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        #[arg(short, long)]
        session: Option<String>,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(short, long)]
        resume: bool,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.dev);

    match cli.command {
        Some(Commands::Chat { workspace, session, model, resume }) => {
            agenticlaw_gateway::tui::run_tui(workspace, session, model, resume).await?;
            return Ok(());
        }
        Some(Commands::Version) => {
            println!("agenticlaw v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        None => {}
    }

    let workspace_root = cli
        .work_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let port = cli.sse_port.unwrap_or(18789);

    if cli.sse_stop {
        return sse_stop(&workspace_root);
    }
    if cli.sse_status {
        let health = service::check_health(port).await?;
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }
    if cli.sse_daemon {
        return sse_daemon(&workspace_root, port, cli.dev);
    }
    if cli.sse {
        return run_sse_foreground(&cli, &workspace_root, port).await;
    }
    if let Some(ref ask) = cli.ask {
        let prompt = ask[0].clone();
        let session_id = ask.get(1).cloned();
        let code = run_ask(&cli, &workspace_root, &prompt, session_id.as_deref()).await?;
        std::process::exit(code);
    }
    if let Some(ref description) = cli.task {
        return queue_task(&workspace_root, description);
    }
    if cli.task_list {
        return print_task_list(&workspace_root);
    }

    eprintln!("No command given. Try --ask \"<prompt>\", --task \"<description>\", --sse, or `chat`.");
    eprintln!("See `agenticlaw --help` for the full flag list.");
    Ok(())
}

fn init_tracing(dev: bool) {
    let default_filter = if dev { "agenticlaw=debug,tower_http=debug" } else { "agenticlaw=info,tower_http=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_runtime(cli: &Cli, workspace_root: &PathBuf) -> anyhow::Result<Arc<AgentRuntime>> {
    let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
    let config = AgentConfig {
        default_model: cli
            .model
            .clone()
            .or_else(|| std::env::var("AGENTICLAW_MODEL").ok())
            .unwrap_or_else(|| "claude-opus-4-6-20250929".to_string()),
        max_tool_iterations: 25,
        system_prompt: None,
        workspace_root: workspace_root.clone(),
        sleep_threshold_pct: 1.0,
        retry_mid_stream: true,
    };
    Ok(bootstrap(&api_key, config, AutoApproveSink).await)
}

/// `--ask`: run one turn to completion, printing its transcript, and return
/// the process exit code (0 on a clean `Done`, 1 on `Error`/`Aborted`).
async fn run_ask(cli: &Cli, workspace_root: &PathBuf, prompt: &str, session_id: Option<&str>) -> anyhow::Result<i32> {
    let runtime = build_runtime(cli, workspace_root).await?;
    let (session_key, _ctx_path) = runtime
        .resolve_session(session_id, cli.resume)
        .ok_or_else(|| anyhow::anyhow!("no .ctx files found to resume in {}", workspace_root.display()))?;

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let cancel = CancellationToken::new();
    let runtime_clone = runtime.clone();
    let key_clone = session_key.clone();
    let prompt_owned = prompt.to_string();
    let cancel_clone = cancel.clone();
    let turn = tokio::spawn(async move {
        runtime_clone
            .run_turn_cancellable(&key_clone, &prompt_owned, tx, cancel_clone)
            .await
    });

    let mut exit_code = 0;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Text(text) => print!("{}", text),
            AgentEvent::Thinking(text) => eprint!("{}", text),
            AgentEvent::ToolCallStart { name, .. } => eprintln!("\n[tool: {}]", name),
            AgentEvent::ToolResult { name, is_error, .. } if is_error => {
                eprintln!("[tool error: {}]", name);
            }
            AgentEvent::ToolSkipped { name, reason, .. } => {
                eprintln!("[tool skipped: {} — {}]", name, reason);
            }
            AgentEvent::Error(message) => {
                eprintln!("\nerror: {}", message);
                exit_code = 1;
            }
            AgentEvent::Aborted => {
                eprintln!("\naborted");
                exit_code = 1;
            }
            AgentEvent::Done { .. } => {
                println!();
            }
            _ => {}
        }
    }
    turn.await?.map_err(|e| anyhow::anyhow!(e))?;
    Ok(exit_code)
}

/// `--task`: re-exec this binary with `--ask` as a detached, orphaned child
/// process so the turn keeps running after this process exits, and record
/// it in a simple append-only queue file for `--task-list`.
fn queue_task(workspace_root: &PathBuf, description: &str) -> anyhow::Result<()> {
    let queue_dir = workspace_root.join(".agenticlaw");
    std::fs::create_dir_all(&queue_dir)?;
    let queue_path = queue_dir.join("tasks.jsonl");

    let session_id = format!("task-{}", uuid::Uuid::new_v4().to_string()[..8].to_string());
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("--ask")
        .arg(description)
        .arg(&session_id)
        .arg("--work-dir")
        .arg(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let entry = serde_json::json!({
        "session_id": session_id,
        "description": description,
        "pid": child.id(),
        "queued_at": agenticlaw_agent::ctx_file::now_timestamp(),
    });
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&queue_path)?;
    writeln!(file, "{}", entry)?;

    println!("Queued background task '{}' (session {}, pid {})", description, session_id, child.id());
    Ok(())
}

fn print_task_list(workspace_root: &PathBuf) -> anyhow::Result<()> {
    let queue_path = workspace_root.join(".agenticlaw/tasks.jsonl");
    let Ok(content) = std::fs::read_to_string(&queue_path) else {
        println!("No background tasks queued.");
        return Ok(());
    };
    for line in content.lines() {
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(line) else { continue };
        let session = entry["session_id"].as_str().unwrap_or("?");
        let desc = entry["description"].as_str().unwrap_or("?");
        let queued_at = entry["queued_at"].as_str().unwrap_or("?");
        let ctx = agenticlaw_agent::ctx_file::find_by_id(workspace_root, session);
        let status = if ctx.is_some() { "ran" } else { "unknown" };
        println!("{}  [{}]  {}  ({})", queued_at, status, desc, session);
    }
    Ok(())
}

async fn run_sse_foreground(cli: &Cli, workspace_root: &PathBuf, port: u16) -> anyhow::Result<()> {
    let config = build_gateway_config(cli, workspace_root, port)?;
    start_gateway(config).await?;
    Ok(())
}

fn build_gateway_config(cli: &Cli, workspace_root: &PathBuf, port: u16) -> anyhow::Result<ExtendedConfig> {
    let bind = match cli.bind.as_str() {
        "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
        _ => BindMode::Lan,
    };
    let auth = if cli.no_auth {
        AuthConfig { mode: AuthMode::None, token: None }
    } else {
        AuthConfig { mode: AuthMode::Token, token: cli.token.clone() }
    };
    Ok(ExtendedConfig {
        gateway: GatewayConfig { port, bind, auth },
        anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        workspace_root: workspace_root.clone(),
        system_prompt: None,
    })
}

fn pidfile_path(workspace_root: &PathBuf) -> PathBuf {
    workspace_root.join(".agenticlaw/sse-daemon.pid")
}

/// Spawns a detached copy of this process running `--sse`, records its pid,
/// and returns immediately. On Unix an orphaned child is reparented to
/// init rather than killed, so it keeps serving after this process exits.
fn sse_daemon(workspace_root: &PathBuf, port: u16, dev: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(workspace_root.join(".agenticlaw"))?;
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--sse")
        .arg("--sse-port")
        .arg(port.to_string())
        .arg("--work-dir")
        .arg(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if dev {
        cmd.arg("--dev");
    }
    let child = cmd.spawn()?;
    std::fs::write(pidfile_path(workspace_root), child.id().to_string())?;
    println!("Started gateway daemon on port {} (pid {})", port, child.id());
    Ok(())
}

fn sse_stop(workspace_root: &PathBuf) -> anyhow::Result<()> {
    let pidfile = pidfile_path(workspace_root);
    let pid: i32 = std::fs::read_to_string(&pidfile)
        .map_err(|_| anyhow::anyhow!("no daemon pidfile at {}", pidfile.display()))?
        .trim()
        .parse()?;

    #[cfg(unix)]
    {
        let status = std::process::Command::new("kill").arg("-TERM").arg(pid.to_string()).status()?;
        if !status.success() {
            anyhow::bail!("failed to signal pid {} (already exited?)", pid);
        }
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("--sse-stop is only implemented on unix (pid {})", pid);
    }

    let _ = std::fs::remove_file(&pidfile);
    println!("Stopped gateway daemon (pid {})", pid);
    Ok(())
}
