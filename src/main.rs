//! Conclave - multi-agent orchestration
//!
//! CLI entry point: run a session interactively or dump the message log.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conclave::config::LoggingConfig;
use conclave::{ConclaveConfig, MessageId, MessageLog, OrchestratorClient, Session, TaskId};

/// Conclave multi-agent orchestrator
#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(about = "Multi-agent orchestration over a shared message log")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./conclave.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator and agents; read requests from stdin
    Run,
    /// Print the durable message log as JSON lines
    Log {
        /// Only entries after this id
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Log file (defaults to log.path from the configuration)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConclaveConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Log { since, path } => dump_log(&config, since, path),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(config: ConclaveConfig) -> Result<()> {
    info!("Starting Conclave v{}", env!("CARGO_PKG_VERSION"));
    let session = Session::start(&config).context("Failed to start session")?;
    let client = session.client();

    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Unprintable event"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("agents: {}", session.agent_names().join(", "));
    println!("commands: /status /board /task <id> /cancel <id> /broadcast <text> /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = handle_line(&client, line).await {
            eprintln!("error: {e:#}");
        }
    }

    drop(client);
    session.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn handle_line(client: &OrchestratorClient, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let output = match command {
        "/status" => serde_json::to_string_pretty(&client.get_status().await?)?,
        "/board" => serde_json::to_string_pretty(&client.board().await?)?,
        "/task" => serde_json::to_string_pretty(&client.task(parse_task_id(rest)?).await?)?,
        "/cancel" => {
            let task_id = parse_task_id(rest)?;
            client.cancel(task_id).await?;
            format!("cancellation requested for {task_id}")
        }
        "/broadcast" => {
            if rest.is_empty() {
                bail!("usage: /broadcast <text>");
            }
            format!("broadcast {}", client.broadcast(rest).await?)
        }
        other if other.starts_with('/') => bail!("unknown command {other}"),
        _ => serde_json::to_string_pretty(&client.assign_task(line).await?)?,
    };

    println!("{output}");
    Ok(())
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    if raw.is_empty() {
        bail!("a task id is required");
    }
    Ok(raw.parse()?)
}

fn dump_log(config: &ConclaveConfig, since: u64, path: Option<PathBuf>) -> Result<()> {
    let Some(path) = path.or_else(|| config.log.path.clone()) else {
        bail!("no log file: pass --path or set log.path");
    };
    if !path.exists() {
        bail!("log file {} does not exist", path.display());
    }

    let log = MessageLog::read(&path)
        .with_context(|| format!("Failed to read log {}", path.display()))?;
    for message in log.read_from(Some(MessageId(since))) {
        println!("{}", serde_json::to_string(&message)?);
    }
    Ok(())
}
