use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use secrecy::SecretString;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use fleet_agent::agent::Agent;
use fleet_agent::config::{AgentConfig, ConnectionMode};
use fleet_agent::lifecycle::{agent_key, FileStatusStore, StatusStore};
use fleet_agent::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(version)]
#[command(about = "Worker agent that executes tasks for a remote control plane")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Register with the control plane and execute tasks until stopped
    Run(RunArgs),

    /// Print the status entry an agent wrote for its watcher
    Status(StatusArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration file; flags override its values
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Base URL of the control plane
    #[arg(long)]
    manager_url: Option<String>,

    #[arg(long)]
    account_id: Option<String>,

    /// Agent token sent as a bearer credential
    #[arg(long, env = "AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Poll for task events instead of holding a duplex stream
    #[arg(long)]
    poll: bool,

    /// Working directory for the status store and profiles
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address of the local status endpoint (optional)
    #[arg(long)]
    status_addr: Option<SocketAddr>,

    /// A watcher process supervises this agent
    #[arg(long)]
    watched: bool,

    // === TLS Options ===
    /// Enable mTLS towards the control plane
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to agent certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to agent private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Domain name expected in the control plane's certificate
    #[arg(long, requires = "tls")]
    domain_name: Option<String>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Status Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Data directory of the agent
    #[arg(long, default_value = "agent-data")]
    data_dir: PathBuf,

    /// Process id of the agent; every agent entry is shown when omitted
    #[arg(long)]
    pid: Option<u32>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    format: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Agent
// =============================================================================

async fn build_config(args: RunArgs) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path).await?,
        None => AgentConfig::default(),
    };
    config.apply_env();

    if let Some(url) = args.manager_url {
        config.manager_url = url;
    }
    if let Some(account_id) = args.account_id {
        config.account_id = account_id;
    }
    if let Some(token) = args.token {
        config.agent_token = Some(SecretString::from(token));
    }
    if args.poll {
        config.connection.mode = ConnectionMode::Poll;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.status_addr.is_some() {
        config.status_addr = args.status_addr;
    }
    if args.watched {
        config.lifecycle.watched = true;
    }
    if args.tls {
        config.tls.enabled = true;
        config.tls.ca_cert_path = args.ca_cert.or(config.tls.ca_cert_path);
        config.tls.cert_path = args.cert.or(config.tls.cert_path);
        config.tls.key_path = args.key.or(config.tls.key_path);
        config.tls.domain_name = args.domain_name.or(config.tls.domain_name);
    }
    if args.allow_insecure {
        config.tls.allow_insecure = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run_agent(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args).await?;

    tracing::info!(
        account_id = %config.account_id,
        manager_url = %config.manager_url,
        mode = ?config.connection.mode,
        version = %config.version,
        data_dir = %config.data_dir.display(),
        status_addr = ?config.status_addr,
        tls_enabled = config.tls.enabled,
        multi_version = config.lifecycle.multi_version,
        "Starting fleet-agent"
    );

    let shutdown = install_shutdown_handler();
    let agent = Agent::connect(config).await?;
    agent.run(shutdown).await?;

    tracing::info!("fleet-agent stopped");
    Ok(())
}

// =============================================================================
// Status
// =============================================================================

async fn agent_keys(status_dir: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut keys = Vec::new();
    let mut entries = match tokio::fs::read_dir(status_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = name.strip_suffix(".json") {
            if key.starts_with("agent-") {
                keys.push(key.to_string());
            }
        }
    }
    keys.sort();
    Ok(keys)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_entry(key: &str, entry: &Map<String, Value>) {
    println!("{}", key);
    println!("{}", "=".repeat(40));
    for (field, value) in entry {
        if field == "perf" {
            continue;
        }
        println!("{:<20} {}", field, format_value(value));
    }
    if let Some(Value::Object(perf)) = entry.get("perf") {
        println!();
        println!("Performance:");
        for (field, value) in perf {
            println!("  {:<18} {}", field, format_value(value));
        }
    }
    println!();
}

async fn show_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig {
        data_dir: args.data_dir,
        ..AgentConfig::default()
    };
    let store = FileStatusStore::open(config.status_dir(), config.inbox_dir()).await?;

    let keys = match args.pid {
        Some(pid) => vec![agent_key(pid)],
        None => agent_keys(&config.status_dir()).await?,
    };

    let mut entries = Map::new();
    for key in keys {
        let entry = store.get(&key).await?;
        if !entry.is_empty() {
            entries.insert(key, Value::Object(entry));
        }
    }

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No agent status found.");
            }
            for (key, entry) in &entries {
                if let Value::Object(entry) = entry {
                    print_entry(key, entry);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_agent(run_args).await?;
        }
        Commands::Status(status_args) => {
            show_status(status_args).await?;
        }
    }

    Ok(())
}
