//! Courier Node -- edge gateway and delivery pipeline in one binary.
//!
//! Usage:
//!   courier-node                      # Run with default config
//!   courier-node --config path.toml   # Run with custom config
//!   courier-node failed               # List intents that exhausted retries

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use courier_node::bus::{BusPolicy, LocalBus, MessageBus};
use courier_node::config::NodeConfig;
use courier_node::runtime::NodeRuntime;
use courier_node::{expand_tilde, hash_token, load_or_create_token};
use courier_storage::{SqliteStorage, Store};

#[derive(Parser)]
#[command(name = "courier-node", about = "Courier message delivery node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.courier/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries local API)
    Status,
    /// Show pipeline counters and store counts
    Diagnostics,
    /// List outbox intents that exhausted their retries
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Put a failed intent back in the outbox
    Requeue {
        /// Outbox intent id
        id: i64,
    },
    /// Manage conversations
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Client token helpers
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session with its initial members
    Create {
        session_id: String,
        #[arg(long, default_value = "")]
        name: String,
        /// direct or group
        #[arg(long, default_value = "group")]
        kind: String,
        #[arg(long = "member")]
        members: Vec<String>,
    },
    /// List the members of a session
    Members { session_id: String },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print the SHA-256 hash to put in `edge.tokens`
    Hash { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_node=info,courier_api=info,courier_ingest=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
        Some(Commands::Status) => {
            cli_api_call(&cfg, "/api/v1/status", "{}").await?;
        }
        Some(Commands::Diagnostics) => {
            cli_api_call(&cfg, "/api/v1/diagnostics", "{}").await?;
        }
        Some(Commands::Failed { limit }) => {
            let body = serde_json::json!({ "limit": limit }).to_string();
            let value = cli_api_request(&cfg, "/api/v1/outbox/failed", &body).await?;
            print_failed(&value);
        }
        Some(Commands::Requeue { id }) => {
            let body = serde_json::json!({ "id": id }).to_string();
            cli_api_call(&cfg, "/api/v1/outbox/requeue", &body).await?;
        }
        Some(Commands::Session { action }) => match action {
            SessionAction::Create {
                session_id,
                name,
                kind,
                members,
            } => {
                let body = serde_json::json!({
                    "session_id": session_id,
                    "name": name,
                    "kind": kind,
                    "members": members,
                })
                .to_string();
                cli_api_call(&cfg, "/api/v1/sessions/create", &body).await?;
            }
            SessionAction::Members { session_id } => {
                let body = serde_json::json!({ "session_id": session_id }).to_string();
                cli_api_call(&cfg, "/api/v1/sessions/members", &body).await?;
            }
        },
        Some(Commands::Token { action }) => match action {
            TokenAction::Hash { token } => println!("{}", hash_token(&token)),
        },
    }

    Ok(())
}

/// POST to the local node API and return the JSON body. Exits on HTTP errors.
async fn cli_api_request(
    cfg: &NodeConfig,
    path: &str,
    body: &str,
) -> anyhow::Result<serde_json::Value> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde(&cfg.node.token_path);
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .bearer_auth(token)
        .body(body.to_string())
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &NodeConfig, path: &str, body: &str) -> anyhow::Result<()> {
    let value = cli_api_request(cfg, path, body).await?;
    match value {
        serde_json::Value::String(text) => println!("{text}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_failed(value: &serde_json::Value) {
    let intents = value["intents"].as_array().cloned().unwrap_or_default();
    if intents.is_empty() {
        println!("No failed intents.");
        return;
    }
    println!("{:>8}  {:>20}  {:>7}  {:<19}  LAST ERROR", "ID", "MSG ID", "RETRIES", "UPDATED");
    for intent in intents {
        println!(
            "{:>8}  {:>20}  {:>7}  {:<19}  {}",
            intent["id"],
            intent["msg_id"],
            intent["retry_count"],
            format_ms(intent["updated_at"].as_i64().unwrap_or_default()),
            intent["last_error"].as_str().unwrap_or("-"),
        );
    }
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    tracing::info!(
        node_id = %cfg.node.node_id,
        version = env!("CARGO_PKG_VERSION"),
        started = %chrono::Utc::now().to_rfc3339(),
        "starting courier-node"
    );

    let db_path = expand_tilde(&cfg.node.database);
    let store: Arc<dyn Store> = Arc::new(SqliteStorage::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "storage opened");

    let bearer_token = load_or_create_token(&expand_tilde(&cfg.node.token_path))?;

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new(BusPolicy {
        redelivery_delay: Duration::from_millis(cfg.bus.redelivery_delay_ms),
        max_deliver: cfg.bus.max_deliver,
        queue_capacity: cfg.bus.queue_capacity,
    }));

    let runtime = NodeRuntime::start(&cfg, store, bearer_token, bus).await?;
    tracing::info!("all tasks spawned, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    runtime.shutdown().await;
    Ok(())
}
