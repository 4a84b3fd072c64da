//! Command line interface for operating the relay. Supports initialization,
//! ingesting event files, rebuilding indexes, and serving the HTTP and
//! WebSocket endpoints.

mod config;
mod event;
mod filter;
mod limiter;
mod metrics;
mod registry;
mod relay;
mod server;
mod store;
mod validate;
mod ws;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use config::Settings;
use limiter::RateLimiter;
use relay::RelayCoordinator;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "rostr",
    author,
    version,
    about = "File-backed Nostr relay with live subscriptions",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Ingest one or more event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Rebuild indexes and the event log from stored events.
    Reindex,
    /// Launch the HTTP and WebSocket services.
    Serve,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            let store = Store::new(cfg.store_root.clone());
            store.init()?;
        }
        Commands::Ingest { files } => {
            let store = Store::new(cfg.store_root.clone());
            store.init()?;
            let validator =
                validate::Validator::new(cfg.max_past_skew_secs, cfg.max_future_skew_secs, cfg.verify_sig);
            for f in files {
                let data = fs::read_to_string(&f)?;
                let ev: event::Event = serde_json::from_str(&data)?;
                if let Err(reason) = validator.validate(&ev) {
                    anyhow::bail!("{}: {}", f, reason);
                }
                store.insert_if_absent(&ev)?;
            }
        }
        Commands::Reindex => {
            let store = Store::new(cfg.store_root.clone());
            store.reindex()?;
        }
        Commands::Serve => {
            let http_addr: SocketAddr = cfg.bind_http.as_str().parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.as_str().parse()?;
            let relay = Arc::new(RelayCoordinator::new(cfg)?);
            RateLimiter::spawn_sweeper(relay.limiter.clone(), Duration::from_secs(60));
            tokio::try_join!(
                server::serve_http(http_addr, relay.clone(), std::future::pending()),
                ws::serve_ws(ws_addr, relay, std::future::pending())
            )?;
        }
    }
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("rostr-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("BIND_WS=127.0.0.1:7778\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("RELAY_NAME=rostr\n");
    content.push_str("RELAY_DESCRIPTION=a small event relay\n");
    content.push_str("RELAY_CONTACT=\n");
    content.push_str("RELAY_PUBKEY=\n");
    content.push_str("EVENTS_PER_MINUTE=60\n");
    content.push_str("QUERIES_PER_MINUTE=120\n");
    content.push_str("CONNECTIONS_PER_ADDR=10\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
