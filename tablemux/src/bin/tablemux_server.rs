//! Standalone tablemux server.
//!
//! Hosts tables loaded from JSON files and serves them over TCP.
//!
//! ```bash
//! tablemux-server --listen 127.0.0.1:8080 --table prices=prices.json --index prices=symbol
//! RUST_LOG=tablemux=debug tablemux-server
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tablemux::{Server, ServerConfig, TableData};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "tablemux-server")]
#[command(about = "Serve shared data tables over a multiplexed protocol", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Bytes per binary chunk frame
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Largest frame accepted or sent
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Host a table from a JSON file (records, columns or schema): NAME=PATH
    #[arg(long = "table", value_parser = parse_pair::<PathBuf>)]
    tables: Vec<(String, PathBuf)>,

    /// Primary index column of a hosted table: NAME=COLUMN
    #[arg(long = "index", value_parser = parse_pair::<String>)]
    indexes: Vec<(String, String)>,

    /// Reject client mutations of hosted tables
    #[arg(long)]
    lock: bool,
}

fn parse_pair<T: From<String>>(s: &str) -> Result<(String, T), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("empty name in '{s}'"));
    }
    Ok((name.to_string(), T::from(value.to_string())))
}

fn server_config(args: &Args) -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(chunk_size) = args.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if let Some(max_frame_size) = args.max_frame_size {
        config = config.with_max_frame_size(max_frame_size);
    }
    config
}

fn load_tables(server: &Server, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut indexes: HashMap<&str, &str> = args
        .indexes
        .iter()
        .map(|(name, column)| (name.as_str(), column.as_str()))
        .collect();
    for (name, path) in &args.tables {
        let text = std::fs::read_to_string(path)?;
        let data: TableData = serde_json::from_str(&text)?;
        let index = indexes.remove(name.as_str()).map(str::to_string);
        let table = server.create_table(name.clone(), data, index)?;
        tracing::info!(table = %name, path = %path.display(), rows = table.size(), "loaded table");
    }
    for name in indexes.keys() {
        tracing::warn!(table = %name, "--index given for a table that was not loaded");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let server = Server::new(server_config(&args));
    load_tables(&server, &args)?;
    if args.lock {
        server.lock();
    }

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, tables = ?server.hosted_tables(), locked = args.lock, "tablemux server started");

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(sessions = server.session_count(), "shutting down");
        }
    }
    Ok(())
}
