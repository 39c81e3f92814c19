//! Server entry point: parse the CLI surface, initialize logging away
//! from stdout (the agent channel owns it), build the connection in
//! `passive`, and run the agent loop until stdin closes.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bridge_server::cli::Cli;
use bridge_server::connection::{self, Connection, ConnectionConfig};
use bridge_server::whitelist::{Whitelist, WHITELIST_URL_ENV};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Structured logging with env-filter support. stdout is reserved
    // for the agent channel, so logs go to stderr or the log file.
    // Override the level with RUST_LOG.
    let default_filter = if cli.script_mode {
        "bridge_server=warn"
    } else {
        "bridge_server=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let _log_guard = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "bridge-server.log".into());
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, file),
            );
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    info!(
        "🌉 Bridge server v{} starting (extension port {})",
        connection::VERSION,
        cli.port
    );

    let config = ConnectionConfig {
        port: cli.port,
        debug: cli.debug_enabled(),
        no_truncate: cli.no_truncate(),
        script_mode: cli.script_mode,
    };
    let whitelist = Whitelist::new(
        Whitelist::default_cache_path(),
        std::env::var(WHITELIST_URL_ENV).ok(),
    );

    let (conn, events) = Connection::new(config, whitelist);
    tokio::spawn(connection::run_events(conn.clone(), events));
    connection::spawn_whitelist_refresher(&conn);

    bridge_server::agent::run(conn).await
}
