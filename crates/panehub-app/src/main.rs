mod commands;
mod event_pump;
mod ipc;
mod recorder;
mod server;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use panehub_core::{OrchestratorConfig, SessionRegistry};
use panehub_db::{history, settings};
use rusqlite::Connection;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;

use server::Server;
use state::AppState;

#[derive(Parser)]
#[command(name = "panehubd")]
#[command(version)]
#[command(about = "Session and pane orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default).
    Serve(ServeArgs),
    /// Send one JSON request to a running daemon and print the response.
    Call {
        /// Request object, e.g. '{"op":"list_sessions"}'. `id` defaults to 1.
        json: String,
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Keep printing subscription events until the pane exits.
        #[arg(long)]
        follow: bool,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    /// Default log filter; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            socket: None,
            db: None,
            log_level: "info".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => serve(args).await,
        Commands::Call { json, socket, follow } => {
            init_logging("warn");
            call(socket.unwrap_or_else(server::default_socket_path), &json, follow).await
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn default_db_path() -> PathBuf {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    data_home.join("panehub").join("panehub.db")
}

/// Build the orchestrator config from stored settings and seed missing defaults.
fn load_config(conn: &Connection) -> rusqlite::Result<OrchestratorConfig> {
    let stored = settings::all(conn)?;
    let mut config = OrchestratorConfig::default();
    config.apply_settings(stored.iter().map(|(key, value)| (key.as_str(), value.as_str())));

    let defaults = OrchestratorConfig::default().to_settings();
    let seeded = settings::seed_defaults(conn, defaults.iter().map(|(key, value)| (key.as_str(), value.as_str())))?;
    if seeded > 0 {
        log::info!("[daemon] seeded {seeded} default setting(s)");
    }
    Ok(config)
}

async fn serve(args: ServeArgs) -> Result<()> {
    init_logging(&args.log_level);

    let db_path = args.db.unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
    }
    let conn = panehub_db::open(&db_path).with_context(|| format!("failed to open database: {}", db_path.display()))?;
    let config = load_config(&conn).context("failed to load settings")?;

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let dangling = history::close_dangling(&conn, &now).context("failed to tidy session history")?;
    if dangling > 0 {
        log::info!("[daemon] closed {dangling} history row(s) left open by a previous run");
    }

    let state = AppState::new(SessionRegistry::new(config), conn);
    let recorder = recorder::start_recorder(state.db.clone(), state.registry.subscribe_events())
        .context("failed to start history recorder")?;
    state.registry.start_metrics();

    let server = Server::bind(args.socket.unwrap_or_else(server::default_socket_path))?;
    log::info!(
        "[daemon] panehubd {} ready on {} (db {})",
        env!("CARGO_PKG_VERSION"),
        server.socket_path().display(),
        db_path.display()
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(state.clone(), stop_rx));

    shutdown_signal().await;
    log::info!("[daemon] shutting down");
    let _ = stop_tx.send(true);
    if let Err(e) = server_task.await {
        log::warn!("[daemon] server task ended abnormally: {e}");
    }

    for report in state.registry.shutdown().await {
        if !report.is_clean() {
            log::warn!(
                "[daemon] session {} closed with {} failure(s)",
                report.session_id,
                report.failed.len()
            );
        }
    }

    // The recorder stops once the registry is gone.
    drop(state);
    let joined = tokio::time::timeout(Duration::from_secs(2), tokio::task::spawn_blocking(move || recorder.join())).await;
    if joined.is_err() {
        log::warn!("[daemon] history recorder did not stop in time");
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("[daemon] cannot listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("[daemon] cannot listen for ctrl-c: {e}");
    }
}

async fn call(socket: PathBuf, json: &str, follow: bool) -> Result<()> {
    let mut request: Value = serde_json::from_str(json).context("request is not valid JSON")?;
    let object = request.as_object_mut().context("request must be a JSON object")?;
    let id = object
        .entry("id")
        .or_insert_with(|| Value::from(1))
        .as_u64()
        .context("id must be an unsigned integer")?;

    let stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("cannot connect to {}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut line = request.to_string();
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let mut ok = None;
    while let Some(line) = lines.next_line().await? {
        let message: Value = serde_json::from_str(&line).context("daemon sent invalid JSON")?;
        let is_response = message["type"] == "response" && message["id"] == id;
        if is_response || (follow && message["type"] == "event") {
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        if is_response {
            ok = message["ok"].as_bool();
            if !follow || ok != Some(true) {
                break;
            }
        }
        if follow && message["event"]["type"] == "exit" {
            break;
        }
    }

    match ok {
        Some(true) => Ok(()),
        Some(false) => anyhow::bail!("request failed"),
        None => anyhow::bail!("connection closed before a response arrived"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_settings_override_defaults_and_missing_ones_are_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        panehub_db::schema::initialize(&conn).unwrap();
        settings::set(&conn, "close_grace_ms", "750").unwrap();
        settings::set(&conn, "scrollback_lines", "not a number").unwrap();

        let config = load_config(&conn).unwrap();
        assert_eq!(config.close_grace_ms, 750);
        assert_eq!(config.scrollback_lines, OrchestratorConfig::default().scrollback_lines);

        let stored = settings::all(&conn).unwrap();
        assert_eq!(stored.len(), panehub_core::config::SETTING_KEYS.len());
        assert_eq!(stored["close_grace_ms"], "750");
    }

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["panehubd"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["panehubd", "serve", "--log-level", "debug"]).unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => assert_eq!(args.log_level, "debug"),
            _ => panic!("expected serve"),
        }

        let cli = Cli::try_parse_from(["panehubd", "call", r#"{"op":"list_sessions"}"#, "--follow"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Call { follow: true, .. })));
    }
}
