//! Unix domain socket server speaking JSON lines.
//!
//! Each accepted connection gets a reader loop and a writer task. Requests
//! on one connection are handled in order; responses and subscription
//! events share one bounded outbound channel drained by the writer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::commands::{dispatch, Context};
use crate::event_pump::Pumps;
use crate::ipc::{parse_request, Outbound, Response};
use crate::state::AppState;

/// Outbound lines buffered per connection before pumps stop pulling.
pub const OUTBOUND_QUEUE: usize = 256;

/// sun_path is 104 bytes on macOS and 108 on Linux.
const MAX_SOCKET_PATH: usize = 104;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default socket location: `$XDG_RUNTIME_DIR/panehub.sock`, else `/tmp/panehub-<uid>.sock`.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("panehub.sock"),
        _ => PathBuf::from(format!("/tmp/panehub-{}.sock", current_uid())),
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl Server {
    /// Bind the socket, replacing a stale socket file and restricting it to the owner.
    pub fn bind(socket_path: PathBuf) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            anyhow::bail!(
                "socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            );
        }

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("failed to remove stale socket: {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind socket: {}", socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        log::info!("[server] listening on {}", socket_path.display());

        Ok(Self { socket_path, listener })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` flips to `true`, then drop every
    /// connection and remove the socket file.
    pub async fn run(self, state: AppState, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                        log::info!("[server] client {id} connected");
                        connections.spawn(handle_connection(id, stream, state.clone()));
                    }
                    Err(e) => {
                        log::error!("[server] accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        connections.abort_all();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("[server] could not remove {}: {e}", self.socket_path.display());
        }
        log::info!("[server] stopped");
    }
}

async fn handle_connection(id: u64, stream: UnixStream, state: AppState) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(id, write_half, rx));

    let mut pumps = Pumps::new();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&state, &mut pumps, &line).await;
                if tx.send(Outbound::Response(response).to_line()).await.is_err() {
                    break;
                }
                pumps.launch(&tx);
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[server] client {id} read error: {e}");
                break;
            }
        }
    }

    log::info!("[server] client {id} disconnected, dropping {} subscription(s)", pumps.len());
    pumps.stop_all();
    drop(tx);
    let _ = writer.await;
}

/// Parse and run one request line.
pub async fn handle_line(state: &AppState, pumps: &mut Pumps, line: &str) -> Response {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err((id, error)) => {
            log::debug!("[server] rejected request: {error}");
            return Response::err(id, error);
        }
    };

    let mut ctx = Context { state, pumps };
    match dispatch(&mut ctx, &request).await {
        Ok(result) => Response::ok(request.id, result),
        Err(error) => {
            log::debug!("[server] {} failed: {error}", request.op);
            Response::err(request.id, error)
        }
    }
}

async fn write_loop(id: u64, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::warn!("[server] client {id} write error: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use panehub_core::{OrchestratorConfig, SessionRegistry};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn state() -> AppState {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        panehub_db::schema::initialize(&conn).unwrap();
        let config = OrchestratorConfig {
            close_grace_ms: 200,
            ..OrchestratorConfig::default()
        };
        AppState::new(SessionRegistry::new(config), conn)
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (read, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
            }
        }

        async fn send(&mut self, request: Value) {
            let mut line = request.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
                .await
                .expect("no message from server")
                .unwrap()
                .expect("server closed the connection");
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start() -> (tempfile::TempDir, PathBuf, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panehub.sock");
        let server = Server::bind(path.clone()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(state(), stop_rx));
        (dir, path, stop_tx, handle)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_get_tagged_responses() {
        let (_dir, path, stop, handle) = start().await;
        let mut client = Client::connect(&path).await;

        client.send(json!({"id": 1, "op": "create_session", "name": "demo"})).await;
        let response = client.next().await;
        assert_eq!(response["type"], "response");
        assert_eq!(response["id"], 1);
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"]["name"], "demo");

        client.send(json!({"id": 2, "op": "get_pane", "pane_id": 123_456})).await;
        let response = client.next().await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"]["code"], "not_found");

        client.writer.write_all(b"{broken\n").await.unwrap();
        let response = client.next().await;
        assert_eq!(response["error"]["code"], "invalid_request");

        stop.send(true).unwrap();
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_response_precedes_events() {
        let (_dir, path, stop, handle) = start().await;
        let mut client = Client::connect(&path).await;

        client.send(json!({"id": 1, "op": "create_session", "name": "demo"})).await;
        let session = client.next().await;
        client
            .send(json!({
                "id": 2,
                "op": "create_terminal",
                "session_id": session["result"]["id"],
                "shell": "/bin/sh",
                "args": ["-c", "echo ready; read line; echo \"got:$line\""],
                "rows": 24,
                "cols": 80
            }))
            .await;
        let pane = client.next().await;
        assert_eq!(pane["ok"], true, "{pane}");
        let pane_id = pane["result"]["id"].clone();

        client.send(json!({"id": 3, "op": "subscribe", "pane_id": pane_id})).await;
        let subscribed = client.next().await;
        assert_eq!(subscribed["type"], "response");
        assert_eq!(subscribed["id"], 3);
        let subscription = subscribed["result"]["subscription"].clone();

        client
            .send(json!({"id": 4, "op": "send_terminal_input", "pane_id": pane_id, "text": "hello\n"}))
            .await;

        let mut output = Vec::new();
        let mut input_acked = false;
        loop {
            let message = client.next().await;
            if message["type"] == "response" {
                assert_eq!(message["id"], 4);
                input_acked = true;
                continue;
            }
            assert_eq!(message["subscription"], subscription);
            match message["event"]["type"].as_str() {
                Some("output") => {
                    let data: Vec<u8> = serde_json::from_value(message["event"]["data"].clone()).unwrap();
                    output.extend_from_slice(&data);
                }
                Some("exit") => {
                    assert_eq!(message["event"]["exit_code"], 0);
                    break;
                }
                _ => {}
            }
        }
        assert!(input_acked);
        assert!(String::from_utf8_lossy(&output).contains("got:hello"));

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn default_socket_path_prefers_the_runtime_dir() {
        let path = default_socket_path();
        assert!(path.to_string_lossy().ends_with(".sock"));
    }
}
