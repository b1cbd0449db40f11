//! A running PTY process wired to its [`PaneStream`].
//!
//! Each terminal gets two dedicated OS threads because PTY reads and writes
//! are blocking. The reader thread owns the child: once output ends it reaps
//! the process, publishes the single exit event and flips the exit watch.
//! The writer thread drains a bounded FIFO of input so concurrent senders
//! never interleave inside one write.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::Child;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::buffer::ScrollbackLimits;
use crate::pty::{Geometry, ProcessInfo, ProcessSignaller, PtyError, PtyHandle, SpawnConfig};
use crate::stream::{PaneId, PaneStream, StreamError, Subscription, DEFAULT_SUBSCRIBER_QUEUE};

const READ_BUFFER_SIZE: usize = 65536;

/// How a terminal process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    /// The process ended because it was asked to terminate.
    pub killed: bool,
}

/// Hooks for components that need to see raw output without subscribing.
pub trait OutputObserver: Send + Sync {
    fn on_output(&self, pane_id: PaneId, data: &[u8]);

    fn on_exit(&self, _pane_id: PaneId, _exit: ProcessExit) {}
}

/// Buffering parameters for a terminal's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub scrollback: ScrollbackLimits,
    pub subscriber_queue: usize,
    /// Pending input writes before `send_input` waits.
    pub input_queue: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            scrollback: ScrollbackLimits::default(),
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            input_queue: 256,
        }
    }
}

pub struct TerminalProcess {
    pane_id: PaneId,
    info: ProcessInfo,
    pty: Mutex<PtyHandle>,
    signaller: Mutex<ProcessSignaller>,
    stream: Arc<PaneStream>,
    input_tx: mpsc::Sender<Bytes>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    terminating: Arc<AtomicBool>,
}

impl std::fmt::Debug for TerminalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalProcess")
            .field("pane_id", &self.pane_id)
            .field("info", &self.info)
            .field("exit", &self.exit_status())
            .finish()
    }
}

impl TerminalProcess {
    /// Spawn the process and start its I/O threads.
    ///
    /// On error nothing is left running.
    pub fn spawn(
        pane_id: PaneId,
        config: &SpawnConfig,
        stream_config: &StreamConfig,
        observer: Option<Arc<dyn OutputObserver>>,
    ) -> Result<Self, PtyError> {
        let mut pty = PtyHandle::spawn(config)?;
        let info = pty.info().clone();

        let mut signaller = pty
            .signaller()
            .ok_or_else(|| PtyError::SpawnFailed("child handle unavailable".to_string()))?;
        let (reader, writer, child) = match (pty.take_reader(), pty.take_writer(), pty.take_child()) {
            (Some(r), Some(w), Some(c)) => (r, w, c),
            _ => {
                signaller.kill();
                return Err(PtyError::SpawnFailed("PTY handles unavailable".to_string()));
            }
        };

        let stream = PaneStream::new(pane_id, stream_config.scrollback, stream_config.subscriber_queue);
        let (input_tx, input_rx) = mpsc::channel(stream_config.input_queue.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminating = Arc::new(AtomicBool::new(false));

        if let Err(e) = start_writer_thread(pane_id, writer, input_rx) {
            signaller.kill();
            return Err(PtyError::Io(e));
        }

        let reader_ctx = ReaderContext {
            pane_id,
            stream: Arc::clone(&stream),
            observer,
            terminating: Arc::clone(&terminating),
            exit_tx,
        };
        if let Err(e) = start_reader_thread(reader_ctx, reader, child) {
            signaller.kill();
            return Err(PtyError::Io(e));
        }

        log::info!(
            "[pty] pane {pane_id}: started {} (pid {:?})",
            info.shell,
            info.pid
        );

        Ok(Self {
            pane_id,
            info,
            pty: Mutex::new(pty),
            signaller: Mutex::new(signaller),
            stream,
            input_tx,
            exit_rx,
            terminating,
        })
    }

    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn pid(&self) -> Option<u32> {
        self.info.pid
    }

    pub fn stream(&self) -> &Arc<PaneStream> {
        &self.stream
    }

    pub fn subscribe(&self) -> Subscription {
        self.stream.subscribe()
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Queue bytes for the writer thread.
    pub async fn send_input(&self, data: Bytes) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::ProcessExited);
        }
        self.input_tx
            .send(data)
            .await
            .map_err(|_| PtyError::ProcessExited)
    }

    pub fn resize(&self, geometry: Geometry) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::ProcessExited);
        }
        self.pty.lock().unwrap_or_else(|e| e.into_inner()).resize(geometry)
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            // The reader thread is gone without reporting.
            Err(_) => None,
        };
        exit.unwrap_or(ProcessExit {
            exit_code: None,
            killed: true,
        })
    }

    /// Hang up, wait up to `grace`, then force-kill.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.exit_status() {
            return exit;
        }
        self.terminating.store(true, Ordering::SeqCst);
        self.signaller.lock().unwrap_or_else(|e| e.into_inner()).hang_up();

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                log::warn!(
                    "[pty] pane {}: Timeout after {:?} waiting for exit, force-killing pid {:?}",
                    self.pane_id,
                    grace,
                    self.info.pid
                );
                self.signaller.lock().unwrap_or_else(|e| e.into_inner()).kill();
                self.wait().await
            }
        }
    }
}

impl Drop for TerminalProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.terminating.store(true, Ordering::SeqCst);
            self.signaller.lock().unwrap_or_else(|e| e.into_inner()).kill();
        }
    }
}

// ─── I/O threads ────────────────────────────────────────────────────────────

struct ReaderContext {
    pane_id: PaneId,
    stream: Arc<PaneStream>,
    observer: Option<Arc<dyn OutputObserver>>,
    terminating: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
}

fn start_reader_thread(
    ctx: ReaderContext,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-read-{}", ctx.pane_id))
        .spawn(move || read_loop(ctx, reader, child))
        .map(|_| ())
}

fn read_loop(ctx: ReaderContext, mut reader: Box<dyn Read + Send>, mut child: Box<dyn Child + Send + Sync>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if let Some(observer) = &ctx.observer {
                    observer.on_output(ctx.pane_id, &data);
                }
                ctx.stream.publish_output(data);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side is gone.
                if !is_hangup(&e) && !ctx.terminating.load(Ordering::SeqCst) {
                    log::warn!("[pty] pane {}: read failed: {e}", ctx.pane_id);
                    ctx.stream.publish_error(StreamError::ReadFailed {
                        message: e.to_string(),
                    });
                }
                break;
            }
        }
    }

    let exit_code = match child.wait() {
        Ok(status) if status.signal().is_some() => None,
        Ok(status) => Some(status.exit_code() as i32),
        Err(e) => {
            log::warn!("[pty] pane {}: wait failed: {e}", ctx.pane_id);
            None
        }
    };
    let exit = ProcessExit {
        exit_code,
        killed: ctx.terminating.load(Ordering::SeqCst),
    };

    log::info!(
        "[pty] pane {}: process exited (code {:?}, killed {})",
        ctx.pane_id,
        exit.exit_code,
        exit.killed
    );
    // Record the exit and notify the observer before subscribers see it, so
    // a subscriber reacting to the exit event finds the final pane state.
    let _ = ctx.exit_tx.send(Some(exit));
    if let Some(observer) = &ctx.observer {
        observer.on_exit(ctx.pane_id, exit);
    }
    ctx.stream.finish(exit.exit_code, exit.killed);
}

#[cfg(unix)]
fn is_hangup(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(_e: &std::io::Error) -> bool {
    false
}

fn start_writer_thread(
    pane_id: PaneId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Bytes>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-write-{pane_id}"))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    log::debug!("[pty] pane {pane_id}: write failed: {e}");
                    break;
                }
            }
        })
        .map(|_| ())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
