//! Pane records and the manager that owns them.
//!
//! Every pane sits behind its own lock so operations on different panes never
//! contend; the map lock is only held to look up, insert or remove. Terminal
//! panes own one [`TerminalProcess`]. Closing a pane removes the record at
//! once and leaves process teardown to a background task.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use panehub_pty::{
    Geometry, OutputObserver, PaneId, ProcessExit, PtyError, ScrollbackMatch, SpawnConfig, StreamError, Subscription,
    TerminalProcess,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::RegistryEvent;
use crate::metrics::MetricsSampler;
use crate::registry::SessionId;
use crate::resize::{ResizeCoordinator, ResizeTarget};
use crate::status::{AgentStatusTracker, StatusKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaneType {
    Terminal,
    Editor,
    FileTree,
    Dashboard,
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PaneState {
    /// Terminal with a live process.
    Running,
    /// Non-terminal pane.
    Open,
    /// The process ended on its own.
    Exited { exit_code: Option<i32> },
    /// The process ended because the pane was closed.
    Killed { exit_code: Option<i32> },
}

/// The caller-visible part of a terminal's [`ProcessInfo`](panehub_pty::ProcessInfo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub pid: Option<u32>,
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub spawned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaneDescriptor {
    pub id: PaneId,
    pub session_id: SessionId,
    pub pane_type: PaneType,
    pub title: String,
    pub working_dir: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    #[serde(flatten)]
    pub state: PaneState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub process: Option<ProcessSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalOptions {
    /// `None` uses the configured default shell.
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub rows: u16,
    pub cols: u16,
    pub title: Option<String>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        let geometry = Geometry::default();
        Self {
            shell: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            rows: geometry.rows,
            cols: geometry.cols,
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaneOptions {
    pub title: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub metadata: BTreeMap<String, String>,
}

impl Default for PaneOptions {
    fn default() -> Self {
        let geometry = Geometry::default();
        Self {
            title: None,
            working_dir: None,
            rows: geometry.rows,
            cols: geometry.cols,
            metadata: BTreeMap::new(),
        }
    }
}

pub(crate) struct Pane {
    id: PaneId,
    session_id: SessionId,
    pane_type: PaneType,
    title: String,
    working_dir: Option<PathBuf>,
    geometry: Geometry,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    terminal: Option<Arc<TerminalProcess>>,
}

impl Pane {
    fn state(&self) -> PaneState {
        let Some(terminal) = &self.terminal else {
            return PaneState::Open;
        };
        match terminal.exit_status() {
            None => PaneState::Running,
            Some(exit) if exit.killed => PaneState::Killed {
                exit_code: exit.exit_code,
            },
            Some(exit) => PaneState::Exited {
                exit_code: exit.exit_code,
            },
        }
    }

    fn descriptor(&self) -> PaneDescriptor {
        let output_at = self
            .terminal
            .as_ref()
            .and_then(|t| t.stream().last_output_at());
        let last_activity = match output_at {
            Some(at) if at > self.last_activity => at,
            _ => self.last_activity,
        };
        PaneDescriptor {
            id: self.id,
            session_id: self.session_id,
            pane_type: self.pane_type.clone(),
            title: self.title.clone(),
            working_dir: self.working_dir.clone(),
            rows: self.geometry.rows,
            cols: self.geometry.cols,
            state: self.state(),
            created_at: self.created_at,
            last_activity,
            metadata: self.metadata.clone(),
            process: self.terminal.as_ref().map(|t| {
                let info = t.info();
                ProcessSummary {
                    pid: info.pid,
                    shell: info.shell.clone(),
                    args: info.args.clone(),
                    cwd: info.cwd.clone(),
                    spawned_at: info.spawned_at,
                }
            }),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

fn lock_pane(pane: &Mutex<Pane>) -> MutexGuard<'_, Pane> {
    pane.lock().unwrap_or_else(|e| e.into_inner())
}

/// Feeds terminal output and exits into status, metrics and lifecycle events.
struct PaneObserver {
    status: Arc<AgentStatusTracker>,
    metrics: Arc<MetricsSampler>,
    events: broadcast::Sender<RegistryEvent>,
}

impl OutputObserver for PaneObserver {
    fn on_output(&self, pane_id: PaneId, data: &[u8]) {
        self.status.scan_output(pane_id, data);
    }

    fn on_exit(&self, pane_id: PaneId, exit: ProcessExit) {
        self.metrics.deactivate(pane_id);
        if !exit.killed {
            self.status.record_exit(pane_id, exit.exit_code);
        }
        let _ = self.events.send(RegistryEvent::PaneExited {
            pane_id,
            exit_code: exit.exit_code,
            killed: exit.killed,
        });
    }
}

/// Applies debounced resizes to a terminal and its record.
struct TerminalResize {
    pane: Weak<Mutex<Pane>>,
    terminal: Arc<TerminalProcess>,
}

impl ResizeTarget for TerminalResize {
    fn resize(&self, geometry: Geometry) -> std::result::Result<(), PtyError> {
        self.terminal.resize(geometry)
    }

    fn applied(&self, geometry: Geometry) {
        if let Some(pane) = self.pane.upgrade() {
            lock_pane(&pane).geometry = geometry;
        }
        self.terminal.stream().publish_state(geometry);
    }

    fn failed(&self, geometry: Geometry, error: &PtyError) {
        self.terminal.stream().publish_error(StreamError::ResizeFailed {
            rows: geometry.rows,
            cols: geometry.cols,
            message: error.to_string(),
        });
    }
}

pub struct PaneManager {
    config: OrchestratorConfig,
    panes: Mutex<HashMap<PaneId, Arc<Mutex<Pane>>>>,
    /// Ids below this have been issued. One that is not live was closed.
    next_id: AtomicU64,
    /// Ids reserved by a failed create that could not be handed back.
    abandoned: Mutex<HashSet<PaneId>>,
    resize: ResizeCoordinator,
    metrics: Arc<MetricsSampler>,
    status: Arc<AgentStatusTracker>,
    events: broadcast::Sender<RegistryEvent>,
}

impl PaneManager {
    pub fn new(
        config: OrchestratorConfig,
        metrics: Arc<MetricsSampler>,
        status: Arc<AgentStatusTracker>,
        events: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            resize: ResizeCoordinator::new(config.resize_debounce()),
            config,
            panes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            abandoned: Mutex::new(HashSet::new()),
            metrics,
            status,
            events,
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<PaneId, Arc<Mutex<Pane>>>> {
        self.panes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve_id(&self) -> PaneId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Give back an id whose pane was never created.
    fn release_id(&self, pane_id: PaneId) {
        let handed_back = self
            .next_id
            .compare_exchange(pane_id + 1, pane_id, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if !handed_back {
            self.abandoned.lock().unwrap_or_else(|e| e.into_inner()).insert(pane_id);
        }
    }

    fn was_issued(&self, pane_id: PaneId) -> bool {
        pane_id > 0
            && pane_id < self.next_id.load(Ordering::Relaxed)
            && !self.abandoned.lock().unwrap_or_else(|e| e.into_inner()).contains(&pane_id)
    }

    fn lookup(&self, pane_id: PaneId) -> Result<Arc<Mutex<Pane>>> {
        self.map()
            .get(&pane_id)
            .cloned()
            .ok_or(OrchestratorError::PaneNotFound(pane_id))
    }

    fn terminal(&self, pane_id: PaneId) -> Result<Arc<TerminalProcess>> {
        let pane = self.lookup(pane_id)?;
        let terminal = lock_pane(&pane).terminal.clone();
        terminal.ok_or_else(|| OrchestratorError::Unsupported(format!("pane {pane_id} is not a terminal")))
    }

    /// Spawn a terminal pane. Nothing is recorded unless the spawn succeeds.
    pub fn create_terminal(&self, session_id: SessionId, options: TerminalOptions) -> Result<PaneDescriptor> {
        let geometry = validate_geometry(options.rows, options.cols)?;
        let pane_id = self.reserve_id();

        let spawn = SpawnConfig {
            shell: options.shell.or_else(|| self.config.default_shell.clone()),
            args: options.args,
            cwd: options.cwd,
            env: options.env,
            geometry,
        };
        let observer: Arc<dyn OutputObserver> = Arc::new(PaneObserver {
            status: Arc::clone(&self.status),
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
        });
        let terminal = match TerminalProcess::spawn(pane_id, &spawn, &self.config.stream_config(), Some(observer)) {
            Ok(terminal) => Arc::new(terminal),
            Err(e) => {
                self.release_id(pane_id);
                return Err(OrchestratorError::from_pty(pane_id, e));
            }
        };

        if let Some(pid) = terminal.pid() {
            self.metrics.track(pane_id, pid);
        }

        let now = Utc::now();
        let info = terminal.info();
        let pane = Pane {
            id: pane_id,
            session_id,
            pane_type: PaneType::Terminal,
            title: options.title.unwrap_or_else(|| program_name(&info.shell)),
            working_dir: Some(info.cwd.clone()),
            geometry,
            created_at: now,
            last_activity: now,
            metadata: BTreeMap::new(),
            terminal: Some(Arc::clone(&terminal)),
        };
        let descriptor = pane.descriptor();
        self.map().insert(pane_id, Arc::new(Mutex::new(pane)));

        log::info!("[pane] terminal pane {pane_id} created in session {session_id}");
        Ok(descriptor)
    }

    /// Create a pane with no process behind it.
    pub fn create_pane(&self, session_id: SessionId, pane_type: PaneType, options: PaneOptions) -> Result<PaneDescriptor> {
        if pane_type == PaneType::Terminal {
            return Err(OrchestratorError::Unsupported(
                "terminal panes are created with create_terminal".to_string(),
            ));
        }
        let geometry = validate_geometry(options.rows, options.cols)?;
        let pane_id = self.reserve_id();

        let now = Utc::now();
        let pane = Pane {
            id: pane_id,
            session_id,
            title: options.title.unwrap_or_else(|| default_title(&pane_type)),
            pane_type,
            working_dir: options.working_dir,
            geometry,
            created_at: now,
            last_activity: now,
            metadata: options.metadata,
            terminal: None,
        };
        let descriptor = pane.descriptor();
        self.map().insert(pane_id, Arc::new(Mutex::new(pane)));

        log::info!("[pane] {:?} pane {pane_id} created in session {session_id}", descriptor.pane_type);
        Ok(descriptor)
    }

    pub fn get(&self, pane_id: PaneId) -> Result<PaneDescriptor> {
        let pane = self.lookup(pane_id)?;
        let descriptor = lock_pane(&pane).descriptor();
        Ok(descriptor)
    }

    /// Descriptors for the given ids, skipping any that are gone.
    pub fn describe(&self, pane_ids: &[PaneId]) -> Vec<PaneDescriptor> {
        pane_ids.iter().filter_map(|id| self.get(*id).ok()).collect()
    }

    pub fn session_of(&self, pane_id: PaneId) -> Result<SessionId> {
        let pane = self.lookup(pane_id)?;
        let session_id = lock_pane(&pane).session_id;
        Ok(session_id)
    }

    pub fn contains(&self, pane_id: PaneId) -> bool {
        self.map().contains_key(&pane_id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close a pane. Closing an already closed pane is a no-op that returns
    /// `None`; an id that never existed is `PaneNotFound`.
    ///
    /// The record and scrollback are released before this returns; a live
    /// process is hung up, given the grace period, then killed in the
    /// background.
    pub fn close(&self, pane_id: PaneId) -> Result<Option<SessionId>> {
        let removed = self.map().remove(&pane_id);
        let Some(pane) = removed else {
            return if self.was_issued(pane_id) {
                Ok(None)
            } else {
                Err(OrchestratorError::PaneNotFound(pane_id))
            };
        };

        let (session_id, terminal) = {
            let pane = lock_pane(&pane);
            (pane.session_id, pane.terminal.clone())
        };

        self.resize.forget(pane_id);
        self.metrics.untrack(pane_id);
        self.status.remove(&StatusKey::Pane(pane_id));

        if let Some(terminal) = terminal {
            terminal.stream().release_scrollback();
            self.teardown(terminal);
        }

        let _ = self.events.send(RegistryEvent::PaneClosed { pane_id, session_id });
        log::info!("[pane] pane {pane_id} closed");
        Ok(Some(session_id))
    }

    fn teardown(&self, terminal: Arc<TerminalProcess>) {
        if !terminal.is_running() {
            return;
        }
        let grace = self.config.close_grace();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let exit = terminal.terminate(grace).await;
                    log::debug!("[pane] pane {} torn down: {exit:?}", terminal.pane_id());
                });
            }
            Err(_) => {
                log::debug!(
                    "[pane] pane {}: no runtime for graceful close, killing",
                    terminal.pane_id()
                );
                // Dropping the last handle kills a running process.
                drop(terminal);
            }
        }
    }

    /// Terminals still running, for shutdown.
    pub(crate) fn running_terminals(&self) -> Vec<Arc<TerminalProcess>> {
        let panes: Vec<Arc<Mutex<Pane>>> = self.map().values().cloned().collect();
        panes
            .iter()
            .filter_map(|pane| lock_pane(pane).terminal.clone())
            .filter(|t| t.is_running())
            .collect()
    }

    pub fn rename(&self, pane_id: PaneId, title: String) -> Result<PaneDescriptor> {
        let pane = self.lookup(pane_id)?;
        let mut pane = lock_pane(&pane);
        pane.title = title;
        pane.touch();
        Ok(pane.descriptor())
    }

    pub fn touch(&self, pane_id: PaneId) -> Result<()> {
        let pane = self.lookup(pane_id)?;
        lock_pane(&pane).touch();
        Ok(())
    }

    /// Validate synchronously, then hand terminals to the debounced
    /// coordinator. Other panes take the geometry immediately.
    pub fn resize(&self, pane_id: PaneId, rows: u16, cols: u16) -> Result<()> {
        let geometry = validate_geometry(rows, cols)?;
        let pane = self.lookup(pane_id)?;

        let mut guard = lock_pane(&pane);
        guard.touch();
        let terminal = match guard.terminal.clone() {
            Some(terminal) if terminal.is_running() => terminal,
            _ => {
                guard.geometry = geometry;
                return Ok(());
            }
        };
        let applied = guard.geometry;
        drop(guard);

        let target = Arc::new(TerminalResize {
            pane: Arc::downgrade(&pane),
            terminal,
        });
        self.resize.request(pane_id, applied, geometry, target);
        Ok(())
    }

    pub async fn send_input(&self, pane_id: PaneId, data: Bytes) -> Result<()> {
        let terminal = self.terminal(pane_id)?;
        self.touch(pane_id)?;
        terminal
            .send_input(data)
            .await
            .map_err(|e| OrchestratorError::from_pty(pane_id, e))
    }

    pub fn subscribe(&self, pane_id: PaneId) -> Result<Subscription> {
        Ok(self.terminal(pane_id)?.subscribe())
    }

    /// The last `max_lines` lines of a terminal's scrollback.
    pub fn output(&self, pane_id: PaneId, max_lines: usize) -> Result<Vec<u8>> {
        Ok(self.terminal(pane_id)?.stream().tail_lines(max_lines))
    }

    pub fn search(&self, pane_id: PaneId, needle: &str) -> Result<Vec<ScrollbackMatch>> {
        Ok(self.terminal(pane_id)?.stream().search(needle))
    }
}

fn validate_geometry(rows: u16, cols: u16) -> Result<Geometry> {
    Geometry::new(rows, cols).validate().map_err(|e| match e {
        PtyError::InvalidGeometry { rows, cols } => OrchestratorError::InvalidGeometry { rows, cols },
        other => OrchestratorError::Pty(other),
    })
}

fn program_name(shell: &str) -> String {
    Path::new(shell)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| shell.to_string())
}

fn default_title(pane_type: &PaneType) -> String {
    match pane_type {
        PaneType::Terminal => "terminal".to_string(),
        PaneType::Editor => "editor".to_string(),
        PaneType::FileTree => "files".to_string(),
        PaneType::Dashboard => "dashboard".to_string(),
        PaneType::Custom(kind) => kind.clone(),
    }
}
