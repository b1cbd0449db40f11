//! The session registry: the single service callers talk to.
//!
//! Sessions own panes. The registry keeps the session map private, checks
//! session membership around every pane operation, and cascades session
//! close over every child pane. Lifecycle changes are broadcast as
//! [`RegistryEvent`]s.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use panehub_pty::{PaneId, ScrollbackMatch, Subscription};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::OrchestratorConfig;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::events::RegistryEvent;
use crate::metrics::{HostMetrics, MetricsSample, MetricsSampler, ProcessProbe, SysinfoProbe};
use crate::pane::{PaneDescriptor, PaneManager, PaneOptions, PaneType, TerminalOptions};
use crate::status::{AgentStatus, AgentStatusTracker, StatusChange, StatusEntry, StatusKey};

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub panes: Vec<PaneId>,
    pub active_pane: Option<PaneId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFailure {
    pub pane_id: PaneId,
    pub code: ErrorCode,
    pub message: String,
}

/// Outcome of closing a session: every child is attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReport {
    pub session_id: SessionId,
    pub closed: Vec<PaneId>,
    pub failed: Vec<CloseFailure>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    name: String,
    created_at: DateTime<Utc>,
    panes: Vec<PaneId>,
    active_pane: Option<PaneId>,
}

impl Session {
    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            panes: self.panes.clone(),
            active_pane: self.active_pane,
        }
    }

    fn detach(&mut self, pane_id: PaneId) {
        self.panes.retain(|id| *id != pane_id);
        if self.active_pane == Some(pane_id) {
            self.active_pane = self.panes.last().copied();
        }
    }
}

pub struct SessionRegistry {
    config: OrchestratorConfig,
    sessions: Mutex<BTreeMap<SessionId, Session>>,
    panes: PaneManager,
    metrics: Arc<MetricsSampler>,
    status: Arc<AgentStatusTracker>,
    events: broadcast::Sender<RegistryEvent>,
    sampler_stop: watch::Sender<bool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(config: OrchestratorConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let metrics = Arc::new(MetricsSampler::new(probe, config.metrics_history));
        let status = Arc::new(AgentStatusTracker::new(config.status_expiry(), config.status_markers));
        let panes = PaneManager::new(config.clone(), Arc::clone(&metrics), Arc::clone(&status), events.clone());
        let (sampler_stop, _) = watch::channel(false);
        Self {
            config,
            sessions: Mutex::new(BTreeMap::new()),
            panes,
            metrics,
            status,
            events,
            sampler_stop,
            sampler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_session(&self, session_id: SessionId) -> Result<()> {
        if self.sessions().contains_key(&session_id) {
            Ok(())
        } else {
            Err(OrchestratorError::SessionNotFound(session_id))
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Start the background metrics sampler. Must be called inside a tokio runtime.
    pub fn start_metrics(&self) {
        let mut sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        if sampler.is_none() {
            let handle = self
                .metrics
                .start(self.config.metrics_interval(), self.sampler_stop.subscribe());
            *sampler = Some(handle);
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub fn create_session(&self, name: Option<String>) -> SessionDescriptor {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id,
            name: name.unwrap_or_else(|| format!("session-{id}")),
            created_at: Utc::now(),
            panes: Vec::new(),
            active_pane: None,
        };
        let descriptor = session.descriptor();
        self.sessions().insert(id, session);

        log::info!("[registry] session {id} created ({})", descriptor.name);
        self.emit(RegistryEvent::SessionCreated {
            session: descriptor.clone(),
        });
        descriptor
    }

    /// All sessions, ordered by id.
    pub fn list_sessions(&self) -> Vec<SessionDescriptor> {
        self.sessions().values().map(Session::descriptor).collect()
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionDescriptor> {
        self.sessions()
            .get(&session_id)
            .map(Session::descriptor)
            .ok_or(OrchestratorError::SessionNotFound(session_id))
    }

    pub fn rename_session(&self, session_id: SessionId, name: String) -> Result<SessionDescriptor> {
        let descriptor = {
            let mut sessions = self.sessions();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session.name = name.clone();
            session.descriptor()
        };
        self.emit(RegistryEvent::SessionRenamed { session_id, name });
        Ok(descriptor)
    }

    /// Remove a session and close every pane it owns.
    pub fn close_session(&self, session_id: SessionId) -> Result<CloseReport> {
        let session = self
            .sessions()
            .remove(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;

        let mut report = CloseReport {
            session_id,
            ..CloseReport::default()
        };
        for pane_id in session.panes {
            match self.panes.close(pane_id) {
                Ok(_) => report.closed.push(pane_id),
                Err(e) => {
                    log::warn!("[registry] session {session_id}: closing pane {pane_id} failed: {e}");
                    report.failed.push(CloseFailure {
                        pane_id,
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "[registry] session {session_id} closed ({} panes, {} failures)",
            report.closed.len(),
            report.failed.len()
        );
        self.emit(RegistryEvent::SessionClosed { session_id });
        Ok(report)
    }

    pub fn list_panes(&self, session_id: SessionId) -> Result<Vec<PaneDescriptor>> {
        let pane_ids = self
            .sessions()
            .get(&session_id)
            .map(|s| s.panes.clone())
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;
        Ok(self.panes.describe(&pane_ids))
    }

    // ─── Panes ──────────────────────────────────────────────────────────────

    /// Attach a freshly created pane, or close it again if its session
    /// disappeared while it was being created.
    fn attach(&self, descriptor: PaneDescriptor) -> Result<PaneDescriptor> {
        let session_id = descriptor.session_id;
        let attached = {
            let mut sessions = self.sessions();
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    session.panes.push(descriptor.id);
                    if session.active_pane.is_none() {
                        session.active_pane = Some(descriptor.id);
                    }
                    true
                }
                None => false,
            }
        };
        if !attached {
            let _ = self.panes.close(descriptor.id);
            return Err(OrchestratorError::SessionNotFound(session_id));
        }
        self.emit(RegistryEvent::PaneCreated {
            pane: descriptor.clone(),
        });
        Ok(descriptor)
    }

    /// Spawn a terminal pane in a session. The spawn happens outside every
    /// map lock; on failure nothing is recorded.
    pub fn create_terminal(&self, session_id: SessionId, options: TerminalOptions) -> Result<PaneDescriptor> {
        self.ensure_session(session_id)?;
        let descriptor = self.panes.create_terminal(session_id, options)?;
        self.attach(descriptor)
    }

    pub fn create_pane(&self, session_id: SessionId, pane_type: PaneType, options: PaneOptions) -> Result<PaneDescriptor> {
        self.ensure_session(session_id)?;
        let descriptor = self.panes.create_pane(session_id, pane_type, options)?;
        self.attach(descriptor)
    }

    pub fn get_pane(&self, pane_id: PaneId) -> Result<PaneDescriptor> {
        self.panes.get(pane_id)
    }

    /// Close one pane. Closing it again is a no-op.
    pub fn close_pane(&self, pane_id: PaneId) -> Result<()> {
        if let Some(session_id) = self.panes.close(pane_id)? {
            if let Some(session) = self.sessions().get_mut(&session_id) {
                session.detach(pane_id);
            }
        }
        Ok(())
    }

    /// Point the owning session's active pane at `pane_id`.
    pub fn focus_pane(&self, pane_id: PaneId) -> Result<()> {
        let session_id = self.panes.session_of(pane_id)?;
        self.panes.touch(pane_id)?;
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;
        session.active_pane = Some(pane_id);
        Ok(())
    }

    pub fn rename_pane(&self, pane_id: PaneId, title: String) -> Result<PaneDescriptor> {
        self.panes.rename(pane_id, title)
    }

    pub fn resize_pane(&self, pane_id: PaneId, rows: u16, cols: u16) -> Result<()> {
        self.panes.resize(pane_id, rows, cols)
    }

    // ─── Streaming ──────────────────────────────────────────────────────────

    pub async fn send_input(&self, pane_id: PaneId, data: Bytes) -> Result<()> {
        self.panes.send_input(pane_id, data).await
    }

    pub fn subscribe(&self, pane_id: PaneId) -> Result<Subscription> {
        self.panes.subscribe(pane_id)
    }

    pub fn pane_output(&self, pane_id: PaneId, max_lines: usize) -> Result<Vec<u8>> {
        self.panes.output(pane_id, max_lines)
    }

    pub fn search_output(&self, pane_id: PaneId, needle: &str) -> Result<Vec<ScrollbackMatch>> {
        self.panes.search(pane_id, needle)
    }

    // ─── Metrics ────────────────────────────────────────────────────────────

    pub fn pane_metrics(&self, pane_id: PaneId) -> Result<Vec<MetricsSample>> {
        if !self.panes.contains(pane_id) {
            return Err(OrchestratorError::PaneNotFound(pane_id));
        }
        Ok(self.metrics.pane_metrics(pane_id))
    }

    pub fn latest_metrics(&self, pane_id: PaneId) -> Result<Option<MetricsSample>> {
        if !self.panes.contains(pane_id) {
            return Err(OrchestratorError::PaneNotFound(pane_id));
        }
        Ok(self.metrics.latest(pane_id))
    }

    pub fn host_metrics(&self) -> HostMetrics {
        self.metrics.host_metrics()
    }

    // ─── Agent status ───────────────────────────────────────────────────────

    fn check_status_key(&self, key: &StatusKey) -> Result<()> {
        match key {
            StatusKey::Pane(pane_id) if !self.panes.contains(*pane_id) => {
                Err(OrchestratorError::PaneNotFound(*pane_id))
            }
            _ => Ok(()),
        }
    }

    pub fn agent_status(&self, key: &StatusKey) -> Result<AgentStatus> {
        self.check_status_key(key)?;
        Ok(self.status.get(key))
    }

    pub fn set_agent_status(&self, key: StatusKey, status: AgentStatus) -> Result<()> {
        self.check_status_key(&key)?;
        self.status.set(key, status);
        Ok(())
    }

    pub fn path_status(&self, path: impl Into<PathBuf>) -> AgentStatus {
        self.status.get(&StatusKey::Path(path.into()))
    }

    pub fn list_agent_statuses(&self) -> Vec<StatusEntry> {
        self.status.list()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    // ─── Shutdown ───────────────────────────────────────────────────────────

    /// Close every session and wait for their processes to go away.
    pub async fn shutdown(&self) -> Vec<CloseReport> {
        let _ = self.sampler_stop.send(true);
        let sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner()).take();

        let terminals = self.panes.running_terminals();
        let session_ids: Vec<SessionId> = self.sessions().keys().copied().collect();
        let reports: Vec<CloseReport> = session_ids
            .into_iter()
            .filter_map(|id| self.close_session(id).ok())
            .collect();

        let grace = self.config.close_grace();
        let mut teardown = JoinSet::new();
        for terminal in terminals {
            teardown.spawn(async move { terminal.terminate(grace).await });
        }
        while teardown.join_next().await.is_some() {}

        if let Some(sampler) = sampler {
            let _ = sampler.await;
        }
        log::info!("[registry] shutdown complete ({} sessions closed)", reports.len());
        reports
    }
}
