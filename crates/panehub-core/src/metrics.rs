//! Per-process resource sampling for live terminal panes.
//!
//! A background task calls [`MetricsSampler::sample_all`] at a fixed interval.
//! Each pane is probed independently, so a vanished or unreadable process
//! only affects its own history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use panehub_pty::PaneId;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("process {0} is not running")]
    ProcessGone(u32),
    #[error("metrics probe failed: {0}")]
    Probe(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub pane_id: PaneId,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f32,
    pub memory: Usage,
    pub disk: Usage,
    pub timestamp: DateTime<Utc>,
}

/// Source of process and host measurements.
pub trait ProcessProbe: Send + Sync {
    fn sample(&self, pid: u32) -> Result<ProcessUsage, MetricsError>;

    fn host(&self) -> HostMetrics;
}

/// [`ProcessProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn sample(&self, pid: u32) -> Result<ProcessUsage, MetricsError> {
        let sys_pid = Pid::from_u32(pid);
        let refresh = ProcessRefreshKind::nothing().with_cpu().with_memory();
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[sys_pid]), true, refresh);
        let process = system.process(sys_pid).ok_or(MetricsError::ProcessGone(pid))?;
        Ok(ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }

    fn host(&self) -> HostMetrics {
        let (cpu_percent, memory) = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                Usage {
                    total: system.total_memory(),
                    used: system.used_memory(),
                },
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let disk = disks.list().iter().fold(Usage::default(), |acc, disk| Usage {
            total: acc.total + disk.total_space(),
            used: acc.used + disk.total_space().saturating_sub(disk.available_space()),
        });

        HostMetrics {
            cpu_percent,
            memory,
            disk,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Tracked {
    pid: u32,
    active: bool,
    history: VecDeque<MetricsSample>,
}

pub struct MetricsSampler {
    probe: Arc<dyn ProcessProbe>,
    history_cap: usize,
    tracked: Mutex<HashMap<PaneId, Tracked>>,
}

impl MetricsSampler {
    pub fn new(probe: Arc<dyn ProcessProbe>, history_cap: usize) -> Self {
        Self {
            probe,
            history_cap: history_cap.max(1),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PaneId, Tracked>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track(&self, pane_id: PaneId, pid: u32) {
        self.lock().insert(
            pane_id,
            Tracked {
                pid,
                active: true,
                history: VecDeque::new(),
            },
        );
    }

    /// Forget a pane and drop its history.
    pub fn untrack(&self, pane_id: PaneId) {
        self.lock().remove(&pane_id);
    }

    /// Stop sampling a pane but keep its history readable.
    pub fn deactivate(&self, pane_id: PaneId) {
        if let Some(tracked) = self.lock().get_mut(&pane_id) {
            tracked.active = false;
        }
    }

    /// Probe every active pane once. Returns how many samples were taken.
    pub fn sample_all(&self) -> usize {
        let targets: Vec<(PaneId, u32)> = self
            .lock()
            .iter()
            .filter(|(_, t)| t.active)
            .map(|(id, t)| (*id, t.pid))
            .collect();

        let mut taken = 0;
        for (pane_id, pid) in targets {
            match self.probe.sample(pid) {
                Ok(usage) => {
                    let sample = MetricsSample {
                        pane_id,
                        pid,
                        cpu_percent: usage.cpu_percent,
                        memory_bytes: usage.memory_bytes,
                        timestamp: Utc::now(),
                    };
                    if let Some(tracked) = self.lock().get_mut(&pane_id) {
                        if tracked.history.len() >= self.history_cap {
                            tracked.history.pop_front();
                        }
                        tracked.history.push_back(sample);
                        taken += 1;
                    }
                }
                Err(MetricsError::ProcessGone(pid)) => {
                    log::debug!("[metrics] pane {pane_id}: pid {pid} gone, no longer sampling");
                    self.deactivate(pane_id);
                }
                Err(e) => log::warn!("[metrics] pane {pane_id}: {e}"),
            }
        }
        taken
    }

    /// Sample history for a pane, oldest first. Untracked panes have none.
    pub fn pane_metrics(&self, pane_id: PaneId) -> Vec<MetricsSample> {
        self.lock()
            .get(&pane_id)
            .map(|t| t.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, pane_id: PaneId) -> Option<MetricsSample> {
        self.lock().get(&pane_id).and_then(|t| t.history.back().cloned())
    }

    pub fn host_metrics(&self) -> HostMetrics {
        self.probe.host()
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    /// Run [`sample_all`](Self::sample_all) every `interval` until `stop` flips to `true`.
    pub fn start(self: &Arc<Self>, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let sampler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!("[metrics] sampling every {interval:?}");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = Arc::clone(&sampler);
                        // sysinfo refreshes block on procfs reads.
                        if let Err(e) = tokio::task::spawn_blocking(move || s.sample_all()).await {
                            log::warn!("[metrics] sampling task failed: {e}");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("[metrics] sampler stopped");
        })
    }
}
