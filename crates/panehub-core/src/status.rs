//! Best-effort agent execution status, keyed by pane or path.
//!
//! Status is decoration for the UI and is never used for control flow. It is
//! updated from markers recognised in terminal output, from explicit calls,
//! and from process exit. Last write wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use panehub_pty::PaneId;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// OSC 7770 status report, terminated by BEL or ST.
pub const OSC_STATUS_MARKER: &str = r"\x1b\]7770;status=([a-z]+)(?:\x07|\x1b\\)";
/// Plain-text status tag.
pub const TAG_STATUS_MARKER: &str = r"\[agent:([a-z]+)\]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Warning,
    Error,
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "running" => Ok(AgentStatus::Running),
            "warning" => Ok(AgentStatus::Warning),
            "error" => Ok(AgentStatus::Error),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKey {
    Pane(PaneId),
    Path(PathBuf),
}

/// How long a `running` status is trusted without a fresh update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusExpiry {
    #[default]
    Never,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub key: StatusKey,
    pub status: AgentStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub key: StatusKey,
    pub status: AgentStatus,
    pub previous: Option<AgentStatus>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: AgentStatus,
    updated_at: DateTime<Utc>,
    touched: Instant,
}

pub struct AgentStatusTracker {
    expiry: StatusExpiry,
    markers: Vec<Regex>,
    entries: Mutex<HashMap<StatusKey, Entry>>,
    changes: broadcast::Sender<StatusChange>,
}

impl std::fmt::Debug for AgentStatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStatusTracker")
            .field("expiry", &self.expiry)
            .field("markers", &self.markers.len())
            .finish()
    }
}

impl AgentStatusTracker {
    /// Tracker with the built-in markers, or none when `markers` is false.
    pub fn new(expiry: StatusExpiry, markers: bool) -> Self {
        let markers = if markers {
            [OSC_STATUS_MARKER, TAG_STATUS_MARKER]
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("[status] bad marker {pattern:?}: {e}");
                        None
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Self::with_regexes(expiry, markers)
    }

    /// Tracker with custom markers. Each pattern's first capture group must
    /// be the status word.
    pub fn with_markers(expiry: StatusExpiry, patterns: &[&str]) -> Result<Self, regex::Error> {
        let markers = patterns.iter().map(|p| Regex::new(p)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_regexes(expiry, markers))
    }

    fn with_regexes(expiry: StatusExpiry, markers: Vec<Regex>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            expiry,
            markers,
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Record a status. Returns `true` when the visible status changed.
    pub fn set(&self, key: StatusKey, status: AgentStatus) -> bool {
        let previous = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let previous = entries.get(&key).map(|entry| self.effective(entry));
            entries.insert(
                key.clone(),
                Entry {
                    status,
                    updated_at: Utc::now(),
                    touched: Instant::now(),
                },
            );
            previous
        };

        if previous == Some(status) {
            return false;
        }
        log::debug!("[status] {key:?}: {previous:?} -> {status:?}");
        // No receivers is fine.
        let _ = self.changes.send(StatusChange { key, status, previous });
        true
    }

    /// Current status; unknown keys are idle.
    pub fn get(&self, key: &StatusKey) -> AgentStatus {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map(|entry| self.effective(entry)).unwrap_or(AgentStatus::Idle)
    }

    pub fn list(&self) -> Vec<StatusEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<StatusEntry> = entries
            .iter()
            .map(|(key, entry)| StatusEntry {
                key: key.clone(),
                status: self.effective(entry),
                updated_at: entry.updated_at,
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub fn remove(&self, key: &StatusKey) -> Option<AgentStatus> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|entry| entry.status)
    }

    /// Look for status markers in a chunk of output. The last marker wins.
    pub fn scan_output(&self, pane_id: PaneId, data: &[u8]) -> Option<AgentStatus> {
        let status = self
            .markers
            .iter()
            .flat_map(|re| re.captures_iter(data))
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let word = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?;
                Some((whole.start(), word.parse::<AgentStatus>().ok()?))
            })
            .max_by_key(|(start, _)| *start)
            .map(|(_, status)| status)?;
        self.set(StatusKey::Pane(pane_id), status);
        Some(status)
    }

    /// A process that ended on its own: success is idle, anything else an error.
    pub fn record_exit(&self, pane_id: PaneId, exit_code: Option<i32>) {
        let status = if exit_code == Some(0) {
            AgentStatus::Idle
        } else {
            AgentStatus::Error
        };
        self.set(StatusKey::Pane(pane_id), status);
    }

    fn effective(&self, entry: &Entry) -> AgentStatus {
        match (entry.status, self.expiry) {
            (AgentStatus::Running, StatusExpiry::After(ttl)) if entry.touched.elapsed() >= ttl => AgentStatus::Idle,
            (status, _) => status,
        }
    }
}

impl Default for AgentStatusTracker {
    fn default() -> Self {
        Self::new(StatusExpiry::Never, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_idle() {
        let tracker = AgentStatusTracker::default();
        assert_eq!(tracker.get(&StatusKey::Pane(1)), AgentStatus::Idle);
    }

    #[test]
    fn last_write_wins() {
        let tracker = AgentStatusTracker::default();
        let key = StatusKey::Path(PathBuf::from("/work/repo"));
        assert!(tracker.set(key.clone(), AgentStatus::Running));
        assert!(tracker.set(key.clone(), AgentStatus::Warning));
        assert!(!tracker.set(key.clone(), AgentStatus::Warning));
        assert_eq!(tracker.get(&key), AgentStatus::Warning);
    }

    #[test]
    fn changes_are_broadcast() {
        let tracker = AgentStatusTracker::default();
        let mut rx = tracker.subscribe();
        tracker.set(StatusKey::Pane(4), AgentStatus::Running);
        tracker.set(StatusKey::Pane(4), AgentStatus::Running);
        tracker.set(StatusKey::Pane(4), AgentStatus::Idle);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status, AgentStatus::Running);
        assert_eq!(first.previous, None);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.previous, Some(AgentStatus::Running));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn osc_and_tag_markers_are_recognised() {
        let tracker = AgentStatusTracker::default();
        assert_eq!(
            tracker.scan_output(1, b"work\x1b]7770;status=running\x07more"),
            Some(AgentStatus::Running)
        );
        assert_eq!(tracker.scan_output(1, b"done [agent:warning] ok"), Some(AgentStatus::Warning));
        assert_eq!(tracker.get(&StatusKey::Pane(1)), AgentStatus::Warning);
        assert_eq!(tracker.scan_output(1, b"[agent:bogus] plain text"), None);
    }

    #[test]
    fn last_marker_in_a_chunk_wins() {
        let tracker = AgentStatusTracker::default();
        let data = b"[agent:running] ... \x1b]7770;status=error\x1b\\ ... [agent:idle]";
        assert_eq!(tracker.scan_output(2, data), Some(AgentStatus::Idle));
    }

    #[test]
    fn markers_can_be_disabled_or_replaced() {
        let tracker = AgentStatusTracker::new(StatusExpiry::Never, false);
        assert_eq!(tracker.scan_output(1, b"[agent:running]"), None);

        let custom = AgentStatusTracker::with_markers(StatusExpiry::Never, &[r"STATUS:(\w+)"]).unwrap();
        assert_eq!(custom.scan_output(1, b"STATUS:error"), Some(AgentStatus::Error));
        assert!(AgentStatusTracker::with_markers(StatusExpiry::Never, &["("]).is_err());
    }

    #[test]
    fn exit_sets_idle_or_error() {
        let tracker = AgentStatusTracker::default();
        tracker.record_exit(1, Some(0));
        tracker.record_exit(2, Some(1));
        tracker.record_exit(3, None);
        assert_eq!(tracker.get(&StatusKey::Pane(1)), AgentStatus::Idle);
        assert_eq!(tracker.get(&StatusKey::Pane(2)), AgentStatus::Error);
        assert_eq!(tracker.get(&StatusKey::Pane(3)), AgentStatus::Error);
    }

    #[test]
    fn list_is_sorted_and_remove_forgets() {
        let tracker = AgentStatusTracker::default();
        tracker.set(StatusKey::Pane(9), AgentStatus::Running);
        tracker.set(StatusKey::Pane(2), AgentStatus::Error);
        let keys: Vec<StatusKey> = tracker.list().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![StatusKey::Pane(2), StatusKey::Pane(9)]);

        assert_eq!(tracker.remove(&StatusKey::Pane(9)), Some(AgentStatus::Running));
        assert_eq!(tracker.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn running_expires_when_policy_says_so() {
        let tracker = AgentStatusTracker::new(StatusExpiry::After(Duration::from_secs(30)), true);
        tracker.set(StatusKey::Pane(1), AgentStatus::Running);
        tracker.set(StatusKey::Pane(2), AgentStatus::Error);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.get(&StatusKey::Pane(1)), AgentStatus::Idle);
        assert_eq!(tracker.get(&StatusKey::Pane(2)), AgentStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn running_never_expires_by_default() {
        let tracker = AgentStatusTracker::default();
        tracker.set(StatusKey::Pane(1), AgentStatus::Running);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(tracker.get(&StatusKey::Pane(1)), AgentStatus::Running);
    }
}
