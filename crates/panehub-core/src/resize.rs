//! Debounced terminal resizing.
//!
//! Window drags produce bursts of resize requests. Each pane gets a small
//! task that waits for the burst to go quiet, applies only the latest
//! geometry, and skips it entirely when it equals what is already applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use panehub_pty::{Geometry, PaneId, PtyError};
use tokio::sync::mpsc;

/// Something whose PTY can be resized.
pub trait ResizeTarget: Send + Sync + 'static {
    fn resize(&self, geometry: Geometry) -> Result<(), PtyError>;

    /// Called after `resize` succeeded.
    fn applied(&self, geometry: Geometry);

    /// Called after `resize` failed.
    fn failed(&self, geometry: Geometry, error: &PtyError);
}

struct Slot {
    tx: mpsc::UnboundedSender<Geometry>,
}

pub struct ResizeCoordinator {
    debounce: Duration,
    slots: Mutex<HashMap<PaneId, Slot>>,
}

impl ResizeCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a resize. `applied` is the geometry the PTY currently has; it
    /// seeds the pane's task the first time the pane is seen.
    ///
    /// Outside a tokio runtime the resize is applied immediately.
    pub fn request(&self, pane_id: PaneId, applied: Geometry, geometry: Geometry, target: Arc<dyn ResizeTarget>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            apply(pane_id, applied, geometry, target.as_ref());
            return;
        };

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(&pane_id) {
            if slot.tx.send(geometry).is_ok() {
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Fresh channel with a live receiver; cannot fail.
        let _ = tx.send(geometry);
        runtime.spawn(debounce_loop(pane_id, self.debounce, applied, rx, target));
        slots.insert(pane_id, Slot { tx });
    }

    /// Stop the pane's task. Pending requests are discarded.
    pub fn forget(&self, pane_id: PaneId) {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).remove(&pane_id);
    }

    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn debounce_loop(
    pane_id: PaneId,
    debounce: Duration,
    mut last_applied: Geometry,
    mut rx: mpsc::UnboundedReceiver<Geometry>,
    target: Arc<dyn ResizeTarget>,
) {
    while let Some(mut pending) = rx.recv().await {
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(next)) => pending = next,
                // Pane forgotten mid-burst.
                Ok(None) => return,
                Err(_) => break,
            }
        }
        if apply(pane_id, last_applied, pending, target.as_ref()) {
            last_applied = pending;
        }
    }
}

/// Returns `true` when the PTY now has `geometry`.
fn apply(pane_id: PaneId, last_applied: Geometry, geometry: Geometry, target: &dyn ResizeTarget) -> bool {
    if geometry == last_applied {
        log::debug!("[resize] pane {pane_id}: already {}x{}, skipping", geometry.rows, geometry.cols);
        return true;
    }
    match target.resize(geometry) {
        Ok(()) => {
            log::debug!("[resize] pane {pane_id}: applied {}x{}", geometry.rows, geometry.cols);
            target.applied(geometry);
            true
        }
        Err(e) => {
            log::warn!("[resize] pane {pane_id}: {}x{} failed: {e}", geometry.rows, geometry.cols);
            target.failed(geometry, &e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTarget {
        resized: Mutex<Vec<Geometry>>,
        applied: Mutex<Vec<Geometry>>,
        failed: Mutex<Vec<Geometry>>,
        fail: bool,
    }

    impl ResizeTarget for FakeTarget {
        fn resize(&self, geometry: Geometry) -> Result<(), PtyError> {
            self.resized.lock().unwrap().push(geometry);
            if self.fail {
                Err(PtyError::ResizeFailed("ioctl".into()))
            } else {
                Ok(())
            }
        }

        fn applied(&self, geometry: Geometry) {
            self.applied.lock().unwrap().push(geometry);
        }

        fn failed(&self, geometry: Geometry, _error: &PtyError) {
            self.failed.lock().unwrap().push(geometry);
        }
    }

    const INITIAL: Geometry = Geometry { rows: 24, cols: 80 };

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_to_latest() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget::default());
        for cols in 81..=90 {
            coordinator.request(1, INITIAL, Geometry::new(30, cols), target.clone());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        settle().await;
        assert_eq!(*target.applied.lock().unwrap(), vec![Geometry::new(30, 90)]);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_geometry_is_applied_once() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget::default());
        coordinator.request(1, INITIAL, Geometry::new(40, 120), target.clone());
        settle().await;
        coordinator.request(1, INITIAL, Geometry::new(40, 120), target.clone());
        settle().await;
        assert_eq!(*target.resized.lock().unwrap(), vec![Geometry::new(40, 120)]);
        assert_eq!(target.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_equal_to_current_size_is_skipped() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget::default());
        coordinator.request(1, INITIAL, INITIAL, target.clone());
        settle().await;
        assert!(target.resized.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_and_retried() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget {
            fail: true,
            ..FakeTarget::default()
        });
        coordinator.request(1, INITIAL, Geometry::new(40, 120), target.clone());
        settle().await;
        coordinator.request(1, INITIAL, Geometry::new(40, 120), target.clone());
        settle().await;
        assert_eq!(target.failed.lock().unwrap().len(), 2);
        assert!(target.applied.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forget_discards_pending_resize() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget::default());
        coordinator.request(1, INITIAL, Geometry::new(40, 120), target.clone());
        coordinator.forget(1);
        settle().await;
        assert!(target.resized.lock().unwrap().is_empty());
        assert_eq!(coordinator.active(), 0);
    }

    #[test]
    fn without_runtime_resize_is_immediate() {
        let coordinator = ResizeCoordinator::new(Duration::from_millis(100));
        let target = Arc::new(FakeTarget::default());
        coordinator.request(1, INITIAL, Geometry::new(10, 10), target.clone());
        assert_eq!(*target.applied.lock().unwrap(), vec![Geometry::new(10, 10)]);
    }
}
