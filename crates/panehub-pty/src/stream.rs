//! Per-pane event fan-out.
//!
//! A [`PaneStream`] is the single point where a pane's output, geometry
//! changes, errors and exit are sequenced. Every subscriber owns a bounded
//! [`SubscriberQueue`]; the PTY reader pushes into each queue without ever
//! waiting on a consumer. A slow consumer loses its oldest events and is
//! told so with a `truncated` error before its next event.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::buffer::{ScrollbackBuffer, ScrollbackLimits, ScrollbackMatch};
use crate::pty::Geometry;

/// Process-wide pane identifier.
pub type PaneId = u64;

/// Default number of events a subscriber may have pending.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// One ordered unit of PTY output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub pane_id: PaneId,
    /// Strictly increasing per pane, starting at 1.
    pub seq: u64,
    pub data: Bytes,
}

/// Non-fatal and fatal stream conditions delivered in-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamError {
    #[error("{dropped_chunks} events were dropped before delivery")]
    Truncated { dropped_chunks: u64 },
    #[error("read failed: {message}")]
    ReadFailed { message: String },
    #[error("resize to {rows}x{cols} failed: {message}")]
    ResizeFailed { rows: u16, cols: u16, message: String },
}

/// Everything a subscriber can observe on a pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaneEvent {
    Output(OutputChunk),
    /// Always the last event of a stream.
    Exit {
        pane_id: PaneId,
        seq: u64,
        exit_code: Option<i32>,
        killed: bool,
    },
    Error {
        pane_id: PaneId,
        error: StreamError,
    },
    /// A resize that was applied to the PTY.
    State { pane_id: PaneId, rows: u16, cols: u16 },
}

impl PaneEvent {
    pub fn pane_id(&self) -> PaneId {
        match self {
            PaneEvent::Output(chunk) => chunk.pane_id,
            PaneEvent::Exit { pane_id, .. }
            | PaneEvent::Error { pane_id, .. }
            | PaneEvent::State { pane_id, .. } => *pane_id,
        }
    }

    /// Sequence number for events that carry one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            PaneEvent::Output(chunk) => Some(chunk.seq),
            PaneEvent::Exit { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, PaneEvent::Exit { .. })
    }
}

// ─── Subscriber queue ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<PaneEvent>,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer queue. Overflow drops the oldest event.
#[derive(Debug)]
pub struct SubscriberQueue {
    pane_id: PaneId,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(pane_id: PaneId, capacity: usize) -> Self {
        Self {
            pane_id,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Live push; never blocks on the consumer.
    fn push(&self, event: PaneEvent) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Snapshot pushes ignore the capacity so a new subscriber always
    /// receives the whole retained history.
    fn push_unbounded(&self, event: PaneEvent) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Deliver a final event and close the queue.
    fn finish(&self, event: PaneEvent) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.events.push_back(event);
            state.closed = true;
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Poll {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.dropped > 0 {
            let dropped_chunks = std::mem::take(&mut state.dropped);
            return Poll::Ready(PaneEvent::Error {
                pane_id: self.pane_id,
                error: StreamError::Truncated { dropped_chunks },
            });
        }
        match state.events.pop_front() {
            Some(event) => Poll::Ready(event),
            None if state.closed => Poll::Closed,
            None => Poll::Empty,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Poll {
    Ready(PaneEvent),
    Empty,
    Closed,
}

// ─── Subscription ───────────────────────────────────────────────────────────

/// A caller's handle on one pane's event stream.
///
/// Dropping it unsubscribes. The process is never affected.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pane_id: PaneId,
    queue: Arc<SubscriberQueue>,
    stream: Weak<PaneStream>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    /// Wait for the next event. Returns `None` once the stream is complete.
    pub async fn recv(&mut self) -> Option<PaneEvent> {
        loop {
            match self.queue.pop() {
                Poll::Ready(event) => return Some(event),
                Poll::Closed => return None,
                Poll::Empty => self.queue.notify.notified().await,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<PaneEvent> {
        match self.queue.pop() {
            Poll::Ready(event) => Some(event),
            Poll::Empty | Poll::Closed => None,
        }
    }

    /// Events waiting to be received.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.upgrade() {
            stream.unsubscribe(self.id);
        }
    }
}

// ─── Pane stream ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StreamInner {
    next_seq: u64,
    scrollback: ScrollbackBuffer,
    subscribers: BTreeMap<u64, Arc<SubscriberQueue>>,
    exit: Option<PaneEvent>,
    last_output_at: Option<DateTime<Utc>>,
    released: bool,
}

/// Sequencer, scrollback and subscriber set for one pane.
#[derive(Debug)]
pub struct PaneStream {
    pane_id: PaneId,
    queue_capacity: usize,
    inner: Mutex<StreamInner>,
}

impl PaneStream {
    pub fn new(pane_id: PaneId, limits: ScrollbackLimits, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pane_id,
            queue_capacity,
            inner: Mutex::new(StreamInner {
                next_seq: 1,
                scrollback: ScrollbackBuffer::new(limits),
                subscribers: BTreeMap::new(),
                exit: None,
                last_output_at: None,
                released: false,
            }),
        })
    }

    pub fn pane_id(&self) -> PaneId {
        self.pane_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequence, retain and fan out a chunk of output. Returns the assigned
    /// sequence number, or `None` when the stream has already finished.
    pub fn publish_output(&self, data: Bytes) -> Option<u64> {
        if data.is_empty() {
            return None;
        }
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return None;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let chunk = OutputChunk {
            pane_id: self.pane_id,
            seq,
            data,
        };
        if !inner.released {
            inner.scrollback.push(chunk.clone());
        }
        inner.last_output_at = Some(Utc::now());
        for queue in inner.subscribers.values() {
            queue.push(PaneEvent::Output(chunk.clone()));
        }
        Some(seq)
    }

    /// Broadcast an applied resize.
    pub fn publish_state(&self, geometry: Geometry) {
        self.broadcast(PaneEvent::State {
            pane_id: self.pane_id,
            rows: geometry.rows,
            cols: geometry.cols,
        });
    }

    pub fn publish_error(&self, error: StreamError) {
        self.broadcast(PaneEvent::Error {
            pane_id: self.pane_id,
            error,
        });
    }

    fn broadcast(&self, event: PaneEvent) {
        let inner = self.lock();
        if inner.exit.is_some() {
            return;
        }
        for queue in inner.subscribers.values() {
            queue.push(event.clone());
        }
    }

    /// Deliver the exit event to every subscriber and complete the stream.
    /// Only the first call has any effect.
    pub fn finish(&self, exit_code: Option<i32>, killed: bool) -> bool {
        let mut inner = self.lock();
        if inner.exit.is_some() {
            return false;
        }
        let event = PaneEvent::Exit {
            pane_id: self.pane_id,
            seq: inner.next_seq,
            exit_code,
            killed,
        };
        inner.next_seq += 1;
        for (_, queue) in std::mem::take(&mut inner.subscribers) {
            queue.finish(event.clone());
        }
        inner.exit = Some(event);
        true
    }

    /// Register a subscriber, seeding its queue with the retained scrollback
    /// under the same lock the reader publishes under, so snapshot and live
    /// chunks form one gap-free sequence.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.pane_id, self.queue_capacity));

        let mut inner = self.lock();
        let truncation = inner.scrollback.truncation();
        if truncation.is_truncated() {
            queue.push_unbounded(PaneEvent::Error {
                pane_id: self.pane_id,
                error: StreamError::Truncated {
                    dropped_chunks: truncation.evicted_chunks,
                },
            });
        }
        for chunk in inner.scrollback.chunks() {
            queue.push_unbounded(PaneEvent::Output(chunk.clone()));
        }
        if let Some(exit) = inner.exit.clone() {
            queue.finish(exit);
        } else {
            inner.subscribers.insert(id, Arc::clone(&queue));
        }
        drop(inner);

        log::debug!("[stream] pane {} subscriber {id} attached", self.pane_id);
        Subscription {
            id,
            pane_id: self.pane_id,
            queue,
            stream: Arc::downgrade(self),
        }
    }

    /// Stop delivery to a subscriber. Returns `false` if it was not attached.
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        let removed = self.lock().subscribers.remove(&subscription_id);
        match removed {
            Some(queue) => {
                queue.close();
                log::debug!("[stream] pane {} subscriber {subscription_id} detached", self.pane_id);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// The last `max_lines` lines of scrollback.
    pub fn tail_lines(&self, max_lines: usize) -> Vec<u8> {
        self.lock().scrollback.tail_lines(max_lines)
    }

    pub fn search(&self, needle: &str) -> Vec<ScrollbackMatch> {
        self.lock().scrollback.search(needle)
    }

    /// Free the scrollback; later output is still streamed but not retained.
    pub fn release_scrollback(&self) {
        let mut inner = self.lock();
        inner.scrollback.clear();
        inner.released = true;
    }

    pub fn exit_event(&self) -> Option<PaneEvent> {
        self.lock().exit.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().exit.is_some()
    }

    pub fn last_output_at(&self) -> Option<DateTime<Utc>> {
        self.lock().last_output_at
    }

    /// The sequence number the next event will receive.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stream(capacity: usize) -> Arc<PaneStream> {
        PaneStream::new(7, ScrollbackLimits::default(), capacity)
    }

    fn out(data: &'static str) -> Bytes {
        Bytes::from_static(data.as_bytes())
    }

    #[test]
    fn sequence_starts_at_one() {
        let s = stream(16);
        assert_eq!(s.publish_output(out("a")), Some(1));
        assert_eq!(s.publish_output(out("b")), Some(2));
        assert_eq!(s.publish_output(Bytes::new()), None);
        assert_eq!(s.next_seq(), 3);
    }

    #[test]
    fn late_subscriber_gets_snapshot_then_live() {
        let s = stream(16);
        s.publish_output(out("one\n"));
        let mut sub = s.subscribe();
        s.publish_output(out("two\n"));

        let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| e.seq())
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn every_subscriber_gets_its_own_copy() {
        let s = stream(16);
        let mut a = s.subscribe();
        let mut b = s.subscribe();
        s.publish_output(out("x"));
        assert!(matches!(a.try_recv(), Some(PaneEvent::Output(c)) if c.seq == 1));
        assert!(matches!(b.try_recv(), Some(PaneEvent::Output(c)) if c.seq == 1));
    }

    #[test]
    fn overflow_drops_oldest_and_reports_truncation() {
        let s = stream(2);
        let mut sub = s.subscribe();
        for _ in 0..5 {
            s.publish_output(out("x"));
        }
        assert_eq!(
            sub.try_recv(),
            Some(PaneEvent::Error {
                pane_id: 7,
                error: StreamError::Truncated { dropped_chunks: 3 }
            })
        );
        assert_eq!(sub.try_recv().and_then(|e| e.seq()), Some(4));
        assert_eq!(sub.try_recv().and_then(|e| e.seq()), Some(5));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn evicted_scrollback_is_reported_to_new_subscribers() {
        let s = PaneStream::new(
            7,
            ScrollbackLimits {
                max_lines: 1,
                max_bytes: 1024,
            },
            16,
        );
        s.publish_output(out("a\n"));
        s.publish_output(out("b\n"));
        let mut sub = s.subscribe();
        assert!(matches!(
            sub.try_recv(),
            Some(PaneEvent::Error {
                error: StreamError::Truncated { dropped_chunks: 1 },
                ..
            })
        ));
        assert_eq!(sub.try_recv().and_then(|e| e.seq()), Some(2));
    }

    #[test]
    fn finish_is_delivered_once_and_last() {
        let s = stream(16);
        let mut sub = s.subscribe();
        s.publish_output(out("bye"));
        assert!(s.finish(Some(0), false));
        assert!(!s.finish(Some(1), true));
        assert_eq!(s.publish_output(out("late")), None);

        assert!(matches!(sub.try_recv(), Some(PaneEvent::Output(_))));
        assert_eq!(
            sub.try_recv(),
            Some(PaneEvent::Exit {
                pane_id: 7,
                seq: 2,
                exit_code: Some(0),
                killed: false
            })
        );
        assert_eq!(sub.try_recv(), None);
        assert_eq!(s.subscriber_count(), 0);
    }

    #[test]
    fn subscribing_after_exit_replays_history_and_exit() {
        let s = stream(16);
        s.publish_output(out("done\n"));
        s.finish(Some(3), false);
        let mut sub = s.subscribe();
        assert!(matches!(sub.try_recv(), Some(PaneEvent::Output(_))));
        assert!(matches!(sub.try_recv(), Some(PaneEvent::Exit { exit_code: Some(3), .. })));
        assert_eq!(s.subscriber_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let s = stream(16);
        let sub = s.subscribe();
        assert_eq!(s.subscriber_count(), 1);
        drop(sub);
        assert_eq!(s.subscriber_count(), 0);
    }

    #[test]
    fn released_scrollback_is_not_retained() {
        let s = stream(16);
        s.publish_output(out("before\n"));
        s.release_scrollback();
        s.publish_output(out("after\n"));
        assert!(s.tail_lines(10).is_empty());
        assert!(s.search("after").is_empty());
    }

    #[test]
    fn state_and_error_events_carry_no_seq() {
        let s = stream(16);
        let mut sub = s.subscribe();
        s.publish_state(Geometry::new(40, 120));
        s.publish_error(StreamError::ReadFailed {
            message: "boom".into(),
        });
        let state = sub.try_recv();
        assert_eq!(
            state,
            Some(PaneEvent::State {
                pane_id: 7,
                rows: 40,
                cols: 120
            })
        );
        assert_eq!(state.and_then(|e| e.seq()), None);
        assert!(matches!(sub.try_recv(), Some(PaneEvent::Error { .. })));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = PaneEvent::Exit {
            pane_id: 1,
            seq: 9,
            exit_code: Some(0),
            killed: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["exit_code"], 0);

        let error = PaneEvent::Error {
            pane_id: 1,
            error: StreamError::Truncated { dropped_chunks: 4 },
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["kind"], "truncated");
        assert_eq!(json["error"]["dropped_chunks"], 4);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish_and_ends_after_exit() {
        let s = stream(16);
        let mut sub = s.subscribe();
        let publisher = Arc::clone(&s);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish_output(Bytes::from_static(b"hi"));
            publisher.finish(None, true);
        });

        let first = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        assert!(matches!(first, Some(PaneEvent::Output(_))));
        let exit = sub.recv().await;
        assert!(matches!(exit, Some(PaneEvent::Exit { killed: true, .. })));
        assert_eq!(sub.recv().await, None);
        handle.join().unwrap();
    }
}
