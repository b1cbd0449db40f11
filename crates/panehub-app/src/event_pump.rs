//! Forwards pane subscriptions to a connection.
//!
//! Each subscribe request gets its own pump task. The pump pulls events
//! from the pane's bounded subscriber queue and writes them to the
//! connection's outbound channel. A slow socket backs up the outbound
//! channel, the pump stops pulling, and the pane drops that subscriber's
//! oldest events without affecting anyone else.

use std::collections::HashMap;

use panehub_core::Subscription;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ipc::Outbound;

/// Start forwarding `subscription` to `outbound`.
///
/// The pump stops after the exit event, when the connection goes away, or
/// when its task is aborted. Dropping the subscription unsubscribes it.
pub fn start_event_pump(mut subscription: Subscription, outbound: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = subscription.id();
        let pane_id = subscription.pane_id();
        while let Some(event) = subscription.recv().await {
            let is_exit = event.is_exit();
            let line = Outbound::Event {
                subscription: id,
                event,
            }
            .to_line();
            if outbound.send(line).await.is_err() {
                log::debug!("[pump] connection closed, dropping subscription {id} for pane {pane_id}");
                return;
            }
            if is_exit {
                break;
            }
        }
        log::debug!("[pump] subscription {id} for pane {pane_id} finished");
    })
}

/// The pumps of one connection, keyed by subscription id.
///
/// Subscriptions are queued first and launched once the subscribe response
/// has been written, so a client never sees events for an id it has not
/// been told about yet.
#[derive(Default)]
pub struct Pumps {
    pending: Vec<Subscription>,
    handles: HashMap<u64, JoinHandle<()>>,
}

impl Pumps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a subscription and return the id given to the client.
    pub fn queue(&mut self, subscription: Subscription) -> u64 {
        let id = subscription.id();
        self.pending.push(subscription);
        id
    }

    /// Start a pump for every queued subscription.
    pub fn launch(&mut self, outbound: &mpsc::Sender<String>) {
        if self.pending.is_empty() {
            return;
        }
        self.handles.retain(|_, handle| !handle.is_finished());
        for subscription in self.pending.drain(..) {
            let id = subscription.id();
            self.handles.insert(id, start_event_pump(subscription, outbound.clone()));
        }
    }

    /// Stop one pump. Returns `false` if the id is unknown.
    pub fn stop(&mut self, id: u64) -> bool {
        if let Some(index) = self.pending.iter().position(|sub| sub.id() == id) {
            self.pending.remove(index);
            return true;
        }
        match self.handles.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        self.pending.clear();
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }

    /// Subscriptions still attached to this connection.
    pub fn len(&self) -> usize {
        self.pending.len() + self.handles.values().filter(|handle| !handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        self.stop_all();
    }
}
