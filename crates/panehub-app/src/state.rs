//! Application state shared between connections, event pumps and the recorder.

use std::sync::{Arc, Mutex, MutexGuard};

use panehub_core::SessionRegistry;
use rusqlite::Connection;

/// Global daemon state, cloned into every connection task.
#[derive(Clone)]
pub struct AppState {
    /// Sessions and panes.
    pub registry: Arc<SessionRegistry>,
    /// Settings and lifecycle history.
    pub db: Arc<Mutex<Connection>>,
}

impl AppState {
    pub fn new(registry: SessionRegistry, db: Connection) -> Self {
        Self {
            registry: Arc::new(registry),
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Lock the database. A poisoned lock still hands out the connection.
    pub fn db(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}
