use panehub_pty::PaneId;
use serde::{Deserialize, Serialize};

use crate::pane::PaneDescriptor;
use crate::registry::{SessionDescriptor, SessionId};

/// Session and pane lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    SessionCreated { session: SessionDescriptor },
    SessionRenamed { session_id: SessionId, name: String },
    SessionClosed { session_id: SessionId },
    PaneCreated { pane: PaneDescriptor },
    PaneClosed { pane_id: PaneId, session_id: SessionId },
    /// The pane's process ended. `killed` is set when it was closed.
    PaneExited {
        pane_id: PaneId,
        exit_code: Option<i32>,
        killed: bool,
    },
}
