//! panehub-core: sessions, panes and everything that runs alongside them.
//!
//! [`SessionRegistry`] is the entry point. It owns the session map and a
//! [`PaneManager`], and wires each terminal pane to the resize coordinator,
//! the metrics sampler and the agent status tracker.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pane;
pub mod registry;
pub mod resize;
pub mod status;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ErrorCode, OrchestratorError, Result};
pub use events::RegistryEvent;
pub use metrics::{HostMetrics, MetricsSample, MetricsSampler, ProcessProbe, SysinfoProbe};
pub use pane::{PaneDescriptor, PaneManager, PaneOptions, PaneState, PaneType, ProcessSummary, TerminalOptions};
pub use registry::{CloseFailure, CloseReport, SessionDescriptor, SessionId, SessionRegistry};
pub use resize::{ResizeCoordinator, ResizeTarget};
pub use status::{AgentStatus, AgentStatusTracker, StatusChange, StatusEntry, StatusExpiry, StatusKey};

pub use panehub_pty::{PaneEvent, PaneId, ScrollbackMatch, StreamError, Subscription};
