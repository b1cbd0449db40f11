use panehub_core::PaneId;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{to_value, CommandResult};
use crate::ipc::{args, CommandError};
use crate::state::AppState;

#[derive(Deserialize)]
struct PaneArgs {
    pane_id: PaneId,
}

/// Recent samples for one terminal pane, oldest first.
pub fn get_pane_metrics(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    to_value(state.registry.pane_metrics(pane_id)?)
}

pub fn get_latest_metrics(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    to_value(state.registry.latest_metrics(pane_id)?)
}

/// Host CPU, memory and disk. Refreshing blocks, so it runs off the runtime.
pub async fn get_system_metrics(state: &AppState) -> CommandResult {
    let registry = state.registry.clone();
    let host = tokio::task::spawn_blocking(move || registry.host_metrics())
        .await
        .map_err(|e| CommandError::internal(format!("task join error: {e}")))?;
    to_value(host)
}
