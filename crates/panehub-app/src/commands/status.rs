use std::path::PathBuf;

use panehub_core::{AgentStatus, PaneId, StatusKey};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{to_value, CommandResult};
use crate::ipc::{args, CommandError};
use crate::state::AppState;

#[derive(Deserialize)]
struct KeyArgs {
    #[serde(default)]
    pane_id: Option<PaneId>,
    #[serde(default)]
    path: Option<PathBuf>,
}

impl KeyArgs {
    fn into_key(self) -> Result<StatusKey, CommandError> {
        match (self.pane_id, self.path) {
            (Some(pane_id), None) => Ok(StatusKey::Pane(pane_id)),
            (None, Some(path)) => Ok(StatusKey::Path(path)),
            _ => Err(CommandError::invalid_request("give exactly one of pane_id or path")),
        }
    }
}

#[derive(Deserialize)]
struct SetArgs {
    #[serde(flatten)]
    key: KeyArgs,
    status: AgentStatus,
}

pub fn get_agent_status(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let key = args::<KeyArgs>(raw)?.into_key()?;
    to_value(state.registry.agent_status(&key)?)
}

pub fn set_agent_status(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SetArgs { key, status } = args(raw)?;
    state.registry.set_agent_status(key.into_key()?, status)?;
    Ok(Value::Null)
}

pub fn list_agent_statuses(state: &AppState) -> CommandResult {
    to_value(state.registry.list_agent_statuses())
}
