use panehub_core::SessionId;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{to_value, CommandResult};
use crate::ipc::args;
use crate::state::AppState;

#[derive(Deserialize)]
struct CreateArgs {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct SessionArgs {
    session_id: SessionId,
}

#[derive(Deserialize)]
struct RenameArgs {
    session_id: SessionId,
    name: String,
}

pub fn create_session(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let CreateArgs { name } = args(raw)?;
    to_value(state.registry.create_session(name))
}

pub fn list_sessions(state: &AppState) -> CommandResult {
    to_value(state.registry.list_sessions())
}

pub fn get_session(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SessionArgs { session_id } = args(raw)?;
    to_value(state.registry.get_session(session_id)?)
}

pub fn rename_session(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let RenameArgs { session_id, name } = args(raw)?;
    to_value(state.registry.rename_session(session_id, name)?)
}

/// Closes every pane in the session. Pane failures are reported, not raised.
pub fn close_session(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SessionArgs { session_id } = args(raw)?;
    let report = state.registry.close_session(session_id)?;
    if !report.is_clean() {
        log::warn!(
            "[session] closed session {session_id} with {} pane failure(s)",
            report.failed.len()
        );
    }
    to_value(report)
}

pub fn list_panes(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SessionArgs { session_id } = args(raw)?;
    to_value(state.registry.list_panes(session_id)?)
}
