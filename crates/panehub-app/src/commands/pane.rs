//! Pane lifecycle and layout requests shared by every pane type.

use panehub_core::{PaneId, PaneOptions, PaneType, SessionId};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{to_value, CommandResult};
use crate::ipc::args;
use crate::state::AppState;

#[derive(Deserialize)]
struct CreateArgs {
    session_id: SessionId,
    pane_type: PaneType,
    #[serde(flatten)]
    options: PaneOptions,
}

#[derive(Deserialize)]
struct PaneArgs {
    pane_id: PaneId,
}

#[derive(Deserialize)]
struct RenameArgs {
    pane_id: PaneId,
    title: String,
}

#[derive(Deserialize)]
struct ResizeArgs {
    pane_id: PaneId,
    rows: u16,
    cols: u16,
}

pub fn create_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let CreateArgs {
        session_id,
        pane_type,
        options,
    } = args(raw)?;
    to_value(state.registry.create_pane(session_id, pane_type, options)?)
}

pub fn get_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    to_value(state.registry.get_pane(pane_id)?)
}

pub fn close_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    state.registry.close_pane(pane_id)?;
    Ok(Value::Null)
}

pub fn focus_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    state.registry.focus_pane(pane_id)?;
    Ok(Value::Null)
}

pub fn rename_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let RenameArgs { pane_id, title } = args(raw)?;
    to_value(state.registry.rename_pane(pane_id, title)?)
}

/// Validates synchronously; the terminal itself is resized after the debounce.
pub fn resize_pane(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let ResizeArgs { pane_id, rows, cols } = args(raw)?;
    state.registry.resize_pane(pane_id, rows, cols)?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use panehub_core::ErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn editor_pane_lifecycle() {
        let state = state();
        let session = call(&state, "create_session", json!({})).await.unwrap();
        let session_id = session["id"].clone();

        let pane = call(
            &state,
            "create_pane",
            json!({"session_id": session_id, "pane_type": "editor", "title": "notes", "metadata": {"file": "a.md"}}),
        )
        .await
        .unwrap();
        let pane_id = pane["id"].clone();
        assert_eq!(pane["pane_type"], "editor");
        assert_eq!(pane["title"], "notes");
        assert_eq!(pane["metadata"]["file"], "a.md");

        call(&state, "resize_pane", json!({"pane_id": pane_id, "rows": 30, "cols": 100}))
            .await
            .unwrap();
        let described = call(&state, "get_pane", json!({"pane_id": pane_id})).await.unwrap();
        assert_eq!(described["rows"], 30);

        call(&state, "focus_pane", json!({"pane_id": pane_id})).await.unwrap();
        let renamed = call(&state, "rename_pane", json!({"pane_id": pane_id, "title": "todo"}))
            .await
            .unwrap();
        assert_eq!(renamed["title"], "todo");

        call(&state, "close_pane", json!({"pane_id": pane_id})).await.unwrap();
        // Closing twice is fine.
        call(&state, "close_pane", json!({"pane_id": pane_id})).await.unwrap();
        let err = call(&state, "get_pane", json!({"pane_id": pane_id})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn terminal_panes_need_create_terminal() {
        let state = state();
        let session = call(&state, "create_session", json!({})).await.unwrap();
        let err = call(
            &state,
            "create_pane",
            json!({"session_id": session["id"], "pane_type": "terminal"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn bad_geometry_is_rejected() {
        let state = state();
        let session = call(&state, "create_session", json!({})).await.unwrap();
        let pane = call(&state, "create_pane", json!({"session_id": session["id"], "pane_type": "dashboard"}))
            .await
            .unwrap();
        let err = call(&state, "resize_pane", json!({"pane_id": pane["id"], "rows": 0, "cols": 80}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidGeometry);
    }
}
