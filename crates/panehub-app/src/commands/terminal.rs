//! Terminal pane requests: spawning, input, scrollback and live streaming.

use bytes::Bytes;
use panehub_core::{ErrorCode, PaneId, SessionId, TerminalOptions};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{to_value, CommandResult, Context};
use crate::ipc::{args, CommandError};
use crate::state::AppState;

const DEFAULT_OUTPUT_LINES: usize = 1000;

#[derive(Deserialize)]
struct CreateArgs {
    session_id: SessionId,
    #[serde(flatten)]
    options: TerminalOptions,
}

#[derive(Deserialize)]
struct InputArgs {
    pane_id: PaneId,
    #[serde(default)]
    data: Option<Vec<u8>>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct OutputArgs {
    pane_id: PaneId,
    #[serde(default = "default_output_lines")]
    max_lines: usize,
}

fn default_output_lines() -> usize {
    DEFAULT_OUTPUT_LINES
}

#[derive(Deserialize)]
struct SearchArgs {
    pane_id: PaneId,
    needle: String,
}

#[derive(Deserialize)]
struct PaneArgs {
    pane_id: PaneId,
}

#[derive(Deserialize)]
struct UnsubscribeArgs {
    subscription: u64,
}

/// Spawning checks the filesystem and forks, so it runs on the blocking pool.
pub async fn create_terminal(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let CreateArgs { session_id, options } = args(raw)?;
    let registry = state.registry.clone();
    let descriptor = tokio::task::spawn_blocking(move || registry.create_terminal(session_id, options))
        .await
        .map_err(|e| CommandError::internal(format!("task join error: {e}")))??;
    to_value(descriptor)
}

/// Accepts raw bytes in `data` or UTF-8 in `text`, not both.
pub async fn send_terminal_input(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let InputArgs { pane_id, data, text } = args(raw)?;
    let bytes = match (data, text) {
        (Some(data), None) => Bytes::from(data),
        (None, Some(text)) => Bytes::from(text),
        (Some(_), Some(_)) => return Err(CommandError::invalid_request("give either data or text, not both")),
        (None, None) => return Err(CommandError::invalid_request("missing data or text")),
    };
    state.registry.send_input(pane_id, bytes).await?;
    Ok(Value::Null)
}

pub fn get_pane_output(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let OutputArgs { pane_id, max_lines } = args(raw)?;
    let data = state.registry.pane_output(pane_id, max_lines)?;
    let text = String::from_utf8_lossy(&data).into_owned();
    Ok(json!({ "pane_id": pane_id, "data": data, "text": text }))
}

pub fn search_pane_output(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SearchArgs { pane_id, needle } = args(raw)?;
    if needle.is_empty() {
        return Err(CommandError::invalid_request("needle must not be empty"));
    }
    to_value(state.registry.search_output(pane_id, &needle)?)
}

/// Starts streaming a pane to this connection. Events for the returned id
/// follow the response; the stream opens with the pane's scrollback.
pub fn subscribe(ctx: &mut Context<'_>, raw: &Map<String, Value>) -> CommandResult {
    let PaneArgs { pane_id } = args(raw)?;
    let subscription = ctx.state.registry.subscribe(pane_id)?;
    let id = ctx.pumps.queue(subscription);
    log::debug!("[terminal] subscription {id} opened for pane {pane_id}");
    Ok(json!({ "subscription": id, "pane_id": pane_id }))
}

pub fn unsubscribe(ctx: &mut Context<'_>, raw: &Map<String, Value>) -> CommandResult {
    let UnsubscribeArgs { subscription } = args(raw)?;
    if ctx.pumps.stop(subscription) {
        Ok(Value::Null)
    } else {
        Err(CommandError::new(
            ErrorCode::NotFound,
            format!("subscription {subscription} not found"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{dispatch, Context};
    use crate::event_pump::Pumps;
    use crate::ipc::Request;
    use panehub_core::ErrorCode;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread")]
    async fn nonexistent_shell_is_a_spawn_failure() {
        let state = state();
        let session = call(&state, "create_session", json!({})).await.unwrap();
        let err = call(
            &state,
            "create_terminal",
            json!({"session_id": session["id"], "shell": "/nonexistent", "rows": 24, "cols": 80}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SpawnFailed);

        let panes = call(&state, "list_panes", json!({"session_id": session["id"]})).await.unwrap();
        assert_eq!(panes, json!([]));
    }

    #[tokio::test]
    async fn create_terminal_works_on_a_single_threaded_runtime() {
        let state = state();
        let session = call(&state, "create_session", json!({})).await.unwrap();
        let pane = call(
            &state,
            "create_terminal",
            json!({"session_id": session["id"], "shell": "/bin/sh", "args": ["-c", "sleep 5"]}),
        )
        .await
        .unwrap();
        assert_eq!(pane["session_id"], session["id"]);

        let panes = call(&state, "list_panes", json!({"session_id": session["id"]})).await.unwrap();
        assert_eq!(panes[0]["id"], pane["id"]);
        call(&state, "close_pane", json!({"pane_id": pane["id"]})).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn input_needs_exactly_one_payload() {
        let state = state();
        let err = call(&state, "send_terminal_input", json!({"pane_id": 1})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
        let err = call(&state, "send_terminal_input", json!({"pane_id": 1, "text": "a", "data": [97]}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscription_streams_echoed_input() {
        let state = state();
        let session = call(&state, "create_session", json!({"name": "demo"})).await.unwrap();
        let pane = call(
            &state,
            "create_terminal",
            json!({
                "session_id": session["id"],
                "shell": "/bin/sh",
                "args": ["-c", "read line; echo \"got:$line\""],
                "rows": 24,
                "cols": 80
            }),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let mut pumps = Pumps::new();
        let mut ctx = Context {
            state: &state,
            pumps: &mut pumps,
        };
        let request = |op: &str, body: Value| Request {
            id: 1,
            op: op.to_string(),
            args: args(body),
        };
        let sub = dispatch(&mut ctx, &request("subscribe", json!({"pane_id": pane["id"]})))
            .await
            .unwrap();
        ctx.pumps.launch(&tx);
        dispatch(
            &mut ctx,
            &request("send_terminal_input", json!({"pane_id": pane["id"], "text": "hello\n"})),
        )
        .await
        .unwrap();

        let mut output = String::new();
        loop {
            let line = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["subscription"], sub["subscription"]);
            match value["event"]["type"].as_str().unwrap() {
                "output" => {
                    let bytes: Vec<u8> = serde_json::from_value(value["event"]["data"].clone()).unwrap();
                    output.push_str(&String::from_utf8_lossy(&bytes));
                }
                "exit" => {
                    assert_eq!(value["event"]["exit_code"], 0);
                    break;
                }
                _ => {}
            }
        }
        assert!(output.contains("got:hello"));

        let tail = dispatch(&mut ctx, &request("get_pane_output", json!({"pane_id": pane["id"]})))
            .await
            .unwrap();
        assert!(tail["text"].as_str().unwrap().contains("got:hello"));

        let found = dispatch(
            &mut ctx,
            &request("search_pane_output", json!({"pane_id": pane["id"], "needle": "got:"})),
        )
        .await
        .unwrap();
        assert!(!found.as_array().unwrap().is_empty());

        let err = dispatch(
            &mut ctx,
            &request("unsubscribe", json!({"subscription": 999_999})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
