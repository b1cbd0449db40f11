//! Request handlers, one module per area.
//!
//! [`dispatch`] maps an op name to its handler. Handlers parse their own
//! arguments and return a JSON result or a [`CommandError`].

pub mod history;
pub mod metrics;
pub mod pane;
pub mod session;
pub mod settings;
pub mod status;
pub mod terminal;

use serde::Serialize;
use serde_json::Value;

use crate::event_pump::Pumps;
use crate::ipc::{CommandError, Request};
use crate::state::AppState;

pub type CommandResult = Result<Value, CommandError>;

/// Per-connection context handed to every handler.
pub struct Context<'a> {
    pub state: &'a AppState,
    pub pumps: &'a mut Pumps,
}

pub async fn dispatch(ctx: &mut Context<'_>, req: &Request) -> CommandResult {
    let state = ctx.state;
    let args = &req.args;
    match req.op.as_str() {
        "create_session" => session::create_session(state, args),
        "list_sessions" => session::list_sessions(state),
        "get_session" => session::get_session(state, args),
        "rename_session" => session::rename_session(state, args),
        "close_session" => session::close_session(state, args),
        "list_panes" => session::list_panes(state, args),

        "create_pane" => pane::create_pane(state, args),
        "get_pane" => pane::get_pane(state, args),
        "close_pane" => pane::close_pane(state, args),
        "focus_pane" => pane::focus_pane(state, args),
        "rename_pane" => pane::rename_pane(state, args),
        "resize_pane" => pane::resize_pane(state, args),

        "create_terminal" => terminal::create_terminal(state, args).await,
        "send_terminal_input" => terminal::send_terminal_input(state, args).await,
        "get_pane_output" => terminal::get_pane_output(state, args),
        "search_pane_output" => terminal::search_pane_output(state, args),
        "subscribe" => terminal::subscribe(ctx, args),
        "unsubscribe" => terminal::unsubscribe(ctx, args),

        "get_pane_metrics" => metrics::get_pane_metrics(state, args),
        "get_latest_metrics" => metrics::get_latest_metrics(state, args),
        "get_system_metrics" => metrics::get_system_metrics(state).await,

        "get_agent_status" => status::get_agent_status(state, args),
        "set_agent_status" => status::set_agent_status(state, args),
        "list_agent_statuses" => status::list_agent_statuses(state),

        "get_settings" => settings::get_settings(state).await,
        "set_setting" => settings::set_setting(state, args).await,

        "list_session_history" => history::list_session_history(state, args).await,
        "list_pane_history" => history::list_pane_history(state, args).await,

        other => Err(CommandError::invalid_request(format!("unknown op: {other}"))),
    }
}

/// Serialize a handler result.
pub(crate) fn to_value<T: Serialize>(value: T) -> CommandResult {
    serde_json::to_value(value).map_err(|e| CommandError::internal(format!("encode failed: {e}")))
}

/// Run a database closure off the async runtime.
pub(crate) async fn with_db<T, F>(state: &AppState, f: F) -> Result<T, CommandError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, CommandError> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    })
    .await
    .map_err(|e| CommandError::internal(format!("task join error: {e}")))?
}
