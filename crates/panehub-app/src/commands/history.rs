use panehub_db::history;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{to_value, with_db, CommandResult};
use crate::ipc::args;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Deserialize)]
struct PanesArgs {
    history_id: i64,
}

/// Most recent sessions first, across daemon restarts.
pub async fn list_session_history(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let ListArgs { limit } = args(raw)?;
    let rows = with_db(state, move |conn| Ok(history::list_session_history(conn, limit)?)).await?;
    to_value(rows)
}

pub async fn list_pane_history(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let PanesArgs { history_id } = args(raw)?;
    let rows = with_db(state, move |conn| Ok(history::list_pane_history(conn, history_id)?)).await?;
    to_value(rows)
}
