//! Stored settings. Values are validated against the orchestrator config
//! before they are written and take effect on the next daemon start.

use panehub_db::settings;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{to_value, with_db, CommandResult};
use crate::ipc::{args, CommandError};
use crate::state::AppState;

#[derive(Deserialize)]
struct SetArgs {
    key: String,
    value: String,
}

pub async fn get_settings(state: &AppState) -> CommandResult {
    let stored = with_db(state, |conn| Ok(settings::all(conn)?)).await?;
    to_value(stored)
}

pub async fn set_setting(state: &AppState, raw: &Map<String, Value>) -> CommandResult {
    let SetArgs { key, value } = args(raw)?;
    let mut candidate = state.registry.config().clone();
    candidate
        .apply_setting(&key, &value)
        .map_err(|e| CommandError::invalid_request(e.to_string()))?;

    let stored_key = key.clone();
    with_db(state, move |conn| Ok(settings::set(conn, &stored_key, value.trim())?)).await?;
    log::info!("[settings] {key} updated, applies on restart");
    Ok(json!({ "key": key, "restart_required": true }))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use panehub_core::ErrorCode;
    use serde_json::json;

    #[tokio::test]
    async fn valid_settings_are_stored() {
        let state = state();
        call(&state, "set_setting", json!({"key": "close_grace_ms", "value": " 500 "}))
            .await
            .unwrap();
        let stored = call(&state, "get_settings", json!({})).await.unwrap();
        assert_eq!(stored["close_grace_ms"], "500");
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let state = state();
        let err = call(&state, "set_setting", json!({"key": "warp_factor", "value": "9"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = call(&state, "set_setting", json!({"key": "scrollback_lines", "value": "lots"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let stored = call(&state, "get_settings", json!({})).await.unwrap();
        assert_eq!(stored, json!({}));
    }
}
