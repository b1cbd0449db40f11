//! Wire types for the daemon socket.
//!
//! Every message is one JSON object per line. Clients send [`Request`]s;
//! the daemon answers each with a response and interleaves subscription
//! events, both serialized through [`Outbound`] with a `type` tag.

use panehub_core::{ErrorCode, OrchestratorError, PaneEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A request line: `{"id": 1, "op": "list_sessions", ...args}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: String,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: CommandError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

/// Everything the daemon writes to a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response(Response),
    Event { subscription: u64, event: PaneEvent },
}

impl Outbound {
    /// Serializes to a single line without the trailing newline.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(line) => line,
            Err(e) => {
                log::error!("[ipc] failed to encode outbound message: {e}");
                let fallback = Response::err(0, CommandError::internal(format!("encode failed: {e}")));
                serde_json::to_string(&Outbound::Response(fallback)).unwrap_or_default()
            }
        }
    }
}

/// Error returned by a command handler, carrying its wire code.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<OrchestratorError> for CommandError {
    fn from(e: OrchestratorError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<rusqlite::Error> for CommandError {
    fn from(e: rusqlite::Error) -> Self {
        Self::internal(format!("database: {e}"))
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_request(e.to_string())
    }
}

/// Parses one request line. On failure the error is paired with whatever
/// id could be recovered so the client can still correlate the response.
pub fn parse_request(line: &str) -> Result<Request, (u64, CommandError)> {
    serde_json::from_str::<Request>(line).map_err(|e| {
        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_u64))
            .unwrap_or(0);
        (id, CommandError::invalid_request(format!("malformed request: {e}")))
    })
}

/// Deserializes the request arguments into a typed struct.
pub fn args<T: serde::de::DeserializeOwned>(args: &Map<String, Value>) -> Result<T, CommandError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(CommandError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use panehub_pty::OutputChunk;
    use serde_json::json;

    #[test]
    fn request_args_are_flattened() {
        let req = parse_request(r#"{"id":4,"op":"resize_pane","pane_id":2,"rows":40,"cols":120}"#).unwrap();
        assert_eq!(req.id, 4);
        assert_eq!(req.op, "resize_pane");
        assert_eq!(req.args.get("rows"), Some(&json!(40)));
        assert!(!req.args.contains_key("op"));
    }

    #[test]
    fn malformed_request_keeps_the_id_when_possible() {
        let (id, err) = parse_request(r#"{"id":9}"#).unwrap_err();
        assert_eq!(id, 9);
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let (id, _) = parse_request("not json").unwrap_err();
        assert_eq!(id, 0);
    }

    #[test]
    fn responses_are_tagged() {
        let ok = Outbound::Response(Response::ok(1, json!({"x": 1})));
        let value: Value = serde_json::from_str(&ok.to_line()).unwrap();
        assert_eq!(value, json!({"type": "response", "id": 1, "ok": true, "result": {"x": 1}}));

        let err = Outbound::Response(Response::err(2, CommandError::new(ErrorCode::NotFound, "pane 3 not found")));
        let value: Value = serde_json::from_str(&err.to_line()).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("not_found"));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn events_carry_the_subscription() {
        let event = PaneEvent::Output(OutputChunk {
            pane_id: 5,
            seq: 1,
            data: Bytes::from_static(b"hi"),
        });
        let line = Outbound::Event { subscription: 7, event }.to_line();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], json!("event"));
        assert_eq!(value["subscription"], json!(7));
        assert_eq!(value["event"]["type"], json!("output"));
        assert_eq!(value["event"]["pane_id"], json!(5));
    }

    #[test]
    fn orchestrator_errors_keep_their_code() {
        let err = CommandError::from(OrchestratorError::PaneNotFound(3));
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
