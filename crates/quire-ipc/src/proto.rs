//! Wire frames exchanged with the backend: one JSON object per line.

use serde_json::{Value, json};

/// A frame received from the backend.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    /// Reply to a request, matched by id.
    Response {
        id: i64,
        result: Result<Value, String>,
    },
    /// Push event on a topic.
    Event { topic: String, payload: Value },
}

pub(crate) fn encode_request(id: i64, command: &str, args: &Value) -> String {
    json!({"id": id, "command": command, "args": args}).to_string()
}

/// Classify one line from the backend. `None` for frames that fit neither
/// shape (the caller logs and skips them).
pub(crate) fn parse_frame(line: &str) -> Option<Frame> {
    let value: Value = serde_json::from_str(line).ok()?;

    if let Some(topic) = value.get("topic").and_then(Value::as_str) {
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);
        return Some(Frame::Event {
            topic: topic.to_string(),
            payload,
        });
    }

    let id = value.get("id").and_then(Value::as_i64)?;
    let result = if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown backend error");
        Err(message.to_string())
    } else {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    };
    Some(Frame::Response { id, result })
}
