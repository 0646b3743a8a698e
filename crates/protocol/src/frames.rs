use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// RPC request frame: `{"request": ..., "id": ..., "args": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    /// Validate only: no mutation, no persistence, no events.
    #[serde(rename = "dryRun", default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

/// RPC response frame, echoing the request discriminator and `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub response: String,
    pub id: u64,
    pub result: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl RpcResponse {
    pub fn ok(request: &str, id: u64, data: Value) -> Self {
        Self {
            response: request.to_owned(),
            id,
            result: true,
            messages: Vec::new(),
            data,
        }
    }

    pub fn error(request: &str, id: u64, messages: Vec<String>) -> Self {
        Self {
            response: request.to_owned(),
            id,
            result: false,
            messages,
            data: Value::Null,
        }
    }
}

/// Kind of change a `Changed` event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Add,
    Update,
    Remove,
}

/// Event frame fanned out to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(rename = "changeType", default, skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl EventFrame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_owned(),
            data,
            change_type: None,
            parent_id: None,
        }
    }

    pub fn with_change(event: &str, data: Value, change_type: ChangeType) -> Self {
        Self {
            event: event.to_owned(),
            data,
            change_type: Some(change_type),
            parent_id: None,
        }
    }

    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_owned());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RpcRequest),
    Response(RpcResponse),
    Event(EventFrame),
}

/// Framing-level failure: bad JSON or an unrecognizable envelope.
/// Callers log these and drop the frame without a response.
#[derive(Debug)]
pub struct FrameError(pub String);

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bad frame: {}", self.0)
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    /// Classify a text frame by its envelope key.
    pub fn parse(text: &str) -> Result<Frame, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| FrameError("not an object".to_owned()))?;

        if obj.contains_key("request") {
            serde_json::from_value(value)
                .map(Frame::Request)
                .map_err(|e| FrameError(e.to_string()))
        } else if obj.contains_key("response") {
            serde_json::from_value(value)
                .map(Frame::Response)
                .map_err(|e| FrameError(e.to_string()))
        } else if obj.contains_key("event") {
            serde_json::from_value(value)
                .map(Frame::Event)
                .map_err(|e| FrameError(e.to_string()))
        } else {
            Err(FrameError("neither request, response nor event".to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let text = r#"{"request": "OpenScene", "id": 7, "args": {"id": "s1"}}"#;
        match Frame::parse(text).unwrap() {
            Frame::Request(req) => {
                assert_eq!(req.request, "OpenScene");
                assert_eq!(req.id, 7);
                assert!(!req.dry_run);
                assert_eq!(req.args["id"], "s1");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn dry_run_flag_parses_and_skips_when_false() {
        let text = r#"{"request": "AddAction", "id": 1, "args": {}, "dryRun": true}"#;
        let Frame::Request(req) = Frame::parse(text).unwrap() else {
            panic!("expected request");
        };
        assert!(req.dry_run);

        let round = serde_json::to_string(&RpcRequest {
            request: "AddAction".into(),
            id: 1,
            args: Value::Null,
            dry_run: false,
        })
        .unwrap();
        assert!(!round.contains("dryRun"));
    }

    #[test]
    fn change_type_wire_names_are_screaming() {
        let frame = EventFrame::with_change("SceneChanged", Value::Null, ChangeType::Remove);
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""changeType":"REMOVE""#));
    }

    #[test]
    fn garbage_is_a_framing_error() {
        assert!(Frame::parse("not json").is_err());
        assert!(Frame::parse(r#"{"neither": 1}"#).is_err());
        assert!(Frame::parse("[1,2]").is_err());
    }
}
