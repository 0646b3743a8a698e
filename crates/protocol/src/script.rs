//! The contract the generated script honors towards the manager.
//!
//! stdout: one JSON event per `\n`-terminated line, flushed per line.
//! stdin: single-character control codes. SIGTERM requests termination
//! with cleanup.

use serde::{Deserialize, Serialize};

use crate::execution::PackageStateData;

/// Written to the script's stdin to request a pause at the next safe point.
pub const CONTROL_PAUSE: &[u8] = b"p\n";
/// Written to the script's stdin to resume a paused script.
pub const CONTROL_RESUME: &[u8] = b"r\n";

/// Events the script emits on stdout, dispatched by the `event` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ScriptEvent {
    /// Authoritative run state from the child.
    PackageState { data: PackageStateData },
    /// About to execute an action; parameters are resolved input values.
    ActionStateBefore { data: ActionStateBefore },
    /// Action completed; `results` carries produced outputs.
    ActionStateAfter { data: ActionStateAfter },
    /// Fatal script error; the run terminates after this.
    ProjectException { data: ProjectException },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStateBefore {
    pub action_id: String,
    /// JSON-encoded input values, in declaration order.
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStateAfter {
    pub action_id: String,
    /// JSON-encoded outputs; empty when the action returns nothing.
    #[serde(default)]
    pub results: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectException {
    pub message: String,
    pub exception_type: String,
    /// Whether the exception was the runtime's own error class.
    #[serde(default)]
    pub handled: bool,
}

impl ScriptEvent {
    /// Parse one stdout line. `None` for lines that are valid JSON but
    /// not a known event; the caller logs and drops those.
    pub fn parse_line(line: &str) -> Result<Option<ScriptEvent>, serde_json::Error> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(trimmed)?;
        if value.get("event").is_none() {
            return Ok(None);
        }
        match serde_json::from_value(value) {
            Ok(event) => Ok(Some(event)),
            // Unknown discriminator: tolerated, scripts may be newer.
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PackageState;

    #[test]
    fn package_state_line_parses() {
        let line = r#"{"event": "PackageState", "data": {"state": "Running"}}"#;
        match ScriptEvent::parse_line(line).unwrap() {
            Some(ScriptEvent::PackageState { data }) => {
                assert_eq!(data.state, PackageState::Running);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn action_state_before_carries_parameters() {
        let line = r#"{"event": "ActionStateBefore", "data": {"actionId": "a1", "parameters": ["0.5"]}}"#;
        match ScriptEvent::parse_line(line).unwrap() {
            Some(ScriptEvent::ActionStateBefore { data }) => {
                assert_eq!(data.action_id, "a1");
                assert_eq!(data.parameters, vec!["0.5".to_owned()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_dropped_not_fatal() {
        let line = r#"{"event": "SomethingNew", "data": {}}"#;
        assert!(ScriptEvent::parse_line(line).unwrap().is_none());
        let line = r#"{"noEvent": 1}"#;
        assert!(ScriptEvent::parse_line(line).unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(ScriptEvent::parse_line("{truncated").is_err());
    }

    #[test]
    fn control_codes() {
        assert_eq!(CONTROL_PAUSE, b"p\n");
        assert_eq!(CONTROL_RESUME, b"r\n");
    }
}
