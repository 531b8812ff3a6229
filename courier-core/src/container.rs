//! Container wire protocol.
//!
//! Defines the agent process boundary:
//! - `ContainerInput`: JSON written as the first stdin line
//! - `AgentEvent`: one JSON object per stdout line while the agent runs
//! - `ContainerOutput`: terminal summary assembled by the runner

use serde::{Deserialize, Serialize};

/// Input payload written to the container's stdin as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
}

/// One line of agent stdout. Unknown or malformed lines are logged and
/// dropped by the runner; they never poison the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    Result {
        result: serde_json::Value,
    },
    SessionUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Status {
        status: ContainerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Success,
    Error,
}

/// Terminal summary of a container run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: ContainerStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse one stdout line into an event.
pub fn parse_agent_event(line: &str) -> Result<AgentEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Render a `result` payload to user-visible text. String results pass
/// through; structured values are serialized.
pub fn render_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip `<internal>...</internal>` spans from agent output. Non-greedy,
/// deliberately not a structured parser; an unclosed tag strips to the end.
pub fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        match rest[start..].find("</internal>") {
            Some(end) => rest = &rest[start + end + "</internal>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_serializes_camel_case() {
        let input = ContainerInput {
            prompt: "hello".into(),
            session_id: Some("sess-123".into()),
            group_folder: "main".into(),
            chat_jid: "tg:123".into(),
            is_main: true,
            is_scheduled_task: None,
            assistant_name: Some("Marlow".into()),
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatJid\""));
        assert!(json.contains("\"groupFolder\""));
        assert!(json.contains("\"isMain\""));
        assert!(!json.contains("\"isScheduledTask\""));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn parses_result_event() {
        let ev = parse_agent_event(r#"{"type":"result","result":"hi there"}"#).unwrap();
        match ev {
            AgentEvent::Result { result } => assert_eq!(render_result(&result), "hi there"),
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn parses_structured_result() {
        let ev = parse_agent_event(r#"{"type":"result","result":{"items":[1,2]}}"#).unwrap();
        match ev {
            AgentEvent::Result { result } => {
                assert_eq!(render_result(&result), r#"{"items":[1,2]}"#)
            }
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn parses_session_update() {
        let ev = parse_agent_event(r#"{"type":"session-update","sessionId":"sess-9"}"#).unwrap();
        match ev {
            AgentEvent::SessionUpdate { session_id } => assert_eq!(session_id, "sess-9"),
            _ => panic!("expected SessionUpdate"),
        }
    }

    #[test]
    fn parses_status_events() {
        let ok = parse_agent_event(r#"{"type":"status","status":"success"}"#).unwrap();
        assert!(matches!(
            ok,
            AgentEvent::Status {
                status: ContainerStatus::Success,
                error: None
            }
        ));

        let err =
            parse_agent_event(r#"{"type":"status","status":"error","error":"boom"}"#).unwrap();
        match err {
            AgentEvent::Status { status, error } => {
                assert_eq!(status, ContainerStatus::Error);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            _ => panic!("expected Status"),
        }
    }

    #[test]
    fn malformed_line_is_error() {
        assert!(parse_agent_event("not json").is_err());
        assert!(parse_agent_event(r#"{"type":"telemetry"}"#).is_err());
    }

    #[test]
    fn strip_internal_basic() {
        assert_eq!(
            strip_internal_blocks("Hello <internal>notes</internal> World"),
            "Hello  World"
        );
    }

    #[test]
    fn strip_internal_multiple_and_unclosed() {
        assert_eq!(
            strip_internal_blocks("A <internal>x</internal> B <internal>y</internal> C"),
            "A  B  C"
        );
        assert_eq!(strip_internal_blocks("Hello <internal>tail"), "Hello");
    }

    #[test]
    fn strip_internal_can_empty_result() {
        assert_eq!(strip_internal_blocks("<internal>only notes</internal>"), "");
    }
}
