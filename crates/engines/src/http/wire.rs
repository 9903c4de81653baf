//! Wire shapes for the HTTP+SSE backend and their conversion into the
//! canonical model.
//!
//! The backend capitalises `ID` in field names (`sessionID`, `messageID`);
//! aliases keep both spellings parseable.

use crate::model::{
    EngineType, Message, MessageTime, Part, PartBody, Role, Session, SessionTime, TokenUsage,
    ToolState, ToolTimeRange, ToolTimeStart, default_session_title, normalize_directory, now_ms,
};
use serde::Deserialize;
use serde_json::Value;

/// One frame on the `/global/event` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSessionTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub updated: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSession {
    pub id: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "parentID", alias = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: Option<WireSessionTime>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl WireSession {
    pub fn into_session(self, engine_type: EngineType, fallback_directory: &str) -> Session {
        let now = now_ms();
        let time = self.time.unwrap_or(WireSessionTime {
            created: None,
            updated: None,
        });
        Session {
            id: self.id,
            engine_type,
            directory: normalize_directory(
                self.directory.as_deref().unwrap_or(fallback_directory),
            ),
            title: match self.title {
                Some(t) if !t.is_empty() => t,
                _ => default_session_title(now),
            },
            parent_id: self.parent_id,
            time: SessionTime {
                created: time.created.unwrap_or(now),
                updated: time.updated.unwrap_or(now),
            },
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTimeRange {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireToolState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time: Option<WireTimeRange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePart {
    pub id: String,
    #[serde(rename = "messageID", alias = "messageId")]
    pub message_id: String,
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(rename = "callID", alias = "callId", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub state: Option<WireToolState>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
}

fn tool_state(state: Option<WireToolState>, now: i64) -> ToolState {
    let Some(state) = state else {
        return ToolState::Pending { input: None };
    };
    let time = state.time.unwrap_or_default();
    let start = time.start.unwrap_or(now);
    let end = time.end.unwrap_or(now);
    match state.status.as_str() {
        "running" => ToolState::Running {
            input: state.input,
            time: ToolTimeStart { start },
        },
        "completed" => ToolState::Completed {
            input: state.input,
            time: ToolTimeRange {
                start,
                end,
                duration: end - start,
            },
            output: state.output.unwrap_or(Value::Null),
        },
        "error" | "failed" => ToolState::Error {
            input: state.input,
            time: ToolTimeRange {
                start,
                end,
                duration: end - start,
            },
            error: state.error.unwrap_or_else(|| "Tool failed".to_string()),
        },
        _ => ToolState::Pending { input: state.input },
    }
}

impl WirePart {
    /// Canonicalise; unknown part kinds yield `None` and are dropped.
    pub fn into_part(self) -> Option<Part> {
        let now = now_ms();
        let body = match self.kind.as_str() {
            "text" => PartBody::Text {
                text: self.text.unwrap_or_default(),
            },
            "reasoning" => PartBody::Reasoning {
                text: self.text.unwrap_or_default(),
            },
            "tool" => {
                let title = self
                    .state
                    .as_ref()
                    .and_then(|s| s.title.clone())
                    .or_else(|| self.tool.clone())
                    .unwrap_or_default();
                PartBody::Tool {
                    call_id: self.call_id.unwrap_or_else(|| self.id.clone()),
                    normalized_tool: self.tool.clone(),
                    original_tool: self.tool,
                    title,
                    kind: None,
                    state: tool_state(self.state, now),
                    locations: None,
                    diff: self.diff,
                }
            }
            "file" => PartBody::File {
                mime: self.mime.unwrap_or_default(),
                filename: self.filename.unwrap_or_default(),
                url: self.url.unwrap_or_default(),
            },
            "step-start" => PartBody::StepStart,
            "step-finish" => PartBody::StepFinish,
            "snapshot" => PartBody::Snapshot {
                files: self.files.unwrap_or_default(),
            },
            "patch" => PartBody::Patch {
                content: self.content.unwrap_or_default(),
                path: self.path.unwrap_or_default(),
            },
            other => {
                tracing::debug!(kind = %other, "dropping unknown part kind");
                return None;
            }
        };
        Some(Part {
            id: self.id,
            message_id: self.message_id,
            session_id: self.session_id,
            body,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTokens {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessageTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
    pub role: String,
    #[serde(default)]
    pub time: Option<WireMessageTime>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
    #[serde(default)]
    pub tokens: Option<WireTokens>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(rename = "modelID", alias = "modelId", default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    /// Either a plain string or an error object with a nested message.
    #[serde(default)]
    pub error: Option<Value>,
}

pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("data")
            .and_then(|d| d.get("message"))
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        other => other.to_string(),
    }
}

impl WireMessage {
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    /// Terminal assistant messages resolve the session's pending send.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.time.as_ref().is_some_and(|t| t.completed.is_some()) || self.error.is_some()
    }

    /// Canonicalise, substituting `fallback_parts` when the message itself
    /// carries none (history endpoints split info and parts).
    pub fn into_message(self, fallback_parts: Vec<Part>) -> Message {
        let now = now_ms();
        let role = if self.role == "user" {
            Role::User
        } else {
            Role::Assistant
        };
        let created = self
            .time
            .as_ref()
            .and_then(|t| t.created)
            .unwrap_or(now);
        let completed = self.time.as_ref().and_then(|t| t.completed);
        let own_parts: Vec<Part> = self
            .parts
            .into_iter()
            .filter_map(WirePart::into_part)
            .collect();
        Message {
            id: self.id,
            session_id: self.session_id,
            role,
            parts: if own_parts.is_empty() {
                fallback_parts
            } else {
                own_parts
            },
            time: MessageTime { created, completed },
            tokens: self.tokens.map(|t| TokenUsage {
                input: t.input,
                output: t.output,
                reasoning: t.reasoning,
            }),
            cost: self.cost,
            model_id: self.model_id,
            mode: self.mode,
            error: self.error.as_ref().map(error_text),
        }
    }
}

/// History endpoint row: message info plus its parts.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessageWithParts {
    pub info: WireMessage,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePartDelta {
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
    #[serde(rename = "messageID", alias = "messageId")]
    pub message_id: String,
    #[serde(rename = "partID", alias = "partId")]
    pub part_id: String,
    pub field: String,
    #[serde(default)]
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePermission {
    pub id: String,
    #[serde(rename = "sessionID", alias = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "callID", alias = "callId", default)]
    pub call_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePermissionReplied {
    #[serde(rename = "sessionID", alias = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(rename = "permissionID", alias = "permissionId")]
    pub permission_id: String,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireProvider {
    pub id: String,
    #[serde(default)]
    pub models: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireProviderList {
    #[serde(default)]
    pub providers: Vec<WireProvider>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_parses_typed_payload() {
        let raw = json!({
            "payload": {
                "type": "message.part.updated",
                "properties": {"part": {"id": "prt_1"}}
            }
        });
        let envelope: EventEnvelope = serde_json::from_value(raw).expect("parse envelope");
        assert_eq!(envelope.payload.kind, "message.part.updated");
        assert_eq!(envelope.payload.properties["part"]["id"], "prt_1");
    }

    #[test]
    fn wire_part_converts_tool_state() {
        let part: WirePart = serde_json::from_value(json!({
            "id": "prt_1",
            "messageID": "msg_1",
            "sessionID": "s1",
            "type": "tool",
            "tool": "read",
            "callID": "t1",
            "state": {
                "status": "completed",
                "input": {"path": "foo"},
                "output": "hi",
                "time": {"start": 10, "end": 30}
            }
        }))
        .expect("parse part");
        let part = part.into_part().expect("canonical part");
        let PartBody::Tool { call_id, state, .. } = part.body else {
            panic!("tool part expected");
        };
        assert_eq!(call_id, "t1");
        let ToolState::Completed { time, output, .. } = state else {
            panic!("completed expected");
        };
        assert_eq!(time.duration, 20);
        assert_eq!(output, json!("hi"));
    }

    #[test]
    fn message_uses_fallback_parts_when_empty() {
        let message: WireMessage = serde_json::from_value(json!({
            "id": "msg_1",
            "sessionID": "s1",
            "role": "assistant",
            "time": {"created": 5}
        }))
        .expect("parse message");
        let fallback = vec![Part {
            id: "prt_1".into(),
            message_id: "msg_1".into(),
            session_id: "s1".into(),
            body: PartBody::Text { text: "hi".into() },
        }];
        let converted = message.into_message(fallback.clone());
        assert_eq!(converted.parts, fallback);
        assert_eq!(converted.time.created, 5);
    }

    #[test]
    fn error_text_unwraps_nested_shapes() {
        assert_eq!(error_text(&json!("boom")), "boom");
        assert_eq!(
            error_text(&json!({"name": "X", "data": {"message": "bad"}})),
            "bad"
        );
        assert_eq!(error_text(&json!({"message": "direct"})), "direct");
    }
}
