//! WebSocket frame contracts.
//!
//! Three frame families: requests (client → server, correlated by
//! `requestId`), responses, and notifications fanned out from the engine
//! event bus. Notification payloads are shaped so one serialised frame
//! serves every subscribed client.

use agenthub_engines::EngineEvent;
use agenthub_engines::model::{ContentBlock, EngineType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Close code for a failed authentication handshake.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code sent to clients on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// First-frame authentication, as an alternative to the `?token=` query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub token: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    UnknownRequest,
    Internal,
    Engine,
    Unauthorized,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::UnknownRequest => "UNKNOWN_REQUEST",
            Self::Internal => "INTERNAL_ERROR",
            Self::Engine => "ENGINE_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

#[must_use]
pub fn response_frame(request_id: &str, payload: Value) -> Value {
    json!({"type": "response", "requestId": request_id, "payload": payload})
}

#[must_use]
pub fn error_frame(request_id: &str, code: ErrorCode, message: &str) -> Value {
    json!({
        "type": "response",
        "requestId": request_id,
        "payload": null,
        "error": {"code": code.as_str(), "message": message}
    })
}

/// Serialise an engine event as a notification frame.
#[must_use]
pub fn notification_frame(event: &EngineEvent) -> Value {
    let payload = match event {
        EngineEvent::StatusChanged {
            engine,
            state,
            error,
        } => json!({"engineType": engine, "state": state, "error": error}),
        EngineEvent::SessionCreated { session } | EngineEvent::SessionUpdated { session } => {
            json!({"session": session})
        }
        EngineEvent::SessionDeleted { engine, session_id } => {
            json!({"engineType": engine, "sessionId": session_id})
        }
        EngineEvent::MessagePartUpdated { part } => json!({"part": part}),
        EngineEvent::MessageUpdated { message } => json!({"message": message}),
        EngineEvent::PermissionAsked { permission } => json!({"permission": permission}),
        EngineEvent::PermissionReplied {
            engine,
            permission_id,
            option_id,
        } => json!({
            "engineType": engine,
            "permissionId": permission_id,
            "optionId": option_id
        }),
        EngineEvent::QuestionAsked { engine, payload }
        | EngineEvent::QuestionReplied { engine, payload }
        | EngineEvent::QuestionRejected { engine, payload } => {
            json!({"engineType": engine, "question": payload})
        }
    };
    json!({"type": event.topic(), "payload": payload})
}

// ---------------------------------------------------------------------------
// Request payloads

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePayload {
    pub engine_type: EngineType,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListPayload {
    #[serde(default)]
    pub engine_type: Option<EngineType>,
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatePayload {
    pub engine_type: EngineType,
    pub directory: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdPayload {
    pub session_id: String,
}

/// Message content: either a plain string or structured blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ContentInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ContentInput {
    #[must_use]
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::text(text)],
            Self::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSendPayload {
    pub session_id: String,
    pub content: ContentInput,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub mode_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSetPayload {
    pub session_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSetPayload {
    pub session_id: String,
    pub mode_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReplyPayload {
    pub permission_id: String,
    #[serde(default)]
    pub option_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSetEnginePayload {
    pub directory: String,
    pub engine_type: EngineType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OkPayload {
    pub ok: bool,
}

impl OkPayload {
    #[must_use]
    pub fn value() -> Value {
        json!({"ok": true})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_parses() {
        let frame: RequestFrame = serde_json::from_value(json!({
            "type": "session.create",
            "requestId": "r1",
            "payload": {"engineType": "mock", "directory": "/tmp"}
        }))
        .expect("parse frame");
        assert_eq!(frame.kind, "session.create");
        assert_eq!(frame.request_id, "r1");
        let payload: SessionCreatePayload =
            serde_json::from_value(frame.payload).expect("payload");
        assert_eq!(payload.engine_type, EngineType::from("mock"));
    }

    #[test]
    fn content_accepts_string_or_blocks() {
        let s: ContentInput = serde_json::from_value(json!("hello")).expect("string");
        assert_eq!(s.into_blocks(), vec![ContentBlock::text("hello")]);

        let b: ContentInput =
            serde_json::from_value(json!([{"type": "text", "text": "hi"}])).expect("blocks");
        assert_eq!(b.into_blocks(), vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let frame = error_frame("r9", ErrorCode::UnknownRequest, "no such request");
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["requestId"], "r9");
        assert_eq!(frame["error"]["code"], "UNKNOWN_REQUEST");
        assert_eq!(frame["error"]["message"], "no such request");
    }

    #[test]
    fn notification_frame_uses_event_topic() {
        let event = EngineEvent::SessionDeleted {
            engine: EngineType::from("mock"),
            session_id: "s1".into(),
        };
        let frame = notification_frame(&event);
        assert_eq!(frame["type"], "session.deleted");
        assert_eq!(frame["payload"]["sessionId"], "s1");
    }
}
