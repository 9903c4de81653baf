//! Wire shapes for the stdio agent protocol.
//!
//! Newline-delimited JSON-RPC 2.0. Fields are camelCase on the wire;
//! unknown fields are ignored so newer backends keep working.

use crate::model::{PermissionOptionKind, ToolLocation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// initialize

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_info: ClientInfo,
    pub client_capabilities: ClientCapabilities,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FsCapabilities,
    pub terminal: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            fs: FsCapabilities {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub agent_capabilities: AgentCapabilities,
    #[serde(default)]
    pub agent_info: Option<AgentInfo>,
    #[serde(default)]
    pub auth_methods: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub load_session: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// session lifecycle

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewParams {
    pub cwd: String,
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewResult {
    pub session_id: String,
    #[serde(default)]
    pub models: Option<ModelList>,
    #[serde(default)]
    pub modes: Option<ModeList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelList {
    #[serde(default)]
    pub available_models: Vec<WireModel>,
    #[serde(default)]
    pub current_model_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireModel {
    pub model_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeList {
    #[serde(default)]
    pub available_modes: Vec<WireMode>,
    #[serde(default)]
    pub current_mode_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResult {
    #[serde(default)]
    pub sessions: Vec<WireSession>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSession {
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLoadParams {
    pub session_id: String,
    pub cwd: String,
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// prompting

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPromptParams {
    pub session_id: String,
    pub prompt: Vec<PromptBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptBlock {
    Text {
        text: String,
    },
    ResourceLink {
        uri: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPromptResult {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

pub const STOP_REASON_CANCELLED: &str = "cancelled";

// ---------------------------------------------------------------------------
// session/update notifications

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk { content: ContentChunk },
    AgentThoughtChunk { content: ContentChunk },
    UserMessageChunk { content: ContentChunk },
    ToolCall(WireToolCall),
    ToolCallUpdate(WireToolCallUpdate),
    SessionInfoUpdate(SessionInfoUpdate),
}

/// Content chunk; only the text payload matters to the assembler.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireToolCall {
    pub call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<WireToolStatus>,
    #[serde(default)]
    pub normalized_tool: Option<String>,
    #[serde(default)]
    pub original_tool: Option<String>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub locations: Option<Vec<ToolLocation>>,
    #[serde(default)]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireToolCallUpdate {
    pub call_id: String,
    #[serde(default)]
    pub status: Option<WireToolStatus>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub locations: Option<Vec<ToolLocation>>,
    #[serde(default)]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Backends wrap tool output as `{content: …}`; unwrap it so the canonical
/// state carries the payload directly.
#[must_use]
pub fn unwrap_tool_output(raw: Value) -> Value {
    match raw {
        Value::Object(mut map) if map.contains_key("content") => {
            map.remove("content").unwrap_or(Value::Null)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// reverse requests

pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
pub const METHOD_REQUEST_PERMISSION_LEGACY: &str = "requestPermission";
pub const METHOD_FS_READ: &str = "fs/read_text_file";
pub const METHOD_FS_WRITE: &str = "fs/write_text_file";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_call: Option<PermissionToolCall>,
    #[serde(default)]
    pub options: Vec<WirePermissionOption>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionToolCall {
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub raw_input: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePermissionOption {
    pub option_id: String,
    pub kind: PermissionOptionKind,
    pub name: String,
}

/// `{outcome: {outcome: "selected", optionId}}` on a picked option.
#[must_use]
pub fn permission_outcome(option_id: Option<&str>) -> Value {
    match option_id {
        Some(id) => serde_json::json!({
            "outcome": {"outcome": "selected", "optionId": id}
        }),
        None => serde_json::json!({
            "outcome": {"outcome": "cancelled"}
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    pub path: String,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    pub path: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_update_dispatches_on_tag() {
        let n: SessionNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "update": {"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": "Hel"}}
        }))
        .expect("parse notification");
        assert_eq!(n.session_id, "s1");
        match n.update {
            SessionUpdate::AgentMessageChunk { content } => assert_eq!(content.text, "Hel"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn tool_call_update_parses_wire_shape() {
        let n: SessionNotification = serde_json::from_value(json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "tool_call_update",
                "callId": "t1",
                "status": "completed",
                "rawOutput": {"content": "hi"}
            }
        }))
        .expect("parse update");
        let SessionUpdate::ToolCallUpdate(u) = n.update else {
            panic!("wrong variant");
        };
        assert_eq!(u.call_id, "t1");
        assert_eq!(u.status, Some(WireToolStatus::Completed));
        assert_eq!(unwrap_tool_output(u.raw_output.unwrap()), json!("hi"));
    }

    #[test]
    fn permission_outcome_shapes() {
        assert_eq!(
            permission_outcome(Some("allow_once")),
            json!({"outcome": {"outcome": "selected", "optionId": "allow_once"}})
        );
        assert_eq!(
            permission_outcome(None),
            json!({"outcome": {"outcome": "cancelled"}})
        );
    }
}
