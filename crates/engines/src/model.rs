//! Canonical data model shared by all engine adapters.
//!
//! These shapes are what the gateway serialises onto the WebSocket, so all
//! field names are camelCase and enums are tagged the way front-end clients
//! expect them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies one backend family ("engine") within the process.
///
/// Adapters are registered under their engine type, and every session is
/// bound to exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineType(pub String);

impl EngineType {
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalise a directory path for routing and project identity: forward
/// slashes only, no trailing slash (except a bare root).
#[must_use]
pub fn normalize_directory(dir: &str) -> String {
    let mut normalized = dir.replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') && !normalized.ends_with(":/") {
        normalized.pop();
    }
    normalized
}

/// Placeholder title given to sessions the backend has not named yet, e.g.
/// `New session - 2024-01-01T00:00:00.000Z`.
#[must_use]
pub fn default_session_title(now_ms: i64) -> String {
    let stamp = chrono::DateTime::from_timestamp_millis(now_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    format!("New session - {stamp}")
}

/// Whether a title still matches the default pattern
/// `(New session|Child session)( - <ISO timestamp>)?` and should be replaced
/// by the title fallback after the first prompt.
#[must_use]
pub fn is_default_session_title(title: &str) -> bool {
    let title = title.trim();
    if title.is_empty() {
        return true;
    }
    let rest = ["New session", "Child session"]
        .iter()
        .find_map(|prefix| title.strip_prefix(prefix));
    match rest {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix(" - ")
            .is_some_and(|stamp| chrono::DateTime::parse_from_rfc3339(stamp).is_ok()),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
}

/// A persistent conversation bound to a directory and a single engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub engine_type: EngineType,
    /// Normalised per [`normalize_directory`]; stable once set.
    pub directory: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub time: SessionTime,
    /// Engine-specific blob, persisted opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Session {
    #[must_use]
    pub fn project_id(&self) -> String {
        format!("{}-{}", self.engine_type, normalize_directory(&self.directory))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<u64>,
}

/// One turn of a conversation: an ordered sequence of parts plus
/// annotations. `time.completed` set means terminal; no further part
/// updates follow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of message content. `id` is lexicographically sortable by
/// creation time within its message (see [`crate::ids`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PartBody {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        normalized_tool: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_tool: Option<String>,
        #[serde(default)]
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locations: Option<Vec<ToolLocation>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    File {
        mime: String,
        filename: String,
        url: String,
    },
    StepStart,
    StepFinish,
    Snapshot {
        files: Vec<String>,
    },
    Patch {
        content: String,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLocation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTimeStart {
    pub start: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTimeRange {
    pub start: i64,
    pub end: i64,
    pub duration: i64,
}

/// Tool call state machine: pending → running → (completed | error).
///
/// Once terminal, a tool part never re-enters `running`; any non-terminal
/// part still present when the enclosing message finalises is forced to
/// `completed` with a null output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    Running {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        time: ToolTimeStart,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        time: ToolTimeRange,
        #[serde(default)]
        output: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        time: ToolTimeRange,
        error: String,
    },
}

impl ToolState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    #[must_use]
    pub fn input(&self) -> Option<&Value> {
        match self {
            Self::Pending { input }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input.as_ref(),
        }
    }

    #[must_use]
    pub fn started_at(&self) -> Option<i64> {
        match self {
            Self::Pending { .. } => None,
            Self::Running { time, .. } => Some(time.start),
            Self::Completed { time, .. } | Self::Error { time, .. } => Some(time.start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Edit,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    #[serde(alias = "allow")]
    AllowOnce,
    AllowAlways,
    // Some backends send the bare short form.
    #[serde(alias = "reject")]
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub kind: PermissionOptionKind,
    pub name: String,
}

/// A reverse permission prompt emitted by a backend; lives until a client
/// replies or the backend cancels it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub session_id: String,
    pub engine_type: EngineType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub title: String,
    pub kind: PermissionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub raw_input: Value,
    pub options: Vec<PermissionOption>,
}

/// Client decision on a permission prompt. `option_id = None` dismisses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
}

/// Derived grouping of sessions by `(engineType, directory)`; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub engine_type: EngineType,
    pub directory: String,
}

impl Project {
    #[must_use]
    pub fn new(engine_type: EngineType, directory: &str) -> Self {
        let directory = normalize_directory(directory);
        Self {
            id: format!("{engine_type}-{directory}"),
            engine_type,
            directory,
        }
    }
}

/// Outbound user content for `sendMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::File { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn directory_normalisation() {
        assert_eq!(normalize_directory("C:\\work\\repo\\"), "C:/work/repo");
        assert_eq!(normalize_directory("/home/dev/project/"), "/home/dev/project");
        assert_eq!(normalize_directory("/"), "/");
    }

    #[test]
    fn part_serialises_with_type_tag() {
        let part = Part {
            id: "prt_1".into(),
            message_id: "msg_1".into(),
            session_id: "s1".into(),
            body: PartBody::Text {
                text: "hello".into(),
            },
        };
        let v = serde_json::to_value(&part).expect("serialize part");
        assert_eq!(v["type"], "text");
        assert_eq!(v["messageId"], "msg_1");
        assert_eq!(v["text"], "hello");
    }

    #[test]
    fn tool_part_fields_are_camel_case() {
        let part = Part {
            id: "prt_9".into(),
            message_id: "msg_1".into(),
            session_id: "s1".into(),
            body: PartBody::Tool {
                call_id: "t1".into(),
                normalized_tool: None,
                original_tool: None,
                title: "Read".into(),
                kind: Some("read".into()),
                state: ToolState::Pending { input: None },
                locations: None,
                diff: None,
            },
        };
        let v = serde_json::to_value(&part).expect("serialize part");
        assert_eq!(v["callId"], "t1");
        assert_eq!(v["state"]["status"], "pending");
        assert!(v.get("call_id").is_none());
    }

    #[test]
    fn step_markers_use_kebab_case() {
        let part = Part {
            id: "prt_2".into(),
            message_id: "msg_1".into(),
            session_id: "s1".into(),
            body: PartBody::StepStart,
        };
        let v = serde_json::to_value(&part).expect("serialize part");
        assert_eq!(v["type"], "step-start");
    }

    #[test]
    fn tool_state_tags_by_status() {
        let state = ToolState::Running {
            input: Some(json!({"path": "foo.rs"})),
            time: ToolTimeStart { start: 42 },
        };
        let v = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(v["status"], "running");
        assert_eq!(v["time"]["start"], 42);
        assert!(!state.is_terminal());

        let done = ToolState::Completed {
            input: None,
            time: ToolTimeRange {
                start: 42,
                end: 50,
                duration: 8,
            },
            output: Value::Null,
        };
        assert!(done.is_terminal());
    }

    #[test]
    fn project_id_is_engine_dash_directory() {
        let p = Project::new(EngineType::from("mock"), "/tmp/demo/");
        assert_eq!(p.id, "mock-/tmp/demo");
    }

    #[test]
    fn default_title_detection() {
        assert!(is_default_session_title(""));
        assert!(is_default_session_title("New session"));
        assert!(is_default_session_title("Child session"));
        assert!(is_default_session_title(&default_session_title(0)));
        assert!(is_default_session_title(
            "New session - 2024-01-01T00:00:00.000Z"
        ));
        assert!(!is_default_session_title("Fix the login bug"));
        assert!(!is_default_session_title("New session - not a date"));
        assert!(!is_default_session_title("New sessions"));
    }
}
