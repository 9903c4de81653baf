//! The uniform contract every backend adapter implements.

use crate::error::Result;
use crate::events::EventBus;
use crate::model::{
    ContentBlock, EngineType, Message, ModeInfo, ModelInfo, PermissionReply, Project, Session,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Error,
}

/// What the backend advertised (or the adapter knows) it can do.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCapabilities {
    /// Backend can replay prior session history (`session/load`).
    #[serde(default)]
    pub load_session: bool,
    /// Backend can enumerate sessions for a directory.
    #[serde(default)]
    pub list_sessions: bool,
    #[serde(default)]
    pub models: bool,
    #[serde(default)]
    pub modes: bool,
}

/// Summary row for `engine.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub engine_type: EngineType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub state: EngineState,
    pub capabilities: EngineCapabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_id: Option<String>,
}

/// One backend behind the canonical streaming model.
///
/// Implementations own the backend process (where there is one), the live
/// session mirrors and message histories, and publish every observable
/// change on their [`EventBus`]. All operations are safe to call
/// concurrently; mutable state is guarded internally and never held across
/// I/O.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Current lifecycle state (non-blocking).
    fn state(&self) -> EngineState;

    fn capabilities(&self) -> EngineCapabilities;

    fn info(&self) -> EngineInfo;

    /// Handle for subscribing to this adapter's events.
    fn events(&self) -> EventBus;

    /// Bring the adapter to `running`. Idempotent; emits `status.changed`.
    async fn start(&self) -> Result<()>;

    /// Tear down the backend. Idempotent; cancels pending RPCs with a
    /// terminal error and emits `status.changed`.
    async fn stop(&self) -> Result<()>;

    /// Non-mutating liveness probe.
    async fn health_check(&self) -> Result<bool>;

    /// Sessions known to this engine, optionally filtered by directory.
    async fn list_sessions(&self, directory: Option<&str>) -> Result<Vec<Session>>;

    async fn create_session(&self, directory: &str) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Run one prompt turn. Streams `message.part.updated` /
    /// `message.updated` while executing and resolves with the final
    /// assistant message. The returned message always carries
    /// `time.completed`, even on cancellation, timeout, or backend death.
    async fn send_message(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
        options: SendOptions,
    ) -> Result<Message>;

    /// Unblock the in-flight `send_message` for this session quickly;
    /// best-effort tells the backend to stop.
    async fn cancel_message(&self, session_id: &str) -> Result<()>;

    /// Full history for a session, lazily loading from the backend when it
    /// supports replay.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()>;

    async fn get_modes(&self) -> Result<Vec<ModeInfo>>;

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()>;

    /// Forward a client decision for a pending permission prompt.
    /// Fails with `NotFound` if the permission was already answered.
    async fn reply_permission(&self, permission_id: &str, reply: PermissionReply) -> Result<()>;

    /// This adapter's view of projects (derived from its sessions).
    async fn list_projects(&self) -> Result<Vec<Project>>;
}
