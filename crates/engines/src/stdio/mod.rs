//! Adapter for backends speaking newline-delimited JSON-RPC over stdio.
//!
//! The adapter supervises the child process, translates `session/update`
//! streams into the canonical part model, answers reverse requests
//! (permissions, file I/O), and keeps an activity watchdog per prompt so a
//! stuck backend can never wedge a client.

pub mod rpc;
pub mod wire;

use crate::assembler::{MessageBuffer, ToolPhase, ToolStart, ToolUpdate};
use crate::engine::{EngineAdapter, EngineCapabilities, EngineInfo, EngineState, SendOptions};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::ids;
use crate::model::{
    ContentBlock, EngineType, Message, MessageTime, ModeInfo, ModelInfo, Part, PartBody,
    Permission, PermissionKind, PermissionOption, PermissionReply, Project, Role, Session,
    SessionTime, default_session_title, normalize_directory, now_ms,
};
use crate::process;
use async_trait::async_trait;
use parking_lot::Mutex;
use rpc::{DEFAULT_RPC_TIMEOUT, Incoming, RpcClient};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub struct StdioEngineConfig {
    pub engine_type: EngineType,
    /// Display name used until the backend reports its own via `initialize`.
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Deadline for ordinary RPCs; prompts run without one.
    pub rpc_timeout: Duration,
    /// How often the activity watchdog checks an in-flight prompt.
    pub watchdog_poll: Duration,
    /// Prompt idle time after which the watchdog auto-cancels.
    pub watchdog_idle: Duration,
}

impl StdioEngineConfig {
    #[must_use]
    pub fn new(engine_type: EngineType, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            display_name: engine_type.to_string(),
            engine_type,
            command,
            args: Vec::new(),
            env: HashMap::new(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            watchdog_poll: Duration::from_secs(10),
            watchdog_idle: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
enum PromptInterrupt {
    Cancelled,
    Failed(String),
}

struct PendingPermission {
    rpc_id: Value,
    option_ids: Vec<String>,
}

struct SessionEntry {
    session: Session,
    history: Vec<Message>,
    buffer: Option<MessageBuffer>,
    /// Separate buffer for user turns streamed during history replay.
    user_buffer: Option<MessageBuffer>,
    /// Replay in progress: mutate state but suppress outbound events.
    loading: bool,
    loaded: bool,
    last_activity: Instant,
    prompt: Option<oneshot::Sender<PromptInterrupt>>,
    current_model: Option<String>,
    current_mode: Option<String>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            session,
            history: Vec::new(),
            buffer: None,
            user_buffer: None,
            loading: false,
            loaded: false,
            last_activity: Instant::now(),
            prompt: None,
            current_model: None,
            current_mode: None,
        }
    }
}

struct AgentMeta {
    name: String,
    version: Option<String>,
    load_session: bool,
}

struct Inner {
    config: StdioEngineConfig,
    events: EventBus,
    state: Mutex<EngineState>,
    rpc: Mutex<Option<Arc<RpcClient>>>,
    agent: Mutex<Option<AgentMeta>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    permissions: Mutex<HashMap<String, PendingPermission>>,
    models: Mutex<Vec<ModelInfo>>,
    modes: Mutex<Vec<ModeInfo>>,
}

pub struct StdioRpcAdapter {
    inner: Arc<Inner>,
}

impl StdioRpcAdapter {
    #[must_use]
    pub fn new(config: StdioEngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events: EventBus::new(),
                state: Mutex::new(EngineState::Stopped),
                rpc: Mutex::new(None),
                agent: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                permissions: Mutex::new(HashMap::new()),
                models: Mutex::new(Vec::new()),
                modes: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Inner {
    fn set_state(&self, next: EngineState, error: Option<String>) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.events.publish(EngineEvent::StatusChanged {
            engine: self.config.engine_type.clone(),
            state: next,
            error,
        });
    }

    fn rpc_handle(&self) -> Result<Arc<RpcClient>> {
        self.rpc
            .lock()
            .clone()
            .ok_or_else(|| EngineError::NotRunning(self.config.engine_type.to_string()))
    }

    /// Resolve a waiting `send_message` locally. Returns whether a prompt
    /// was actually in flight.
    fn interrupt_prompt(&self, session_id: &str, interrupt: PromptInterrupt) -> bool {
        let tx = {
            let mut sessions = self.sessions.lock();
            sessions.get_mut(session_id).and_then(|e| e.prompt.take())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(interrupt);
                true
            }
            None => false,
        }
    }

    async fn send_cancel(&self, session_id: &str) {
        let params = wire::SessionIdParams {
            session_id: session_id.to_string(),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        if let Ok(rpc) = self.rpc_handle()
            && let Err(e) = rpc.notify("session/cancel", params).await
        {
            tracing::debug!(session_id, error = %e, "session/cancel failed");
        }
    }

    /// Child is gone: stop, fail prompts, dismiss permissions.
    fn handle_backend_exit(&self, reason: &str) {
        *self.rpc.lock() = None;
        // A failed startup already reported `error`; keep that state.
        if *self.state.lock() != EngineState::Error {
            self.set_state(EngineState::Stopped, Some(reason.to_string()));
        }

        let session_ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in session_ids {
            self.interrupt_prompt(&id, PromptInterrupt::Failed(reason.to_string()));
        }

        let dismissed: Vec<String> = self.permissions.lock().drain().map(|(id, _)| id).collect();
        for permission_id in dismissed {
            self.events.publish(EngineEvent::PermissionReplied {
                engine: self.config.engine_type.clone(),
                permission_id,
                option_id: None,
            });
        }
    }

    // -- session/update handling ------------------------------------------

    fn handle_session_update(&self, params: Value) {
        let notification: wire::SessionNotification = match serde_json::from_value(params) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable session/update");
                return;
            }
        };

        let now = now_ms();
        let mut outbound: Vec<EngineEvent> = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(&notification.session_id) {
                // Only a session-info update may conjure a session we have
                // never seen; anything else is a stray.
                let wire::SessionUpdate::SessionInfoUpdate(ref info) = notification.update else {
                    tracing::debug!(
                        session_id = %notification.session_id,
                        "update for unknown session dropped"
                    );
                    return;
                };
                let session = Session {
                    id: notification.session_id.clone(),
                    engine_type: self.config.engine_type.clone(),
                    directory: String::new(),
                    title: info
                        .title
                        .clone()
                        .unwrap_or_else(|| default_session_title(now)),
                    parent_id: None,
                    time: SessionTime {
                        created: now,
                        updated: info.updated_at.unwrap_or(now),
                    },
                    metadata: None,
                };
                outbound.push(EngineEvent::SessionCreated {
                    session: session.clone(),
                });
                sessions.insert(notification.session_id.clone(), SessionEntry::new(session));
            }
            let entry = sessions
                .get_mut(&notification.session_id)
                .expect("session entry just ensured");

            entry.last_activity = Instant::now();
            let suppress = entry.loading;
            let streaming_allowed = entry.prompt.is_some() || entry.loading;

            match notification.update {
                wire::SessionUpdate::AgentMessageChunk { content } => {
                    if !streaming_allowed {
                        return;
                    }
                    flush_user_turn(entry, now, &mut outbound);
                    let buffer = ensure_buffer(entry, now);
                    let part = buffer.append_text(&content.text);
                    outbound.push(EngineEvent::MessagePartUpdated { part });
                }
                wire::SessionUpdate::AgentThoughtChunk { content } => {
                    if !streaming_allowed {
                        return;
                    }
                    flush_user_turn(entry, now, &mut outbound);
                    let buffer = ensure_buffer(entry, now);
                    let part = buffer.append_reasoning(&content.text);
                    outbound.push(EngineEvent::MessagePartUpdated { part });
                }
                wire::SessionUpdate::UserMessageChunk { content } => {
                    if !streaming_allowed {
                        return;
                    }
                    // A user turn ends whatever assistant turn was open.
                    if let Some(buffer) = entry.buffer.take() {
                        if buffer.is_empty() {
                            drop(buffer);
                        } else {
                            let message = buffer.finalize(now, None);
                            entry.history.push(message.clone());
                            outbound.push(EngineEvent::MessageUpdated { message });
                        }
                    }
                    let buffer = entry.user_buffer.get_or_insert_with(|| {
                        MessageBuffer::new(&notification.session_id, Role::User, now)
                    });
                    let part = buffer.append_text(&content.text);
                    outbound.push(EngineEvent::MessagePartUpdated { part });
                }
                wire::SessionUpdate::ToolCall(call) => {
                    if !streaming_allowed {
                        return;
                    }
                    flush_user_turn(entry, now, &mut outbound);
                    let buffer = ensure_buffer(entry, now);
                    let part = buffer.tool_start(tool_start_from_wire(call), now);
                    outbound.push(EngineEvent::MessagePartUpdated { part });
                }
                wire::SessionUpdate::ToolCallUpdate(update) => {
                    if !streaming_allowed {
                        return;
                    }
                    if let Some(buffer) = entry.buffer.as_mut()
                        && let Some(part) = buffer.tool_update(tool_update_from_wire(update), now)
                    {
                        outbound.push(EngineEvent::MessagePartUpdated { part });
                    }
                }
                wire::SessionUpdate::SessionInfoUpdate(info) => {
                    if let Some(title) = info.title {
                        entry.session.title = title;
                    }
                    entry.session.time.updated = info.updated_at.unwrap_or(now);
                    outbound.push(EngineEvent::SessionUpdated {
                        session: entry.session.clone(),
                    });
                }
            }

            if suppress {
                outbound.clear();
            }
        }

        for event in outbound {
            self.events.publish(event);
        }
    }

    // -- reverse requests -------------------------------------------------

    async fn handle_reverse_request(
        &self,
        rpc: &Arc<RpcClient>,
        id: Value,
        method: String,
        params: Value,
    ) {
        let result = match method.as_str() {
            wire::METHOD_REQUEST_PERMISSION | wire::METHOD_REQUEST_PERMISSION_LEGACY => {
                self.handle_permission_request(rpc, id, params).await;
                return;
            }
            wire::METHOD_FS_READ => self.handle_fs_read(params).await,
            wire::METHOD_FS_WRITE => self.handle_fs_write(params).await,
            other => {
                tracing::debug!(method = %other, "unknown reverse request");
                if let Err(e) = rpc.respond_error(id, -32601, "method not found").await {
                    tracing::debug!(error = %e, "reverse error reply failed");
                }
                return;
            }
        };

        let outcome = match result {
            Ok(value) => rpc.respond(id, value).await,
            Err(e) => rpc.respond_error(id, -32000, &e.to_string()).await,
        };
        if let Err(e) = outcome {
            tracing::debug!(method = %method, error = %e, "reverse reply failed");
        }
    }

    async fn handle_permission_request(&self, rpc: &Arc<RpcClient>, id: Value, params: Value) {
        let request: wire::PermissionRequestParams = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable permission request");
                let _ = rpc.respond_error(id, -32602, "invalid permission request").await;
                return;
            }
        };

        let session_id = request.session_id.clone().unwrap_or_default();
        let tool_call = request.tool_call.unwrap_or_default();
        let options: Vec<PermissionOption> = request
            .options
            .iter()
            .map(|o| PermissionOption {
                option_id: o.option_id.clone(),
                kind: o.kind,
                name: o.name.clone(),
            })
            .collect();

        let permission = Permission {
            id: ids::permission_id(),
            session_id: session_id.clone(),
            engine_type: self.config.engine_type.clone(),
            tool_call_id: tool_call.tool_call_id,
            title: tool_call
                .title
                .unwrap_or_else(|| "Permission request".to_string()),
            kind: permission_kind(tool_call.kind.as_deref()),
            diff: tool_call.diff,
            raw_input: tool_call.raw_input.unwrap_or(Value::Null),
            options,
        };

        // Autopilot-like modes approve without asking the client.
        let autopilot = {
            let sessions = self.sessions.lock();
            sessions.get(&session_id).is_some_and(|e| {
                e.current_mode
                    .as_deref()
                    .is_some_and(|m| m.to_ascii_lowercase().contains("autopilot"))
            })
        };
        if autopilot
            && let Some(option) = permission.options.iter().find(|o| o.kind.is_allow())
        {
            let option_id = option.option_id.clone();
            self.events.publish(EngineEvent::PermissionAsked {
                permission: permission.clone(),
            });
            if let Err(e) = rpc
                .respond(id, wire::permission_outcome(Some(&option_id)))
                .await
            {
                tracing::debug!(error = %e, "auto-approve reply failed");
            }
            self.events.publish(EngineEvent::PermissionReplied {
                engine: self.config.engine_type.clone(),
                permission_id: permission.id,
                option_id: Some(option_id),
            });
            return;
        }

        self.permissions.lock().insert(
            permission.id.clone(),
            PendingPermission {
                rpc_id: id,
                option_ids: permission
                    .options
                    .iter()
                    .map(|o| o.option_id.clone())
                    .collect(),
            },
        );
        self.events
            .publish(EngineEvent::PermissionAsked { permission });
    }

    async fn handle_fs_read(&self, params: Value) -> Result<Value> {
        let request: wire::ReadTextFileParams = serde_json::from_value(params)?;
        let content = tokio::fs::read_to_string(&request.path).await?;
        let content = match (request.line, request.limit) {
            (None, None) => content,
            (line, limit) => {
                let start = line.map_or(0, |l| l.saturating_sub(1));
                let sliced: Vec<&str> = content
                    .lines()
                    .skip(start)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                sliced.join("\n")
            }
        };
        Ok(json!({"content": content}))
    }

    async fn handle_fs_write(&self, params: Value) -> Result<Value> {
        let request: wire::WriteTextFileParams = serde_json::from_value(params)?;
        if let Some(parent) = std::path::Path::new(&request.path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&request.path, request.content.as_bytes()).await?;
        Ok(json!({"success": true}))
    }
}

fn permission_kind(kind: Option<&str>) -> PermissionKind {
    match kind {
        Some("read") => PermissionKind::Read,
        Some("edit" | "write" | "delete" | "move") => PermissionKind::Edit,
        _ => PermissionKind::Other,
    }
}

fn tool_phase(status: Option<wire::WireToolStatus>, default: ToolPhase) -> ToolPhase {
    match status {
        Some(wire::WireToolStatus::Pending) => ToolPhase::Pending,
        Some(wire::WireToolStatus::Running) => ToolPhase::Running,
        Some(wire::WireToolStatus::Completed) => ToolPhase::Completed,
        Some(wire::WireToolStatus::Failed) => ToolPhase::Failed,
        None => default,
    }
}

fn tool_start_from_wire(call: wire::WireToolCall) -> ToolStart {
    ToolStart {
        title: call.title.unwrap_or_else(|| call.call_id.clone()),
        call_id: call.call_id,
        kind: call.kind,
        normalized_tool: call.normalized_tool,
        original_tool: call.original_tool,
        input: call.raw_input,
        phase: tool_phase(call.status, ToolPhase::Pending),
        locations: call.locations,
        diff: call.diff,
    }
}

fn tool_update_from_wire(update: wire::WireToolCallUpdate) -> ToolUpdate {
    ToolUpdate {
        call_id: update.call_id,
        phase: update.status.map(|s| tool_phase(Some(s), ToolPhase::Pending)),
        title: update.title,
        input: update.raw_input,
        output: update.raw_output.map(wire::unwrap_tool_output),
        error: update.error,
        locations: update.locations,
        diff: update.diff,
    }
}

/// During replay, the first non-user update closes the open user turn.
fn flush_user_turn(entry: &mut SessionEntry, now: i64, outbound: &mut Vec<EngineEvent>) {
    if let Some(buffer) = entry.user_buffer.take() {
        if buffer.is_empty() {
            return;
        }
        let message = buffer.finalize(now, None);
        entry.history.push(message.clone());
        outbound.push(EngineEvent::MessageUpdated { message });
    }
}

fn ensure_buffer(entry: &mut SessionEntry, now: i64) -> &mut MessageBuffer {
    let session_id = entry.session.id.clone();
    entry
        .buffer
        .get_or_insert_with(|| MessageBuffer::new(&session_id, Role::Assistant, now))
}

fn spawn_watchdog(inner: Arc<Inner>, session_id: String) {
    let poll = inner.config.watchdog_poll;
    let idle = inner.config.watchdog_idle;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll).await;
            let expired = {
                let sessions = inner.sessions.lock();
                let Some(entry) = sessions.get(&session_id) else {
                    return;
                };
                if entry.prompt.is_none() {
                    return;
                }
                entry.last_activity.elapsed() >= idle
            };
            if expired {
                tracing::warn!(session_id = %session_id, "prompt produced no activity; auto-cancelling");
                inner.interrupt_prompt(&session_id, PromptInterrupt::Cancelled);
                inner.send_cancel(&session_id).await;
                return;
            }
        }
    });
}

async fn run_incoming(
    inner: Arc<Inner>,
    rpc: Arc<RpcClient>,
    mut incoming: tokio::sync::mpsc::Receiver<Incoming>,
) {
    while let Some(message) = incoming.recv().await {
        match message {
            Incoming::Notification { method, params } if method == "session/update" => {
                inner.handle_session_update(params);
            }
            Incoming::Notification { method, .. } => {
                tracing::debug!(method = %method, "ignoring backend notification");
            }
            Incoming::Request { id, method, params } => {
                inner.handle_reverse_request(&rpc, id, method, params).await;
            }
            Incoming::Response { id, outcome } => rpc.complete(id, outcome),
            Incoming::Closed => {
                tracing::warn!(engine = %inner.config.engine_type, "backend process exited");
                inner.handle_backend_exit("Agent process exited");
                return;
            }
        }
    }
}

fn user_message_from_content(session_id: &str, content: &[ContentBlock], now: i64) -> Message {
    let message_id = ids::message_id();
    let parts = content
        .iter()
        .map(|block| Part {
            id: ids::part_id(),
            message_id: message_id.clone(),
            session_id: session_id.to_string(),
            body: match block {
                ContentBlock::Text { text } => PartBody::Text { text: text.clone() },
                ContentBlock::File {
                    mime,
                    url,
                    filename,
                } => PartBody::File {
                    mime: mime.clone(),
                    filename: filename.clone().unwrap_or_default(),
                    url: url.clone(),
                },
            },
        })
        .collect();
    Message {
        id: message_id,
        session_id: session_id.to_string(),
        role: Role::User,
        parts,
        time: MessageTime {
            created: now,
            completed: Some(now),
        },
        tokens: None,
        cost: None,
        model_id: None,
        mode: None,
        error: None,
    }
}

fn prompt_blocks(content: &[ContentBlock]) -> Vec<wire::PromptBlock> {
    content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => wire::PromptBlock::Text { text: text.clone() },
            ContentBlock::File {
                mime,
                url,
                filename,
            } => wire::PromptBlock::ResourceLink {
                uri: url.clone(),
                mime_type: mime.clone(),
                name: filename.clone(),
            },
        })
        .collect()
}

#[async_trait]
impl EngineAdapter for StdioRpcAdapter {
    fn engine_type(&self) -> EngineType {
        self.inner.config.engine_type.clone()
    }

    fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    fn capabilities(&self) -> EngineCapabilities {
        let load_session = self
            .inner
            .agent
            .lock()
            .as_ref()
            .is_some_and(|a| a.load_session);
        EngineCapabilities {
            load_session,
            list_sessions: true,
            models: !self.inner.models.lock().is_empty(),
            modes: !self.inner.modes.lock().is_empty(),
        }
    }

    fn info(&self) -> EngineInfo {
        let agent = self.inner.agent.lock();
        EngineInfo {
            engine_type: self.inner.config.engine_type.clone(),
            name: agent
                .as_ref()
                .map_or_else(|| self.inner.config.display_name.clone(), |a| a.name.clone()),
            version: agent.as_ref().and_then(|a| a.version.clone()),
            state: self.state(),
            capabilities: self.capabilities(),
        }
    }

    fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    async fn start(&self) -> Result<()> {
        if self.state() == EngineState::Running {
            return Ok(());
        }
        self.inner.set_state(EngineState::Starting, None);

        let cmd = process::backend_command(
            &self.inner.config.command,
            &self.inner.config.args,
            &self.inner.config.env,
            None,
        );
        let spawned = RpcClient::spawn(cmd);
        let (rpc, incoming) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.set_state(EngineState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        // The incoming loop must run before the first request: responses
        // are delivered through it.
        tokio::spawn(run_incoming(
            Arc::clone(&self.inner),
            Arc::clone(&rpc),
            incoming,
        ));

        let init = wire::InitializeParams {
            protocol_version: wire::PROTOCOL_VERSION,
            client_info: wire::ClientInfo {
                name: "agenthub".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            client_capabilities: wire::ClientCapabilities::default(),
        };
        let response = rpc
            .request(
                "initialize",
                serde_json::to_value(init)?,
                Some(self.inner.config.rpc_timeout),
            )
            .await;
        let result: wire::InitializeResult = match response.and_then(|v| {
            serde_json::from_value(v).map_err(EngineError::from)
        }) {
            Ok(r) => r,
            Err(e) => {
                rpc.shutdown().await;
                self.inner.set_state(EngineState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        *self.inner.agent.lock() = Some(AgentMeta {
            name: result
                .agent_info
                .as_ref()
                .map_or_else(|| self.inner.config.display_name.clone(), |a| a.name.clone()),
            version: result.agent_info.and_then(|a| a.version),
            load_session: result.agent_capabilities.load_session,
        });
        *self.inner.rpc.lock() = Some(rpc);

        self.inner.set_state(EngineState::Running, None);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let rpc = self.inner.rpc.lock().take();
        let Some(rpc) = rpc else {
            self.inner.set_state(EngineState::Stopped, None);
            return Ok(());
        };
        rpc.shutdown().await;
        self.inner.handle_backend_exit("Engine stopped");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.inner.rpc_handle() {
            Ok(rpc) => Ok(rpc.is_alive().await),
            Err(_) => Ok(false),
        }
    }

    async fn list_sessions(&self, directory: Option<&str>) -> Result<Vec<Session>> {
        let rpc = self.inner.rpc_handle()?;
        let params = wire::SessionListParams {
            cwd: directory.map(normalize_directory),
        };
        let response = rpc
            .request(
                "session/list",
                serde_json::to_value(params)?,
                Some(self.inner.config.rpc_timeout),
            )
            .await;

        match response {
            Ok(value) => {
                let listed: wire::SessionListResult = serde_json::from_value(value)?;
                let now = now_ms();
                let mut sessions = Vec::with_capacity(listed.sessions.len());
                let mut mirror = self.inner.sessions.lock();
                for remote in listed.sessions {
                    let directory = remote
                        .cwd
                        .as_deref()
                        .or(directory)
                        .map(normalize_directory)
                        .unwrap_or_default();
                    let entry = mirror
                        .entry(remote.session_id.clone())
                        .or_insert_with(|| {
                            SessionEntry::new(Session {
                                id: remote.session_id.clone(),
                                engine_type: self.inner.config.engine_type.clone(),
                                directory: directory.clone(),
                                title: String::new(),
                                parent_id: None,
                                time: SessionTime {
                                    created: remote.created_at.unwrap_or(now),
                                    updated: remote.updated_at.unwrap_or(now),
                                },
                                metadata: None,
                            })
                        });
                    if let Some(title) = remote.title {
                        entry.session.title = title;
                    }
                    if let Some(updated) = remote.updated_at {
                        entry.session.time.updated = updated;
                    }
                    sessions.push(entry.session.clone());
                }
                Ok(sessions)
            }
            // Backend without session listing: serve the in-memory mirror.
            Err(EngineError::Rpc { code: -32601, .. }) => {
                let mirror = self.inner.sessions.lock();
                let wanted = directory.map(normalize_directory);
                Ok(mirror
                    .values()
                    .filter(|e| {
                        wanted
                            .as_deref()
                            .is_none_or(|dir| e.session.directory == dir)
                    })
                    .map(|e| e.session.clone())
                    .collect())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_session(&self, directory: &str) -> Result<Session> {
        let rpc = self.inner.rpc_handle()?;
        let directory = normalize_directory(directory);
        let params = wire::SessionNewParams {
            cwd: directory.clone(),
            mcp_servers: Vec::new(),
        };
        let value = rpc
            .request(
                "session/new",
                serde_json::to_value(params)?,
                Some(self.inner.config.rpc_timeout),
            )
            .await?;
        let result: wire::SessionNewResult = serde_json::from_value(value)?;

        let now = now_ms();
        let session = Session {
            id: result.session_id.clone(),
            engine_type: self.inner.config.engine_type.clone(),
            directory,
            title: default_session_title(now),
            parent_id: None,
            time: SessionTime {
                created: now,
                updated: now,
            },
            metadata: None,
        };

        let mut entry = SessionEntry::new(session.clone());
        if let Some(models) = result.models {
            entry.current_model = models.current_model_id.clone();
            *self.inner.models.lock() = models
                .available_models
                .into_iter()
                .map(|m| ModelInfo {
                    id: m.model_id,
                    name: m.name,
                })
                .collect();
        }
        if let Some(modes) = result.modes {
            entry.current_mode = modes.current_mode_id.clone();
            *self.inner.modes.lock() = modes
                .available_modes
                .into_iter()
                .map(|m| ModeInfo {
                    id: m.id,
                    name: m.name,
                })
                .collect();
        }
        entry.loaded = true;
        self.inner
            .sessions
            .lock()
            .insert(result.session_id, entry);

        self.inner.events.publish(EngineEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self
            .inner
            .sessions
            .lock()
            .get(session_id)
            .map(|e| e.session.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let removed = self.inner.sessions.lock().remove(session_id);
        if removed.is_none() {
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }

        if let Ok(rpc) = self.inner.rpc_handle() {
            let params = serde_json::to_value(wire::SessionIdParams {
                session_id: session_id.to_string(),
            })?;
            if let Err(e) = rpc
                .request("session/delete", params, Some(self.inner.config.rpc_timeout))
                .await
            {
                tracing::debug!(session_id, error = %e, "session/delete failed");
            }
        }

        self.inner.events.publish(EngineEvent::SessionDeleted {
            engine: self.inner.config.engine_type.clone(),
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
        options: SendOptions,
    ) -> Result<Message> {
        let rpc = self.inner.rpc_handle()?;
        let now = now_ms();
        let user_message = user_message_from_content(session_id, &content, now);

        let (done_tx, done_rx) = oneshot::channel();
        let (model_id, mode_id) = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            if entry.prompt.is_some() {
                return Err(EngineError::Protocol(
                    "a prompt is already running for this session".to_string(),
                ));
            }
            entry.history.push(user_message.clone());
            entry.buffer = Some(MessageBuffer::new(session_id, Role::Assistant, now));
            entry.prompt = Some(done_tx);
            entry.last_activity = Instant::now();
            entry.session.time.updated = now;
            if let Some(model) = &options.model_id {
                entry.current_model = Some(model.clone());
            }
            if let Some(mode) = &options.mode_id {
                entry.current_mode = Some(mode.clone());
            }
            (entry.current_model.clone(), entry.current_mode.clone())
        };
        self.inner.events.publish(EngineEvent::MessageUpdated {
            message: user_message,
        });

        spawn_watchdog(Arc::clone(&self.inner), session_id.to_string());

        let params = wire::SessionPromptParams {
            session_id: session_id.to_string(),
            prompt: prompt_blocks(&content),
            model_id,
            mode_id,
        };
        // No RPC deadline: the watchdog owns prompt liveness.
        let prompt_fut = rpc.request("session/prompt", serde_json::to_value(&params)?, None);
        tokio::pin!(prompt_fut);

        let (error, failure): (Option<String>, Option<EngineError>) = tokio::select! {
            outcome = &mut prompt_fut => match outcome {
                Ok(value) => {
                    let result: wire::SessionPromptResult =
                        serde_json::from_value(value).unwrap_or_default();
                    if result.stop_reason.as_deref() == Some(wire::STOP_REASON_CANCELLED) {
                        (Some("Cancelled".to_string()), None)
                    } else {
                        (None, None)
                    }
                }
                Err(e @ EngineError::Rpc { .. }) => (Some(e.to_string()), Some(e)),
                Err(e) => (Some(e.to_string()), None),
            },
            interrupt = done_rx => match interrupt {
                Ok(PromptInterrupt::Cancelled) => (Some("Cancelled".to_string()), None),
                Ok(PromptInterrupt::Failed(reason)) => (Some(reason), None),
                Err(_) => (Some("Prompt interrupted".to_string()), None),
            },
        };

        let finished = now_ms();
        let message = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            entry.prompt = None;
            let buffer = entry
                .buffer
                .take()
                .unwrap_or_else(|| MessageBuffer::new(session_id, Role::Assistant, finished));
            let message = buffer.finalize(finished, error);
            entry.history.push(message.clone());
            entry.session.time.updated = finished;
            message
        };
        self.inner.events.publish(EngineEvent::MessageUpdated {
            message: message.clone(),
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(message),
        }
    }

    async fn cancel_message(&self, session_id: &str) -> Result<()> {
        // Resolve the caller first; the backend hears about it after.
        self.inner
            .interrupt_prompt(session_id, PromptInterrupt::Cancelled);
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            inner.send_cancel(&session_id).await;
        });
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let should_load = {
            let sessions = self.inner.sessions.lock();
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            let supported = self
                .inner
                .agent
                .lock()
                .as_ref()
                .is_some_and(|a| a.load_session);
            supported && !entry.loaded && entry.history.is_empty()
        };

        if should_load {
            let params = {
                let mut sessions = self.inner.sessions.lock();
                let entry = sessions
                    .get_mut(session_id)
                    .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
                entry.loading = true;
                wire::SessionLoadParams {
                    session_id: session_id.to_string(),
                    cwd: entry.session.directory.clone(),
                    mcp_servers: Vec::new(),
                }
            };

            let rpc = self.inner.rpc_handle()?;
            let outcome = rpc
                .request(
                    "session/load",
                    serde_json::to_value(params)?,
                    Some(self.inner.config.rpc_timeout),
                )
                .await;

            let now = now_ms();
            let mut sessions = self.inner.sessions.lock();
            if let Some(entry) = sessions.get_mut(session_id) {
                // Replay is done (or failed): close out whatever is open.
                if let Some(buffer) = entry.user_buffer.take()
                    && !buffer.is_empty()
                {
                    entry.history.push(buffer.finalize(now, None));
                }
                if let Some(buffer) = entry.buffer.take()
                    && !buffer.is_empty()
                {
                    entry.history.push(buffer.finalize(now, None));
                }
                entry.loading = false;
                entry.loaded = true;
            }
            if let Err(e) = outcome {
                tracing::warn!(session_id, error = %e, "session/load failed");
            }
        }

        let sessions = self.inner.sessions.lock();
        Ok(sessions
            .get(session_id)
            .map(|e| e.history.clone())
            .unwrap_or_default())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.inner.models.lock().clone())
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        entry.current_model = Some(model_id.to_string());
        Ok(())
    }

    async fn get_modes(&self) -> Result<Vec<ModeInfo>> {
        Ok(self.inner.modes.lock().clone())
    }

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        entry.current_mode = Some(mode_id.to_string());
        Ok(())
    }

    async fn reply_permission(&self, permission_id: &str, reply: PermissionReply) -> Result<()> {
        let pending = self
            .inner
            .permissions
            .lock()
            .remove(permission_id)
            .ok_or_else(|| EngineError::NotFound(format!("permission {permission_id}")))?;

        if let Some(option_id) = &reply.option_id
            && !pending.option_ids.iter().any(|o| o == option_id)
        {
            // Put it back; the prompt is still unanswered.
            self.inner
                .permissions
                .lock()
                .insert(permission_id.to_string(), pending);
            return Err(EngineError::Protocol(format!(
                "unknown permission option {option_id}"
            )));
        }

        let rpc = self.inner.rpc_handle()?;
        rpc.respond(
            pending.rpc_id,
            wire::permission_outcome(reply.option_id.as_deref()),
        )
        .await?;

        self.inner.events.publish(EngineEvent::PermissionReplied {
            engine: self.inner.config.engine_type.clone(),
            permission_id: permission_id.to_string(),
            option_id: reply.option_id,
        });
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let sessions = self.inner.sessions.lock();
        let mut seen = std::collections::HashSet::new();
        let mut projects = Vec::new();
        for entry in sessions.values() {
            if entry.session.directory.is_empty() {
                continue;
            }
            let project = Project::new(
                self.inner.config.engine_type.clone(),
                &entry.session.directory,
            );
            if seen.insert(project.id.clone()) {
                projects.push(project);
            }
        }
        Ok(projects)
    }
}
