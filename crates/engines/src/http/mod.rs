//! Adapter for backends exposing REST plus a global server-sent-event
//! stream, optionally supervising the backend server process.
//!
//! All streaming state flows through the `/global/event` stream: parts,
//! part field deltas, message and session updates, permissions, questions.
//! Prompt completion is observed there rather than on the POST response, so
//! a per-session pending record bridges `send_message` and the stream.

pub mod api;
pub mod server;
pub mod wire;

use crate::engine::{EngineAdapter, EngineCapabilities, EngineInfo, EngineState, SendOptions};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::ids;
use crate::model::{
    ContentBlock, EngineType, Message, MessageTime, ModeInfo, ModelInfo, Part, PartBody,
    Permission, PermissionKind, PermissionOption, PermissionOptionKind, PermissionReply, Project,
    Role, Session, normalize_directory, now_ms,
};
use api::HttpApiClient;
use async_trait::async_trait;
use futures::StreamExt as _;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub engine_type: EngineType,
    pub display_name: String,
    /// Attach to an already-running backend instead of spawning one.
    pub base_url: Option<String>,
    /// Server command; `{port}` in args is substituted before spawning.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub preferred_port: u16,
    pub port_search_range: u16,
    pub start_timeout: Duration,
    /// Hard deadline for one prompt turn.
    pub message_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl HttpEngineConfig {
    #[must_use]
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            display_name: engine_type.to_string(),
            engine_type,
            base_url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            preferred_port: 4096,
            port_search_range: 10,
            start_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(300),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

struct PendingSend {
    tx: oneshot::Sender<Message>,
    created: i64,
    /// Assistant message id, learned from the first `message.updated`.
    message_id: Option<String>,
    /// Parts observed while this send was in flight, newest state per id.
    parts: Vec<Part>,
    /// Latest assistant message info seen on the stream.
    info: Option<Message>,
}

struct Inner {
    config: HttpEngineConfig,
    events: EventBus,
    http: reqwest::Client,
    state: Mutex<EngineState>,
    api: Mutex<Option<HttpApiClient>>,
    sessions: Mutex<HashMap<String, Session>>,
    session_models: Mutex<HashMap<String, String>>,
    session_modes: Mutex<HashMap<String, String>>,
    /// Sessions whose stream events are dropped until the next send.
    cancelled: Mutex<HashSet<String>>,
    part_cache: Mutex<HashMap<String, Part>>,
    pending: Mutex<HashMap<String, PendingSend>>,
    permissions: Mutex<HashSet<String>>,
    models: Mutex<Vec<ModelInfo>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

pub struct HttpStreamAdapter {
    inner: Arc<Inner>,
}

impl HttpStreamAdapter {
    #[must_use]
    pub fn new(config: HttpEngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events: EventBus::new(),
                http: reqwest::Client::new(),
                state: Mutex::new(EngineState::Stopped),
                api: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                session_models: Mutex::new(HashMap::new()),
                session_modes: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
                part_cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                permissions: Mutex::new(HashSet::new()),
                models: Mutex::new(Vec::new()),
                shutdown: Mutex::new(None),
            }),
        }
    }
}

fn permission_kind(kind: Option<&str>) -> PermissionKind {
    match kind {
        Some("read") => PermissionKind::Read,
        Some("edit" | "write" | "delete" | "move" | "patch") => PermissionKind::Edit,
        _ => PermissionKind::Other,
    }
}

fn standard_permission_options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: "once".to_string(),
            kind: PermissionOptionKind::AllowOnce,
            name: "Allow once".to_string(),
        },
        PermissionOption {
            option_id: "always".to_string(),
            kind: PermissionOptionKind::AllowAlways,
            name: "Always allow".to_string(),
        },
        PermissionOption {
            option_id: "reject".to_string(),
            kind: PermissionOptionKind::RejectOnce,
            name: "Reject".to_string(),
        },
    ]
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

    fn api_handle(&self) -> Result<HttpApiClient> {
        self.api
            .lock()
            .clone()
            .ok_or_else(|| EngineError::NotRunning(self.config.engine_type.to_string()))
    }

    fn api_for_session(&self, session_id: &str) -> Result<HttpApiClient> {
        let api = self.api_handle()?;
        let directory = self
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.directory.clone());
        match directory {
            Some(dir) if !dir.is_empty() => Ok(api.with_directory(&dir)),
            _ => Ok(api),
        }
    }

    fn is_cancelled(&self, session_id: &str) -> bool {
        self.cancelled.lock().contains(session_id)
    }

    /// Resolve the session's pending send (if any) into a terminal message
    /// and hand it to the waiting caller. Returns the message.
    fn complete_pending(&self, session_id: &str, error: Option<String>) -> Option<Message> {
        let record = self.pending.lock().remove(session_id)?;
        let now = now_ms();
        let PendingSend {
            tx,
            created,
            message_id,
            parts,
            info,
        } = record;

        let parts_for = |id: &str| -> Vec<Part> {
            parts
                .iter()
                .filter(|p| p.message_id == id)
                .cloned()
                .collect()
        };

        let message = match info {
            Some(mut info) => {
                if info.parts.is_empty() {
                    info.parts = parts_for(&info.id);
                }
                if info.time.completed.is_none() {
                    info.time.completed = Some(now);
                }
                if info.error.is_none() {
                    info.error = error;
                }
                info
            }
            None => {
                let id = message_id.unwrap_or_else(ids::message_id);
                let parts = parts_for(&id);
                Message {
                    id,
                    session_id: session_id.to_string(),
                    role: Role::Assistant,
                    parts,
                    time: MessageTime {
                        created,
                        completed: Some(now),
                    },
                    tokens: None,
                    cost: None,
                    model_id: None,
                    mode: None,
                    error,
                }
            }
        };

        let _ = tx.send(message.clone());
        Some(message)
    }

    fn fail_all_pending(&self, reason: &str) {
        let session_ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        for id in session_ids {
            self.complete_pending(&id, Some(reason.to_string()));
        }
    }

    fn handle_backend_exit(&self, reason: &str) {
        self.set_state(EngineState::Stopped, Some(reason.to_string()));
        *self.api.lock() = None;
        self.fail_all_pending(reason);
        let dismissed: Vec<String> = self.permissions.lock().drain().collect();
        for permission_id in dismissed {
            self.events.publish(EngineEvent::PermissionReplied {
                engine: self.config.engine_type.clone(),
                permission_id,
                option_id: None,
            });
        }
    }

    // -- stream handling --------------------------------------------------

    fn handle_stream_frame(&self, data: &str) {
        let envelope: wire::EventEnvelope = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "invalid event frame");
                return;
            }
        };
        let kind = envelope.payload.kind;
        let props = envelope.payload.properties;

        match kind.as_str() {
            "message.part.updated" => self.on_part_updated(props),
            "message.part.delta" => self.on_part_delta(props),
            "message.updated" => self.on_message_updated(props),
            "session.created" | "session.updated" => self.on_session_event(&kind, props),
            "session.deleted" => self.on_session_deleted(props),
            "permission.asked" | "permission.updated" => self.on_permission_asked(props),
            "permission.replied" => self.on_permission_replied(props),
            "question.asked" => self.events.publish(EngineEvent::QuestionAsked {
                engine: self.config.engine_type.clone(),
                payload: props,
            }),
            "question.replied" => self.events.publish(EngineEvent::QuestionReplied {
                engine: self.config.engine_type.clone(),
                payload: props,
            }),
            "question.rejected" => self.events.publish(EngineEvent::QuestionRejected {
                engine: self.config.engine_type.clone(),
                payload: props,
            }),
            other => tracing::debug!(kind = %other, "ignoring event"),
        }
    }

    fn on_part_updated(&self, props: Value) {
        let Some(raw) = props.get("part").cloned() else {
            return;
        };
        let wire_part: wire::WirePart = match serde_json::from_value(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "invalid part payload");
                return;
            }
        };
        if self.is_cancelled(&wire_part.session_id) {
            return;
        }
        let Some(part) = wire_part.into_part() else {
            return;
        };

        self.part_cache
            .lock()
            .insert(part.id.clone(), part.clone());
        self.track_pending_part(&part);

        let step_finished = matches!(part.body, PartBody::StepFinish);
        let session_id = part.session_id.clone();
        let message_id = part.message_id.clone();
        self.events.publish(EngineEvent::MessagePartUpdated { part });

        // A step-finish inside the pending assistant message ends the turn.
        if step_finished {
            let matches_pending = self
                .pending
                .lock()
                .get(&session_id)
                .is_some_and(|p| p.message_id.as_deref() == Some(message_id.as_str()));
            if matches_pending {
                self.complete_pending(&session_id, None);
            }
        }
    }

    fn on_part_delta(&self, props: Value) {
        let delta: wire::WirePartDelta = match serde_json::from_value(props) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "invalid part delta");
                return;
            }
        };
        if self.is_cancelled(&delta.session_id) {
            return;
        }

        let updated = {
            let mut cache = self.part_cache.lock();
            let Some(part) = cache.get_mut(&delta.part_id) else {
                tracing::debug!(part_id = %delta.part_id, "delta for unknown part");
                return;
            };
            if delta.field == "text" {
                match &mut part.body {
                    PartBody::Text { text } | PartBody::Reasoning { text } => {
                        text.push_str(&delta.delta);
                    }
                    _ => {
                        tracing::debug!(part_id = %delta.part_id, "text delta for non-text part");
                        return;
                    }
                }
            } else {
                tracing::debug!(field = %delta.field, "unsupported delta field");
                return;
            }
            part.clone()
        };

        self.track_pending_part(&updated);
        self.events
            .publish(EngineEvent::MessagePartUpdated { part: updated });
    }

    fn track_pending_part(&self, part: &Part) {
        let mut pending = self.pending.lock();
        if let Some(record) = pending.get_mut(&part.session_id) {
            match record.parts.iter_mut().find(|p| p.id == part.id) {
                Some(existing) => *existing = part.clone(),
                None => record.parts.push(part.clone()),
            }
        }
    }

    fn on_message_updated(&self, props: Value) {
        let Some(raw) = props.get("info").cloned() else {
            return;
        };
        let wire_message: wire::WireMessage = match serde_json::from_value(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "invalid message payload");
                return;
            }
        };
        if self.is_cancelled(&wire_message.session_id) {
            return;
        }

        let assistant = wire_message.is_assistant();
        let terminal = wire_message.is_terminal();
        let session_id = wire_message.session_id.clone();
        let message_id = wire_message.id.clone();

        let collected: Vec<Part> = self
            .pending
            .lock()
            .get(&session_id)
            .map(|p| {
                p.parts
                    .iter()
                    .filter(|part| part.message_id == message_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let message = wire_message.into_message(collected);

        if assistant {
            let mut pending = self.pending.lock();
            if let Some(record) = pending.get_mut(&session_id) {
                record.message_id = Some(message_id.clone());
                record.info = Some(message.clone());
            }
        }

        self.events.publish(EngineEvent::MessageUpdated {
            message: message.clone(),
        });

        if terminal {
            self.part_cache
                .lock()
                .retain(|_, p| p.message_id != message_id);
            if assistant {
                self.complete_pending(&session_id, None);
            }
        }
    }

    fn on_session_event(&self, kind: &str, props: Value) {
        let Some(raw) = props.get("info").cloned() else {
            return;
        };
        let wire_session: wire::WireSession = match serde_json::from_value(raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "invalid session payload");
                return;
            }
        };
        let fallback = self
            .sessions
            .lock()
            .get(&wire_session.id)
            .map(|s| s.directory.clone())
            .unwrap_or_default();
        let session = wire_session.into_session(self.config.engine_type.clone(), &fallback);
        self.sessions
            .lock()
            .insert(session.id.clone(), session.clone());

        let event = if kind == "session.created" {
            EngineEvent::SessionCreated { session }
        } else {
            EngineEvent::SessionUpdated { session }
        };
        self.events.publish(event);
    }

    fn on_session_deleted(&self, props: Value) {
        let id = props
            .get("info")
            .and_then(|i| i.get("id"))
            .or_else(|| props.get("sessionID"))
            .and_then(Value::as_str);
        let Some(id) = id else { return };
        self.sessions.lock().remove(id);
        self.cancelled.lock().remove(id);
        self.events.publish(EngineEvent::SessionDeleted {
            engine: self.config.engine_type.clone(),
            session_id: id.to_string(),
        });
    }

    fn on_permission_asked(&self, props: Value) {
        let wire_permission: wire::WirePermission = match serde_json::from_value(props) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "invalid permission payload");
                return;
            }
        };
        self.permissions.lock().insert(wire_permission.id.clone());
        let permission = Permission {
            id: wire_permission.id,
            session_id: wire_permission.session_id,
            engine_type: self.config.engine_type.clone(),
            tool_call_id: wire_permission.call_id,
            title: wire_permission.title.unwrap_or_else(|| "Permission request".to_string()),
            kind: permission_kind(wire_permission.kind.as_deref()),
            diff: None,
            raw_input: wire_permission.metadata.unwrap_or(Value::Null),
            options: standard_permission_options(),
        };
        self.events
            .publish(EngineEvent::PermissionAsked { permission });
    }

    fn on_permission_replied(&self, props: Value) {
        let replied: wire::WirePermissionReplied = match serde_json::from_value(props) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "invalid permission reply payload");
                return;
            }
        };
        self.permissions.lock().remove(&replied.permission_id);
        self.events.publish(EngineEvent::PermissionReplied {
            engine: self.config.engine_type.clone(),
            permission_id: replied.permission_id,
            option_id: replied.response,
        });
    }
}

async fn run_event_loop(inner: Arc<Inner>, api: HttpApiClient, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => return,
            s = api.event_stream() => s,
        };

        match stream {
            Ok(mut stream) => {
                tracing::debug!(engine = %inner.config.engine_type, "event stream connected");
                loop {
                    let frame = tokio::select! {
                        () = shutdown.cancelled() => return,
                        f = stream.next() => f,
                    };
                    match frame {
                        Some(Ok(sse)) => {
                            let Some(data) = sse.data else { continue };
                            if data.trim().is_empty() {
                                continue;
                            }
                            inner.handle_stream_frame(&data);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "event stream error");
                            break;
                        }
                        None => {
                            tracing::debug!("event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "event stream connect failed");
            }
        }

        if *inner.state.lock() != EngineState::Running {
            return;
        }
        tokio::time::sleep(inner.config.reconnect_delay).await;
    }
}

fn message_body(
    content: &[ContentBlock],
    model_id: Option<&str>,
    mode_id: Option<&str>,
) -> Value {
    let parts: Vec<Value> = content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::File {
                mime,
                url,
                filename,
            } => json!({"type": "file", "mime": mime, "url": url, "filename": filename}),
        })
        .collect();
    let mut body = json!({"parts": parts});
    if let Some(model) = model_id {
        body["modelID"] = json!(model);
    }
    if let Some(mode) = mode_id {
        body["mode"] = json!(mode);
    }
    body
}

#[async_trait]
impl EngineAdapter for HttpStreamAdapter {
    fn engine_type(&self) -> EngineType {
        self.inner.config.engine_type.clone()
    }

    fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            load_session: true,
            list_sessions: true,
            models: !self.inner.models.lock().is_empty(),
            modes: false,
        }
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            engine_type: self.inner.config.engine_type.clone(),
            name: self.inner.config.display_name.clone(),
            version: None,
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
        let shutdown = CancellationToken::new();

        let outcome: Result<HttpApiClient> = async {
            let base_url = if let Some(url) = &self.inner.config.base_url {
                url.clone()
            } else {
                let command = self.inner.config.command.clone().ok_or_else(|| {
                    EngineError::Unsupported(
                        "http engine needs either baseUrl or a command".to_string(),
                    )
                })?;
                match server::acquire_port(
                    &self.inner.http,
                    self.inner.config.preferred_port,
                    self.inner.config.port_search_range,
                )
                .await?
                {
                    server::PortPlan::Attach { port } => format!("http://127.0.0.1:{port}"),
                    server::PortPlan::Spawn { port } => {
                        let (managed, watcher) = server::spawn_server(
                            &command,
                            &self.inner.config.args,
                            &self.inner.config.env,
                            port,
                            self.inner.config.start_timeout,
                            &self.inner.http,
                            shutdown.clone(),
                        )
                        .await?;
                        let inner = Arc::clone(&self.inner);
                        let token = shutdown.clone();
                        tokio::spawn(async move {
                            watcher.await;
                            if !token.is_cancelled() {
                                inner.handle_backend_exit("Backend process exited");
                            }
                        });
                        managed.base_url
                    }
                }
            };

            let api = HttpApiClient::new(self.inner.http.clone(), base_url);
            let providers = api.probe().await?;
            let mut models = Vec::new();
            for provider in providers.providers {
                for model_id in provider.models.keys() {
                    models.push(ModelInfo {
                        id: format!("{}/{model_id}", provider.id),
                        name: None,
                    });
                }
            }
            *self.inner.models.lock() = models;
            Ok(api)
        }
        .await;

        match outcome {
            Ok(api) => {
                *self.inner.api.lock() = Some(api.clone());
                *self.inner.shutdown.lock() = Some(shutdown.clone());
                tokio::spawn(run_event_loop(Arc::clone(&self.inner), api, shutdown));
                self.inner.set_state(EngineState::Running, None);
                Ok(())
            }
            Err(e) => {
                shutdown.cancel();
                self.inner
                    .set_state(EngineState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if let Some(token) = self.inner.shutdown.lock().take() {
            token.cancel();
        }
        *self.inner.api.lock() = None;
        self.inner.fail_all_pending("Engine stopped");
        self.inner.set_state(EngineState::Stopped, None);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.inner.api_handle() {
            Ok(api) => Ok(api.probe().await.is_ok()),
            Err(_) => Ok(false),
        }
    }

    async fn list_sessions(&self, directory: Option<&str>) -> Result<Vec<Session>> {
        let api = match directory {
            Some(dir) => self.inner.api_handle()?.with_directory(dir),
            None => self.inner.api_handle()?,
        };
        let listed = api.list_sessions().await?;
        let fallback = directory.map(normalize_directory).unwrap_or_default();
        let mut sessions = Vec::with_capacity(listed.len());
        {
            let mut mirror = self.inner.sessions.lock();
            for wire_session in listed {
                let session =
                    wire_session.into_session(self.inner.config.engine_type.clone(), &fallback);
                mirror.insert(session.id.clone(), session.clone());
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn create_session(&self, directory: &str) -> Result<Session> {
        let directory = normalize_directory(directory);
        let api = self.inner.api_handle()?.with_directory(&directory);
        let created = api.create_session().await?;
        let session = created.into_session(self.inner.config.engine_type.clone(), &directory);
        self.inner
            .sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        self.inner.events.publish(EngineEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.inner.sessions.lock().get(session_id) {
            return Ok(Some(session.clone()));
        }
        let api = self.inner.api_handle()?;
        let Some(wire_session) = api.get_session(session_id).await? else {
            return Ok(None);
        };
        let session = wire_session.into_session(self.inner.config.engine_type.clone(), "");
        self.inner
            .sessions
            .lock()
            .insert(session.id.clone(), session.clone());
        Ok(Some(session))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let api = self.inner.api_for_session(session_id)?;
        api.delete_session(session_id).await?;
        self.inner.sessions.lock().remove(session_id);
        self.inner.cancelled.lock().remove(session_id);
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
        let api = self.inner.api_for_session(session_id)?;

        // A fresh send reopens the stream for a previously cancelled session.
        self.inner.cancelled.lock().remove(session_id);

        let model_id = options
            .model_id
            .or_else(|| self.inner.session_models.lock().get(session_id).cloned());
        let mode_id = options
            .mode_id
            .or_else(|| self.inner.session_modes.lock().get(session_id).cloned());

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(session_id) {
                return Err(EngineError::Protocol(
                    "a prompt is already running for this session".to_string(),
                ));
            }
            pending.insert(
                session_id.to_string(),
                PendingSend {
                    tx,
                    created: now_ms(),
                    message_id: None,
                    parts: Vec::new(),
                    info: None,
                },
            );
        }

        let body = message_body(&content, model_id.as_deref(), mode_id.as_deref());
        {
            let inner = Arc::clone(&self.inner);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = api.post_message(&session_id, &body).await {
                    tracing::warn!(session_id = %session_id, error = %e, "prompt request failed");
                    inner.complete_pending(&session_id, Some(e.to_string()));
                }
            });
        }

        match tokio::time::timeout(self.inner.config.message_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(EngineError::Transport(
                "prompt abandoned before completion".to_string(),
            )),
            Err(_) => self
                .inner
                .complete_pending(session_id, Some("Message timeout".to_string()))
                .ok_or_else(|| EngineError::Timeout("Message timeout".to_string())),
        }
    }

    async fn cancel_message(&self, session_id: &str) -> Result<()> {
        // Gate the stream first so late deltas cannot pollute a new turn,
        // then resolve the caller, then tell the backend.
        self.inner.cancelled.lock().insert(session_id.to_string());
        self.inner
            .complete_pending(session_id, Some("Cancelled".to_string()));

        if let Ok(api) = self.inner.api_for_session(session_id) {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = api.abort(&session_id).await {
                    tracing::debug!(session_id = %session_id, error = %e, "abort failed");
                }
            });
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let api = self.inner.api_for_session(session_id)?;
        let rows = api.list_messages(session_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let parts: Vec<Part> = row
                    .parts
                    .into_iter()
                    .filter_map(wire::WirePart::into_part)
                    .collect();
                row.info.into_message(parts)
            })
            .collect())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.inner.models.lock().clone())
    }

    async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        self.inner
            .session_models
            .lock()
            .insert(session_id.to_string(), model_id.to_string());
        Ok(())
    }

    async fn get_modes(&self) -> Result<Vec<ModeInfo>> {
        Ok(Vec::new())
    }

    async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        self.inner
            .session_modes
            .lock()
            .insert(session_id.to_string(), mode_id.to_string());
        Ok(())
    }

    async fn reply_permission(&self, permission_id: &str, reply: PermissionReply) -> Result<()> {
        if !self.inner.permissions.lock().remove(permission_id) {
            return Err(EngineError::NotFound(format!(
                "permission {permission_id}"
            )));
        }
        let api = self.inner.api_handle()?;
        let response = json!({
            "response": reply.option_id.clone().unwrap_or_else(|| "reject".to_string())
        });
        api.reply_permission(permission_id, &response).await?;
        self.inner.events.publish(EngineEvent::PermissionReplied {
            engine: self.inner.config.engine_type.clone(),
            permission_id: permission_id.to_string(),
            option_id: reply.option_id,
        });
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let sessions = self.inner.sessions.lock();
        let mut seen = HashSet::new();
        let mut projects = Vec::new();
        for session in sessions.values() {
            if session.directory.is_empty() {
                continue;
            }
            let project = Project::new(
                self.inner.config.engine_type.clone(),
                &session.directory,
            );
            if seen.insert(project.id.clone()) {
                projects.push(project);
            }
        }
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HttpStreamAdapter {
        HttpStreamAdapter::new(HttpEngineConfig::new(EngineType::from("resty")))
    }

    fn text_part(session: &str, message: &str, id: &str, text: &str) -> Value {
        json!({
            "payload": {
                "type": "message.part.updated",
                "properties": {
                    "part": {
                        "id": id,
                        "messageID": message,
                        "sessionID": session,
                        "type": "text",
                        "text": text
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn cancelled_sessions_drop_stream_events() {
        let a = adapter();
        let mut rx = a.events().subscribe();

        a.inner.cancelled.lock().insert("s1".to_string());
        a.inner
            .handle_stream_frame(&text_part("s1", "msg_1", "prt_1", "late").to_string());
        assert!(
            rx.try_recv().is_err(),
            "no event may escape a cancelled session"
        );

        // Other sessions keep streaming.
        a.inner
            .handle_stream_frame(&text_part("s2", "msg_2", "prt_2", "live").to_string());
        let event = rx.try_recv().expect("live session event");
        assert_eq!(event.topic(), "message.part.updated");
    }

    #[tokio::test]
    async fn part_deltas_append_to_cached_parts() {
        let a = adapter();
        let mut rx = a.events().subscribe();

        a.inner
            .handle_stream_frame(&text_part("s1", "msg_1", "prt_1", "Hel").to_string());
        let frame = json!({
            "payload": {
                "type": "message.part.delta",
                "properties": {
                    "sessionID": "s1",
                    "messageID": "msg_1",
                    "partID": "prt_1",
                    "field": "text",
                    "delta": "lo world"
                }
            }
        });
        a.inner.handle_stream_frame(&frame.to_string());

        let _first = rx.try_recv().expect("initial part");
        let second = rx.try_recv().expect("delta re-emission");
        let EngineEvent::MessagePartUpdated { part } = second else {
            panic!("part event expected");
        };
        let PartBody::Text { text } = part.body else {
            panic!("text part expected");
        };
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn terminal_assistant_message_resolves_pending_send() {
        let a = adapter();
        let (tx, rx) = oneshot::channel();
        a.inner.pending.lock().insert(
            "s1".to_string(),
            PendingSend {
                tx,
                created: 1,
                message_id: None,
                parts: Vec::new(),
                info: None,
            },
        );

        a.inner
            .handle_stream_frame(&text_part("s1", "msg_1", "prt_1", "The answer").to_string());
        let frame = json!({
            "payload": {
                "type": "message.updated",
                "properties": {
                    "info": {
                        "id": "msg_1",
                        "sessionID": "s1",
                        "role": "assistant",
                        "time": {"created": 1, "completed": 2}
                    }
                }
            }
        });
        a.inner.handle_stream_frame(&frame.to_string());

        let message = rx.await.expect("pending resolved");
        assert_eq!(message.id, "msg_1");
        assert_eq!(message.time.completed, Some(2));
        assert_eq!(message.parts.len(), 1);
    }
}
