//! Engine manager: adapter registry, routing tables, event fan-in.
//!
//! Routing state is three maps guarded by one mutex: session → engine,
//! normalised directory → engine, permission → engine. Entries are
//! registered as sessions and permissions are observed and dropped when
//! they die, so lookups never dangle. Every adapter event is re-published
//! on the manager's own bus for the gateway to broadcast.

use crate::store::SessionStore;
use agenthub_engines::engine::{EngineCapabilities, EngineInfo};
use agenthub_engines::model::{
    ContentBlock, EngineType, Message, ModeInfo, ModelInfo, PermissionReply, Project, Session,
    is_default_session_title, normalize_directory, now_ms,
};
use agenthub_engines::{EngineAdapter, EngineError, EngineEvent, EventBus, Result, SendOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const TITLE_LIMIT: usize = 100;

#[derive(Default)]
struct Routes {
    session_engine: HashMap<String, EngineType>,
    project_engine: HashMap<String, EngineType>,
    permission_engine: HashMap<String, EngineType>,
}

pub struct EngineManager {
    adapters: Mutex<HashMap<EngineType, Arc<dyn EngineAdapter>>>,
    routes: Mutex<Routes>,
    store: Arc<SessionStore>,
    events: EventBus,
}

/// Argument to `session.list`: an engine name or a directory.
#[derive(Debug, Clone)]
pub enum ListSessionsArg {
    Engine(EngineType),
    Directory(String),
}

impl EngineManager {
    #[must_use]
    pub fn new(store: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            adapters: Mutex::new(HashMap::new()),
            routes: Mutex::new(Routes::default()),
            store,
            events: EventBus::new(),
        })
    }

    /// Events from every registered adapter, re-published on one bus.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    #[must_use]
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Register an adapter and start forwarding its events.
    pub fn register(self: &Arc<Self>, adapter: Arc<dyn EngineAdapter>) {
        let engine_type = adapter.engine_type();
        let mut rx = adapter.events().subscribe();
        self.adapters
            .lock()
            .insert(engine_type.clone(), Arc::clone(&adapter));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.observe(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(engine = %engine_type, missed, "event fan-in lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Rebuild routing from persisted sessions after a restart.
    pub fn restore_from_store(&self) {
        let mut routes = self.routes.lock();
        for (session_id, engine_type) in self.store.session_engine_pairs() {
            routes.session_engine.insert(session_id, engine_type);
        }
        for session in self.store.list_sessions(None, None) {
            routes
                .project_engine
                .entry(session.directory.clone())
                .or_insert(session.engine_type);
        }
    }

    /// Maintain routing tables and the store, then bubble the event up.
    fn observe(&self, event: EngineEvent) {
        match &event {
            EngineEvent::SessionCreated { session } | EngineEvent::SessionUpdated { session } => {
                {
                    let mut routes = self.routes.lock();
                    routes
                        .session_engine
                        .insert(session.id.clone(), session.engine_type.clone());
                    if !session.directory.is_empty() {
                        routes
                            .project_engine
                            .entry(session.directory.clone())
                            .or_insert_with(|| session.engine_type.clone());
                    }
                }
                self.store.upsert_session(session);
            }
            EngineEvent::SessionDeleted {
                engine, session_id, ..
            } => {
                self.routes.lock().session_engine.remove(session_id);
                self.store.remove_session(engine, session_id);
            }
            EngineEvent::PermissionAsked { permission } => {
                self.routes.lock().permission_engine.insert(
                    permission.id.clone(),
                    permission.engine_type.clone(),
                );
            }
            EngineEvent::PermissionReplied { permission_id, .. } => {
                self.routes.lock().permission_engine.remove(permission_id);
            }
            _ => {}
        }
        self.events.publish(event);
    }

    fn adapter(&self, engine_type: &EngineType) -> Result<Arc<dyn EngineAdapter>> {
        self.adapters
            .lock()
            .get(engine_type)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("engine {engine_type}")))
    }

    fn adapter_for_session(&self, session_id: &str) -> Result<Arc<dyn EngineAdapter>> {
        let engine_type = self
            .routes
            .lock()
            .session_engine
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        self.adapter(&engine_type)
    }

    #[must_use]
    pub fn engines(&self) -> Vec<EngineInfo> {
        let mut infos: Vec<EngineInfo> = self
            .adapters
            .lock()
            .values()
            .map(|a| a.info())
            .collect();
        infos.sort_by(|a, b| a.engine_type.as_str().cmp(b.engine_type.as_str()));
        infos
    }

    pub fn capabilities(&self, engine_type: &EngineType) -> Result<EngineCapabilities> {
        Ok(self.adapter(engine_type)?.capabilities())
    }

    /// Start every adapter; a failing engine is logged and skipped so the
    /// gateway stays available for the rest.
    pub async fn start_all(&self) {
        let adapters: Vec<Arc<dyn EngineAdapter>> =
            self.adapters.lock().values().cloned().collect();
        let results = futures::future::join_all(adapters.iter().map(|a| a.start())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(engine = %adapter.engine_type(), error = %e, "engine failed to start");
            }
        }
    }

    pub async fn stop_all(&self) {
        let adapters: Vec<Arc<dyn EngineAdapter>> =
            self.adapters.lock().values().cloned().collect();
        let results = futures::future::join_all(adapters.iter().map(|a| a.stop())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(engine = %adapter.engine_type(), error = %e, "engine failed to stop");
            }
        }
    }

    pub async fn list_sessions(&self, arg: ListSessionsArg) -> Result<Vec<Session>> {
        let sessions = match arg {
            ListSessionsArg::Engine(engine_type) => {
                self.adapter(&engine_type)?.list_sessions(None).await?
            }
            ListSessionsArg::Directory(directory) => {
                let directory = normalize_directory(&directory);
                let bound = self.routes.lock().project_engine.get(&directory).cloned();
                match bound {
                    Some(engine_type) => {
                        self.adapter(&engine_type)?
                            .list_sessions(Some(&directory))
                            .await?
                    }
                    None => {
                        // No binding yet: ask everyone, merge.
                        let adapters: Vec<Arc<dyn EngineAdapter>> =
                            self.adapters.lock().values().cloned().collect();
                        let mut merged = Vec::new();
                        for adapter in adapters {
                            match adapter.list_sessions(Some(&directory)).await {
                                Ok(mut sessions) => merged.append(&mut sessions),
                                Err(e) => tracing::debug!(
                                    engine = %adapter.engine_type(),
                                    error = %e,
                                    "session listing failed"
                                ),
                            }
                        }
                        merged
                    }
                }
            }
        };

        {
            let mut routes = self.routes.lock();
            for session in &sessions {
                routes
                    .session_engine
                    .insert(session.id.clone(), session.engine_type.clone());
            }
        }
        self.store.merge_sessions(&sessions);
        Ok(sessions)
    }

    pub async fn create_session(
        &self,
        engine_type: &EngineType,
        directory: &str,
    ) -> Result<Session> {
        let session = self.adapter(engine_type)?.create_session(directory).await?;
        {
            let mut routes = self.routes.lock();
            routes
                .session_engine
                .insert(session.id.clone(), engine_type.clone());
            routes
                .project_engine
                .insert(session.directory.clone(), engine_type.clone());
        }
        self.store.upsert_session(&session);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        match self.adapter_for_session(session_id) {
            Ok(adapter) => adapter.get_session(session_id).await,
            Err(_) => Ok(self.store.get_session(session_id)),
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let adapter = self.adapter_for_session(session_id)?;
        adapter.delete_session(session_id).await?;
        let engine_type = adapter.engine_type();
        self.routes.lock().session_engine.remove(session_id);
        self.store.remove_session(&engine_type, session_id);
        Ok(())
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
        options: SendOptions,
    ) -> Result<Message> {
        let adapter = self.adapter_for_session(session_id)?;
        let first_text = content
            .iter()
            .find_map(ContentBlock::as_text)
            .map(str::to_string);
        let message = adapter.send_message(session_id, content, options).await?;

        if let Some(text) = first_text {
            self.apply_title_fallback(&adapter, session_id, &text).await;
        }
        Ok(message)
    }

    /// Backends often leave a session on its default placeholder title;
    /// after the first prompt, fall back to the user's words.
    async fn apply_title_fallback(
        &self,
        adapter: &Arc<dyn EngineAdapter>,
        session_id: &str,
        first_text: &str,
    ) {
        let fallback = derive_title(first_text);
        if fallback.is_empty() {
            return;
        }
        let session = match adapter.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) | Err(_) => match self.store.get_session(session_id) {
                Some(session) => session,
                None => return,
            },
        };
        if !is_default_session_title(&session.title) {
            return;
        }
        let mut renamed = session;
        renamed.title = fallback;
        renamed.time.updated = now_ms();
        self.store.upsert_session(&renamed);
        self.events
            .publish(EngineEvent::SessionUpdated { session: renamed });
    }

    pub async fn cancel_message(&self, session_id: &str) -> Result<()> {
        self.adapter_for_session(session_id)?
            .cancel_message(session_id)
            .await
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.adapter_for_session(session_id)?
            .list_messages(session_id)
            .await
    }

    pub async fn list_models(&self, engine_type: &EngineType) -> Result<Vec<ModelInfo>> {
        self.adapter(engine_type)?.list_models().await
    }

    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        self.adapter_for_session(session_id)?
            .set_model(session_id, model_id)
            .await
    }

    pub async fn get_modes(&self, engine_type: &EngineType) -> Result<Vec<ModeInfo>> {
        self.adapter(engine_type)?.get_modes().await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        self.adapter_for_session(session_id)?
            .set_mode(session_id, mode_id)
            .await
    }

    /// Route a reply to the exact adapter that asked. A second reply for
    /// the same permission finds no route and fails.
    pub async fn reply_permission(
        &self,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<()> {
        let engine_type = self
            .routes
            .lock()
            .permission_engine
            .get(permission_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("permission {permission_id}")))?;
        self.adapter(&engine_type)?
            .reply_permission(permission_id, reply)
            .await?;
        self.routes.lock().permission_engine.remove(permission_id);
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects = self.store.list_projects();
        let adapters: Vec<Arc<dyn EngineAdapter>> =
            self.adapters.lock().values().cloned().collect();
        for adapter in adapters {
            if let Ok(more) = adapter.list_projects().await {
                for project in more {
                    if !projects.iter().any(|p| p.id == project.id) {
                        projects.push(project);
                    }
                }
            }
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    pub fn set_project_engine(&self, directory: &str, engine_type: &EngineType) -> Result<()> {
        // Validate the engine exists before binding.
        let _ = self.adapter(engine_type)?;
        self.routes
            .lock()
            .project_engine
            .insert(normalize_directory(directory), engine_type.clone());
        Ok(())
    }
}

/// First `TITLE_LIMIT` characters of the user's words, ellipsised when cut.
fn derive_title(text: &str) -> String {
    let trimmed = text.trim();
    let mut title: String = trimmed.chars().take(TITLE_LIMIT).collect();
    if trimmed.chars().count() > TITLE_LIMIT {
        title.push('…');
    }
    title
}
