//! In-memory adapter with canned streamed responses.
//!
//! Behaves like a real engine from the outside — sessions, streaming parts,
//! terminal messages, permissions — without any backend process. The
//! manager and gateway test suites run against it.

use crate::assembler::MessageBuffer;
use crate::engine::{EngineAdapter, EngineCapabilities, EngineInfo, EngineState, SendOptions};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::ids;
use crate::model::{
    ContentBlock, EngineType, Message, MessageTime, ModeInfo, ModelInfo, Part, PartBody,
    Permission, PermissionKind, PermissionOption, PermissionOptionKind, PermissionReply, Project,
    Role, Session, SessionTime, default_session_title, normalize_directory, now_ms,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct MockSession {
    session: Session,
    history: Vec<Message>,
}

struct Inner {
    engine_type: EngineType,
    events: EventBus,
    state: Mutex<EngineState>,
    sessions: Mutex<HashMap<String, MockSession>>,
    permissions: Mutex<HashSet<String>>,
}

pub struct MockAdapter {
    inner: Arc<Inner>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new(EngineType::from("mock"))
    }
}

impl MockAdapter {
    #[must_use]
    pub fn new(engine_type: EngineType) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine_type,
                events: EventBus::new(),
                state: Mutex::new(EngineState::Stopped),
                sessions: Mutex::new(HashMap::new()),
                permissions: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Test hook: raise a permission prompt as a backend would.
    pub fn raise_permission(&self, session_id: &str, title: &str) -> Permission {
        let permission = Permission {
            id: ids::permission_id(),
            session_id: session_id.to_string(),
            engine_type: self.inner.engine_type.clone(),
            tool_call_id: None,
            title: title.to_string(),
            kind: PermissionKind::Edit,
            diff: None,
            raw_input: Value::Null,
            options: vec![
                PermissionOption {
                    option_id: "allow_once".to_string(),
                    kind: PermissionOptionKind::AllowOnce,
                    name: "Allow".to_string(),
                },
                PermissionOption {
                    option_id: "reject_once".to_string(),
                    kind: PermissionOptionKind::RejectOnce,
                    name: "Reject".to_string(),
                },
            ],
        };
        self.inner.permissions.lock().insert(permission.id.clone());
        self.inner.events.publish(EngineEvent::PermissionAsked {
            permission: permission.clone(),
        });
        permission
    }
}

/// `"2+2"` → `Some(4)`.
fn eval_sum(text: &str) -> Option<i64> {
    let (lhs, rhs) = text.trim().split_once('+')?;
    let lhs: i64 = lhs.trim().parse().ok()?;
    let rhs: i64 = rhs.trim().parse().ok()?;
    Some(lhs + rhs)
}

fn response_for(text: &str) -> String {
    match eval_sum(text) {
        Some(sum) => format!("The answer is {sum}"),
        None => format!("This is a mock response to: {text}"),
    }
}

fn user_message(session_id: &str, content: &[ContentBlock], now: i64) -> Message {
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

#[async_trait]
impl EngineAdapter for MockAdapter {
    fn engine_type(&self) -> EngineType {
        self.inner.engine_type.clone()
    }

    fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            load_session: false,
            list_sessions: true,
            models: true,
            modes: true,
        }
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            engine_type: self.inner.engine_type.clone(),
            name: "Mock Engine".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            state: self.state(),
            capabilities: self.capabilities(),
        }
    }

    fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == EngineState::Running {
                return Ok(());
            }
            *state = EngineState::Running;
        }
        self.inner.events.publish(EngineEvent::StatusChanged {
            engine: self.inner.engine_type.clone(),
            state: EngineState::Running,
            error: None,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == EngineState::Stopped {
                return Ok(());
            }
            *state = EngineState::Stopped;
        }
        self.inner.events.publish(EngineEvent::StatusChanged {
            engine: self.inner.engine_type.clone(),
            state: EngineState::Stopped,
            error: None,
        });
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.state() == EngineState::Running)
    }

    async fn list_sessions(&self, directory: Option<&str>) -> Result<Vec<Session>> {
        let wanted = directory.map(normalize_directory);
        let sessions = self.inner.sessions.lock();
        Ok(sessions
            .values()
            .filter(|s| {
                wanted
                    .as_deref()
                    .is_none_or(|dir| s.session.directory == dir)
            })
            .map(|s| s.session.clone())
            .collect())
    }

    async fn create_session(&self, directory: &str) -> Result<Session> {
        if self.state() != EngineState::Running {
            return Err(EngineError::NotRunning(self.inner.engine_type.to_string()));
        }
        let now = now_ms();
        let session = Session {
            id: ids::session_id(),
            engine_type: self.inner.engine_type.clone(),
            directory: normalize_directory(directory),
            title: default_session_title(now),
            parent_id: None,
            time: SessionTime {
                created: now,
                updated: now,
            },
            metadata: None,
        };
        self.inner.sessions.lock().insert(
            session.id.clone(),
            MockSession {
                session: session.clone(),
                history: Vec::new(),
            },
        );
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
            .map(|s| s.session.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        if self.inner.sessions.lock().remove(session_id).is_none() {
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }
        self.inner.events.publish(EngineEvent::SessionDeleted {
            engine: self.inner.engine_type.clone(),
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        session_id: &str,
        content: Vec<ContentBlock>,
        _options: SendOptions,
    ) -> Result<Message> {
        if self.state() != EngineState::Running {
            return Err(EngineError::NotRunning(self.inner.engine_type.to_string()));
        }
        let now = now_ms();
        let user = user_message(session_id, &content, now);
        {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            entry.history.push(user.clone());
            entry.session.time.updated = now;
        }
        self.inner
            .events
            .publish(EngineEvent::MessageUpdated { message: user });

        let prompt_text = content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n");
        let response = response_for(&prompt_text);

        // Stream the response in a few chunks like a real backend would.
        let mut buffer = MessageBuffer::new(session_id, Role::Assistant, now);
        let chunk_size = (response.len() / 3).max(1);
        let chars: Vec<char> = response.chars().collect();
        for chunk in chars.chunks(chunk_size) {
            let delta: String = chunk.iter().collect();
            let part = buffer.append_text(&delta);
            self.inner
                .events
                .publish(EngineEvent::MessagePartUpdated { part });
            tokio::task::yield_now().await;
        }

        let message = buffer.finalize(now_ms(), None);
        {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            entry.history.push(message.clone());
            entry.session.time.updated = message.time.completed.unwrap_or(now);
        }
        self.inner.events.publish(EngineEvent::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }

    async fn cancel_message(&self, _session_id: &str) -> Result<()> {
        // Mock turns complete synchronously; nothing to cancel.
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.history.clone())
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo {
                id: "mock-small".to_string(),
                name: Some("Mock Small".to_string()),
            },
            ModelInfo {
                id: "mock-large".to_string(),
                name: Some("Mock Large".to_string()),
            },
        ])
    }

    async fn set_model(&self, session_id: &str, _model_id: &str) -> Result<()> {
        self.ensure_session(session_id)
    }

    async fn get_modes(&self) -> Result<Vec<ModeInfo>> {
        Ok(vec![
            ModeInfo {
                id: "default".to_string(),
                name: Some("Default".to_string()),
            },
            ModeInfo {
                id: "autopilot".to_string(),
                name: Some("Autopilot".to_string()),
            },
        ])
    }

    async fn set_mode(&self, session_id: &str, _mode_id: &str) -> Result<()> {
        self.ensure_session(session_id)
    }

    async fn reply_permission(&self, permission_id: &str, reply: PermissionReply) -> Result<()> {
        if !self.inner.permissions.lock().remove(permission_id) {
            return Err(EngineError::NotFound(format!(
                "permission {permission_id}"
            )));
        }
        self.inner.events.publish(EngineEvent::PermissionReplied {
            engine: self.inner.engine_type.clone(),
            permission_id: permission_id.to_string(),
            option_id: reply.option_id,
        });
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let sessions = self.inner.sessions.lock();
        let mut seen = HashSet::new();
        let mut projects = Vec::new();
        for entry in sessions.values() {
            let project = Project::new(self.inner.engine_type.clone(), &entry.session.directory);
            if seen.insert(project.id.clone()) {
                projects.push(project);
            }
        }
        Ok(projects)
    }
}

impl MockAdapter {
    fn ensure_session(&self, session_id: &str) -> Result<()> {
        if self.inner.sessions.lock().contains_key(session_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("session {session_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn running_mock() -> MockAdapter {
        let adapter = MockAdapter::default();
        adapter.start().await.expect("start");
        adapter
    }

    #[tokio::test]
    async fn math_prompt_answers_with_the_sum() {
        let adapter = running_mock().await;
        let session = adapter.create_session("/tmp/demo").await.expect("session");
        let message = adapter
            .send_message(
                &session.id,
                vec![ContentBlock::text("2+2")],
                SendOptions::default(),
            )
            .await
            .expect("send");

        assert_eq!(message.parts.len(), 1);
        let PartBody::Text { text } = &message.parts[0].body else {
            panic!("text part expected");
        };
        assert_eq!(text, "The answer is 4");
        assert!(message.time.completed.is_some());

        let history = adapter.list_messages(&session.id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn text_prompt_echoes() {
        let adapter = running_mock().await;
        let session = adapter.create_session("/tmp/demo").await.expect("session");
        let message = adapter
            .send_message(
                &session.id,
                vec![ContentBlock::text("Hello world")],
                SendOptions::default(),
            )
            .await
            .expect("send");
        let PartBody::Text { text } = &message.parts[0].body else {
            panic!("text part expected");
        };
        assert_eq!(text, "This is a mock response to: Hello world");
    }

    #[tokio::test]
    async fn streamed_parts_accumulate_into_one_text_part() {
        let adapter = running_mock().await;
        let session = adapter.create_session("/tmp/demo").await.expect("session");
        let mut rx = adapter.events().subscribe();

        let message = adapter
            .send_message(
                &session.id,
                vec![ContentBlock::text("stream me")],
                SendOptions::default(),
            )
            .await
            .expect("send");

        let mut part_updates = 0;
        let mut last_text = String::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::MessagePartUpdated { part } = event
                && part.message_id == message.id
                && let PartBody::Text { text } = part.body
            {
                part_updates += 1;
                assert!(text.starts_with(&last_text), "text grows monotonically");
                last_text = text;
            }
        }
        assert!(part_updates >= 2, "response streams in multiple chunks");
        assert_eq!(last_text, "This is a mock response to: stream me");
    }

    #[tokio::test]
    async fn permission_round_trip_and_reply_twice_fails() {
        let adapter = running_mock().await;
        let session = adapter.create_session("/tmp/demo").await.expect("session");
        let permission = adapter.raise_permission(&session.id, "Write x");

        adapter
            .reply_permission(
                &permission.id,
                PermissionReply {
                    option_id: Some("allow_once".to_string()),
                },
            )
            .await
            .expect("first reply");

        let err = adapter
            .reply_permission(&permission.id, PermissionReply::default())
            .await
            .expect_err("second reply must fail");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn sum_parser() {
        assert_eq!(eval_sum("2+2"), Some(4));
        assert_eq!(eval_sum(" 40 + 2 "), Some(42));
        assert_eq!(eval_sum("two+two"), None);
        assert_eq!(eval_sum("no math"), None);
    }
}
