//! Durable session metadata store.
//!
//! One JSON file per `(engineType, project)` group under
//! `{root}/{engineType}/{safeProjectFolder}/sessions.json`. Everything is
//! served from an in-memory cache; writes are debounced per file and land
//! atomically via tmp-then-rename so a crash never leaves a torn file.

use agenthub_engines::model::{EngineType, Project, Session};
use anyhow::Context as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const STORE_VERSION: u32 = 1;
const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsFile {
    version: u32,
    engine_type: EngineType,
    directory: String,
    sessions: Vec<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    engine_type: EngineType,
    project_id: String,
}

struct Group {
    directory: String,
    sessions: HashMap<String, Session>,
    dirty: bool,
    timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct SessionStore {
    root: PathBuf,
    debounce: Duration,
    groups: Mutex<HashMap<GroupKey, Group>>,
}

/// Replace characters that are unsafe in file names on any platform.
fn sanitize_folder(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}

/// A session's project id: backend-provided when the metadata carries one,
/// otherwise derived from `(engineType, directory)`.
fn resolved_project_id(session: &Session) -> String {
    session
        .metadata
        .as_ref()
        .and_then(|m| m.get("projectId"))
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| session.project_id(), str::to_string)
}

fn group_key(session: &Session) -> GroupKey {
    GroupKey {
        engine_type: session.engine_type.clone(),
        project_id: resolved_project_id(session),
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .context("sessions file must have a parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create dir {}", parent.display()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

impl SessionStore {
    /// Load every persisted session into memory, re-flush to the current
    /// folder layout, and drop folders no active group maps to.
    pub fn load(root: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        Self::load_with_debounce(root, DEBOUNCE)
    }

    pub fn load_with_debounce(
        root: impl Into<PathBuf>,
        debounce: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let root = root.into();
        let store = Arc::new(Self {
            root: root.clone(),
            debounce,
            groups: Mutex::new(HashMap::new()),
        });

        let mut legacy_dirs: Vec<PathBuf> = Vec::new();
        if root.is_dir() {
            for engine_dir in std::fs::read_dir(&root)?.flatten() {
                if !engine_dir.path().is_dir() {
                    continue;
                }
                for project_dir in std::fs::read_dir(engine_dir.path())?.flatten() {
                    let file = project_dir.path().join("sessions.json");
                    let Ok(bytes) = std::fs::read(&file) else {
                        legacy_dirs.push(project_dir.path());
                        continue;
                    };
                    let parsed: SessionsFile = match serde_json::from_slice(&bytes) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(file = %file.display(), error = %e, "skipping unreadable sessions file");
                            continue;
                        }
                    };
                    let mut groups = store.groups.lock();
                    for session in parsed.sessions {
                        let key = group_key(&session);
                        let group = groups.entry(key).or_insert_with(|| Group {
                            directory: session.directory.clone(),
                            sessions: HashMap::new(),
                            dirty: true,
                            timer: None,
                        });
                        merge_into(group, session);
                        group.dirty = true;
                    }
                    legacy_dirs.push(project_dir.path());
                }
            }
        }

        // One-time migration: everything gets rewritten into the
        // project-id-based layout, then stale folders are removed.
        store.flush_all();
        let expected: HashSet<PathBuf> = {
            let groups = store.groups.lock();
            groups
                .keys()
                .map(|key| store.group_dir(key))
                .collect()
        };
        for dir in legacy_dirs {
            if !expected.contains(&dir) {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::debug!(dir = %dir.display(), error = %e, "orphan cleanup failed");
                }
            }
        }

        Ok(store)
    }

    fn group_dir(&self, key: &GroupKey) -> PathBuf {
        self.root
            .join(sanitize_folder(key.engine_type.as_str()))
            .join(sanitize_folder(&key.project_id))
    }

    fn group_path(&self, key: &GroupKey) -> PathBuf {
        self.group_dir(key).join("sessions.json")
    }

    /// Merge one session in (backend data wins on recency) and schedule a
    /// debounced write of its group.
    pub fn upsert_session(self: &Arc<Self>, session: &Session) {
        let key = group_key(session);
        let changed = {
            let mut groups = self.groups.lock();
            let group = groups.entry(key.clone()).or_insert_with(|| Group {
                directory: session.directory.clone(),
                sessions: HashMap::new(),
                dirty: false,
                timer: None,
            });
            merge_into(group, session.clone())
        };
        if changed {
            self.schedule_flush(key);
        }
    }

    pub fn merge_sessions(self: &Arc<Self>, sessions: &[Session]) {
        for session in sessions {
            self.upsert_session(session);
        }
    }

    pub fn remove_session(self: &Arc<Self>, engine_type: &EngineType, session_id: &str) -> bool {
        let key = {
            let mut groups = self.groups.lock();
            groups
                .iter_mut()
                .find(|(key, group)| {
                    key.engine_type == *engine_type && group.sessions.contains_key(session_id)
                })
                .map(|(key, group)| {
                    group.sessions.remove(session_id);
                    group.dirty = true;
                    key.clone()
                })
        };
        match key {
            Some(key) => {
                self.schedule_flush(key);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let groups = self.groups.lock();
        groups
            .values()
            .find_map(|g| g.sessions.get(session_id).cloned())
    }

    #[must_use]
    pub fn list_sessions(
        &self,
        engine_type: Option<&EngineType>,
        directory: Option<&str>,
    ) -> Vec<Session> {
        let groups = self.groups.lock();
        let mut sessions: Vec<Session> = groups
            .iter()
            .filter(|(key, _)| engine_type.is_none_or(|e| key.engine_type == *e))
            .flat_map(|(_, group)| group.sessions.values().cloned())
            .filter(|s| directory.is_none_or(|d| s.directory == d))
            .collect();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        sessions
    }

    /// Projects are derived from the cached sessions; nothing is stored.
    #[must_use]
    pub fn list_projects(&self) -> Vec<Project> {
        let groups = self.groups.lock();
        let mut seen = HashSet::new();
        let mut projects = Vec::new();
        for (key, group) in groups.iter() {
            for session in group.sessions.values() {
                let project = Project::new(key.engine_type.clone(), &session.directory);
                if seen.insert(project.id.clone()) {
                    projects.push(project);
                }
            }
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    /// `(sessionId, engineType)` pairs for rebuilding routing at boot.
    #[must_use]
    pub fn session_engine_pairs(&self) -> Vec<(String, EngineType)> {
        let groups = self.groups.lock();
        groups
            .iter()
            .flat_map(|(key, group)| {
                group
                    .sessions
                    .keys()
                    .map(|id| (id.clone(), key.engine_type.clone()))
            })
            .collect()
    }

    fn schedule_flush(self: &Arc<Self>, key: GroupKey) {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(&key) else {
            return;
        };
        group.dirty = true;
        if let Some(timer) = group.timer.take() {
            timer.abort();
        }
        let store = Arc::clone(self);
        let timer_key = key.clone();
        group.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(store.debounce).await;
            store.flush_group(&timer_key);
        }));
    }

    fn flush_group(&self, key: &GroupKey) {
        let payload = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(key) else {
                return;
            };
            if !group.dirty {
                return;
            }
            group.dirty = false;
            group.timer = None;
            let mut sessions: Vec<Session> = group.sessions.values().cloned().collect();
            sessions.sort_by(|a, b| a.time.created.cmp(&b.time.created));
            SessionsFile {
                version: STORE_VERSION,
                engine_type: key.engine_type.clone(),
                directory: group.directory.clone(),
                sessions,
            }
        };

        let path = self.group_path(key);
        let bytes = match serde_json::to_vec_pretty(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "serialize sessions file failed");
                return;
            }
        };
        if let Err(e) = atomic_write(&path, &bytes) {
            tracing::warn!(file = %path.display(), error = %e, "session flush failed");
        }
    }

    /// Cancel pending timers and write every dirty group now. Calling this
    /// twice in a row performs no extra write.
    pub fn flush_all(&self) {
        let keys: Vec<GroupKey> = {
            let mut groups = self.groups.lock();
            groups
                .iter_mut()
                .filter(|(_, g)| g.dirty)
                .map(|(key, group)| {
                    if let Some(timer) = group.timer.take() {
                        timer.abort();
                    }
                    key.clone()
                })
                .collect()
        };
        for key in keys {
            self.flush_group(&key);
        }
    }
}

/// Incoming data is authoritative when at least as recent as the cache.
fn merge_into(group: &mut Group, session: Session) -> bool {
    match group.sessions.get(&session.id) {
        Some(existing) if session.time.updated < existing.time.updated => false,
        _ => {
            group.directory = session.directory.clone();
            group.sessions.insert(session.id.clone(), session);
            group.dirty = true;
            true
        }
    }
}
