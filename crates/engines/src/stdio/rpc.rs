//! Newline-delimited JSON-RPC 2.0 over a child process's stdio.
//!
//! Inbound messages are classified by `(id, method)`: a response carries an
//! id and no method, a notification a method and no id, and a reverse
//! request both. Responses complete the matching pending RPC; everything
//! else is handed to the adapter over a channel so the reader loop never
//! blocks on adapter logic.

use crate::error::{EngineError, Result};
use crate::process;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

/// Default deadline for request/response RPCs. Prompts pass `None`: they
/// are long-running by nature and guarded by the activity watchdog instead.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(120);

const KILL_GRACE: Duration = Duration::from_secs(5);

/// One inbound backend message, delivered strictly in arrival order.
///
/// Responses travel through the same queue as notifications so an RPC like
/// `session/load` cannot resolve before the updates it streamed ahead of
/// its response have been applied.
#[derive(Debug)]
pub enum Incoming {
    Notification {
        method: String,
        params: Value,
    },
    /// Reverse request; `id` must be echoed in the correlated response.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Response to one of our RPCs; resolve with [`RpcClient::complete`].
    Response {
        id: i64,
        outcome: Result<Value>,
    },
    /// Stdout reached EOF: the child is gone.
    Closed,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

pub struct RpcClient {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicI64,
}

impl RpcClient {
    /// Spawn the backend and start its reader loop. Returns the client and
    /// the channel of notifications/reverse requests.
    pub fn spawn(mut cmd: Command) -> Result<(Arc<Self>, mpsc::Receiver<Incoming>)> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Transport("backend stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Transport("backend stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(line = %line, "backend stderr");
                }
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::channel(256);

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message: Value = match serde_json::from_str(line) {
                            Ok(v) => v,
                            Err(e) => {
                                // Malformed lines are dropped, never fatal.
                                tracing::warn!(error = %e, "invalid backend message");
                                continue;
                            }
                        };
                        if let Some(incoming) = classify(message)
                            && incoming_tx.send(incoming).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "backend stdout read failed");
                        break;
                    }
                }
            }
            fail_all_pending(&reader_pending, "backend closed the stream");
            let _ = incoming_tx.send(Incoming::Closed).await;
        });

        let client = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending,
            next_id: AtomicI64::new(1),
        });
        Ok((client, incoming_rx))
    }

    /// Issue a request and await its response. `timeout = None` disables
    /// the deadline entirely.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.write_line(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(EngineError::Timeout(format!(
                        "{method} did not respond within {}s",
                        t.as_secs()
                    )));
                }
            },
            None => rx.await,
        };
        outcome
            .map_err(|_| EngineError::Transport("backend closed before responding".into()))?
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_line(&frame).await
    }

    /// Answer a reverse request.
    pub async fn respond(&self, id: Value, result: Value) -> Result<()> {
        let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
        self.write_line(&frame).await
    }

    /// Answer a reverse request with a JSON-RPC error.
    pub async fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<()> {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        });
        self.write_line(&frame).await
    }

    /// Resolve a pending RPC from an [`Incoming::Response`].
    pub fn complete(&self, id: i64, outcome: Result<Value>) {
        let Some(tx) = self.pending.lock().remove(&id) else {
            tracing::debug!(id, "response for unknown or abandoned request");
            return;
        };
        let _ = tx.send(outcome);
    }

    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Kill the backend and fail everything still pending.
    pub async fn shutdown(&self) {
        {
            let mut child = self.child.lock().await;
            process::terminate_tree(&mut child, KILL_GRACE).await;
        }
        fail_all_pending(&self.pending, "engine stopped");
    }

    async fn write_line(&self, frame: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(frame)?;
        bytes.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Classify one inbound message by `(id, method)`.
fn classify(mut message: Value) -> Option<Incoming> {
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = message.get("id").cloned();

    match (id, method) {
        (Some(id), Some(method)) => {
            let params = message
                .get_mut("params")
                .map(Value::take)
                .unwrap_or(Value::Null);
            Some(Incoming::Request { id, method, params })
        }
        (None, Some(method)) => {
            let params = message
                .get_mut("params")
                .map(Value::take)
                .unwrap_or(Value::Null);
            Some(Incoming::Notification { method, params })
        }
        (Some(id), None) => {
            let Some(id) = id.as_i64() else {
                tracing::warn!(id = %id, "response with non-numeric id");
                return None;
            };
            let outcome = if let Some(error) = message.get("error") {
                Err(EngineError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown backend error")
                        .to_string(),
                })
            } else {
                Ok(message
                    .get_mut("result")
                    .map(Value::take)
                    .unwrap_or(Value::Null))
            };
            Some(Incoming::Response { id, outcome })
        }
        (None, None) => {
            tracing::warn!("backend message with neither id nor method");
            None
        }
    }
}

fn fail_all_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = {
        let mut map = pending.lock();
        map.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(EngineError::Transport(reason.to_string())));
    }
}
