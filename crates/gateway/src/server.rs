//! WebSocket gateway server.
//!
//! One axum listener: the WebSocket endpoint plus a `/health` probe.
//! Requests are dispatched to the engine manager on their own tasks so a
//! minutes-long `message.send` never blocks the connection's read loop;
//! notifications are serialised once and fanned out to every authenticated
//! connection.

use crate::contracts::{
    self, AuthFrame, CLOSE_GOING_AWAY, CLOSE_UNAUTHORIZED, ErrorCode, RequestFrame,
    error_frame, notification_frame, response_frame,
};
use crate::manager::{EngineManager, ListSessionsArg};
use agenthub_engines::EngineError;
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_BUFFER: usize = 256;

/// Validates a client-supplied token. Absent validator = open gateway.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct ConnectionHandle {
    tx: mpsc::Sender<WsMessage>,
    authed: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct GatewayServer {
    manager: Arc<EngineManager>,
    validator: Option<TokenValidator>,
    ws_path: String,
    shutdown: CancellationToken,
    connections: Arc<Mutex<HashMap<u64, ConnectionHandle>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl GatewayServer {
    #[must_use]
    pub fn new(
        manager: Arc<EngineManager>,
        ws_path: impl Into<String>,
        validator: Option<TokenValidator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            validator,
            ws_path: ws_path.into(),
            shutdown,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.ws_path, get(ws_handler))
            .route("/health", get(health))
            .with_state(self.clone())
    }

    /// Subscribe to the manager bus and fan notifications out. One
    /// serialisation per event, shared by every eligible socket.
    pub fn start_broadcast(&self) {
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.clone();
        let mut rx = self.manager.events().subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let text = notification_frame(&event).to_string();
                        let handles: Vec<ConnectionHandle> =
                            connections.lock().values().cloned().collect();
                        for handle in handles {
                            if handle.authed.load(Ordering::Relaxed)
                                && handle
                                    .tx
                                    .try_send(WsMessage::Text(text.clone().into()))
                                    .is_err()
                            {
                                // Slow or dead socket; its read loop will
                                // clean the registry entry up.
                                tracing::debug!("dropping notification for stalled connection");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "broadcast fan-out lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn serve(&self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        self.start_broadcast();
        let shutdown = self.shutdown.clone();
        tracing::info!(
            addr = %listener.local_addr()?,
            ws_path = %self.ws_path,
            "gateway listening"
        );
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn ws_handler(
    State(server): State<GatewayServer>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_connection(server, socket, token))
}

async fn close_unauthorized(tx: &mpsc::Sender<WsMessage>) {
    let _ = tx
        .send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "unauthorized".into(),
        })))
        .await;
}

async fn handle_connection(server: GatewayServer, socket: WebSocket, query_token: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Auto-authenticate when no validator is configured; otherwise the
    // token comes from the handshake query or the first auth frame.
    let authed = Arc::new(AtomicBool::new(server.validator.is_none()));
    if let (Some(validator), Some(token)) = (&server.validator, &query_token) {
        if validator(token) {
            authed.store(true, Ordering::Relaxed);
        } else {
            close_unauthorized(&out_tx).await;
            let _ = writer.await;
            return;
        }
    }

    let connection_id = server.next_connection_id.fetch_add(1, Ordering::Relaxed);
    server.connections.lock().insert(
        connection_id,
        ConnectionHandle {
            tx: out_tx.clone(),
            authed: Arc::clone(&authed),
        },
    );
    tracing::debug!(connection_id, "client connected");

    let keepalive = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if out_tx
                    .send(WsMessage::Ping(Vec::new().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    loop {
        let message = tokio::select! {
            () = server.shutdown.cancelled() => {
                let _ = out_tx
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "server shutdown".into(),
                    })))
                    .await;
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(WsMessage::Text(text))) => {
                if authed.load(Ordering::Relaxed) {
                    handle_request_frame(&server, text.as_str(), &out_tx);
                } else if !handle_auth_frame(&server, text.as_str(), &authed, &out_tx).await {
                    break;
                }
            }
            Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
            Some(Ok(_)) => {} // ping/pong/binary
        }
    }

    server.connections.lock().remove(&connection_id);
    keepalive.abort();
    drop(out_tx);
    let _ = writer.await;
    tracing::debug!(connection_id, "client disconnected");
}

/// Returns false when the connection must close (bad token).
async fn handle_auth_frame(
    server: &GatewayServer,
    text: &str,
    authed: &Arc<AtomicBool>,
    out_tx: &mpsc::Sender<WsMessage>,
) -> bool {
    let Some(validator) = &server.validator else {
        return true;
    };
    let parsed: Option<(String, AuthFrame)> = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| {
            let kind = value.get("type")?.as_str()?.to_string();
            let frame = serde_json::from_value::<AuthFrame>(value).ok()?;
            Some((kind, frame))
        });

    match parsed {
        Some((kind, frame)) if kind == "auth" && validator(&frame.token) => {
            authed.store(true, Ordering::Relaxed);
            if let Some(request_id) = frame.request_id {
                let ok = response_frame(&request_id, contracts::OkPayload::value());
                let _ = out_tx.send(WsMessage::Text(ok.to_string().into())).await;
            }
            true
        }
        _ => {
            close_unauthorized(out_tx).await;
            false
        }
    }
}

/// Parse and dispatch one request on its own task.
fn handle_request_frame(server: &GatewayServer, text: &str, out_tx: &mpsc::Sender<WsMessage>) {
    let frame: RequestFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let reply = error_frame("", ErrorCode::ParseError, &format!("invalid frame: {e}"));
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let _ = out_tx.send(WsMessage::Text(reply.to_string().into())).await;
            });
            return;
        }
    };

    let manager = Arc::clone(&server.manager);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let reply = match dispatch(&manager, &frame.kind, frame.payload).await {
            Ok(payload) => response_frame(&frame.request_id, payload),
            Err(failure) => error_frame(&frame.request_id, failure.code, &failure.message),
        };
        let _ = out_tx.send(WsMessage::Text(reply.to_string().into())).await;
    });
}

struct RequestFailure {
    code: ErrorCode,
    message: String,
}

impl RequestFailure {
    fn parse(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ParseError,
            message: message.into(),
        }
    }
}

impl From<EngineError> for RequestFailure {
    fn from(e: EngineError) -> Self {
        Self {
            code: ErrorCode::Engine,
            message: e.to_string(),
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RequestFailure> {
    serde_json::from_value(value).map_err(|e| RequestFailure::parse(format!("bad payload: {e}")))
}

async fn dispatch(
    manager: &Arc<EngineManager>,
    kind: &str,
    raw: Value,
) -> Result<Value, RequestFailure> {
    match kind {
        "engine.list" => Ok(json!({"engines": manager.engines()})),
        "engine.capabilities" => {
            let p: contracts::EnginePayload = payload(raw)?;
            let capabilities = manager.capabilities(&p.engine_type)?;
            Ok(json!({"capabilities": capabilities}))
        }
        "session.list" => {
            let p: contracts::SessionListPayload = payload(raw)?;
            let arg = match (p.engine_type, p.directory) {
                (Some(engine_type), _) => ListSessionsArg::Engine(engine_type),
                (None, Some(directory)) => ListSessionsArg::Directory(directory),
                (None, None) => {
                    return Err(RequestFailure::parse(
                        "session.list needs engineType or directory",
                    ));
                }
            };
            let sessions = manager.list_sessions(arg).await?;
            Ok(json!({"sessions": sessions}))
        }
        "session.create" => {
            let p: contracts::SessionCreatePayload = payload(raw)?;
            let session = manager.create_session(&p.engine_type, &p.directory).await?;
            Ok(json!({"session": session}))
        }
        "session.get" => {
            let p: contracts::SessionIdPayload = payload(raw)?;
            let session = manager.get_session(&p.session_id).await?;
            Ok(json!({"session": session}))
        }
        "session.delete" => {
            let p: contracts::SessionIdPayload = payload(raw)?;
            manager.delete_session(&p.session_id).await?;
            Ok(contracts::OkPayload::value())
        }
        "message.send" => {
            let p: contracts::MessageSendPayload = payload(raw)?;
            let options = agenthub_engines::SendOptions {
                model_id: p.model_id,
                mode_id: p.mode_id,
            };
            let message = manager
                .send_message(&p.session_id, p.content.into_blocks(), options)
                .await?;
            Ok(json!({"message": message}))
        }
        "message.cancel" => {
            let p: contracts::SessionIdPayload = payload(raw)?;
            manager.cancel_message(&p.session_id).await?;
            Ok(contracts::OkPayload::value())
        }
        "message.list" => {
            let p: contracts::SessionIdPayload = payload(raw)?;
            let messages = manager.list_messages(&p.session_id).await?;
            Ok(json!({"messages": messages}))
        }
        "model.list" => {
            let p: contracts::EnginePayload = payload(raw)?;
            let models = manager.list_models(&p.engine_type).await?;
            Ok(json!({"models": models}))
        }
        "model.set" => {
            let p: contracts::ModelSetPayload = payload(raw)?;
            manager.set_model(&p.session_id, &p.model_id).await?;
            Ok(contracts::OkPayload::value())
        }
        "mode.set" => {
            let p: contracts::ModeSetPayload = payload(raw)?;
            manager.set_mode(&p.session_id, &p.mode_id).await?;
            Ok(contracts::OkPayload::value())
        }
        "permission.reply" => {
            let p: contracts::PermissionReplyPayload = payload(raw)?;
            manager
                .reply_permission(
                    &p.permission_id,
                    agenthub_engines::model::PermissionReply {
                        option_id: p.option_id,
                    },
                )
                .await?;
            Ok(contracts::OkPayload::value())
        }
        "project.list" => {
            let projects = manager.list_projects().await?;
            Ok(json!({"projects": projects}))
        }
        "project.setEngine" => {
            let p: contracts::ProjectSetEnginePayload = payload(raw)?;
            manager.set_project_engine(&p.directory, &p.engine_type)?;
            Ok(contracts::OkPayload::value())
        }
        other => Err(RequestFailure {
            code: ErrorCode::UnknownRequest,
            message: format!("unknown request type {other}"),
        }),
    }
}
