//! Integration tests driving `HttpStreamAdapter` against an in-process
//! fake backend: axum REST endpoints plus a `/global/event` SSE stream fed
//! by the test.

use agenthub_engines::engine::EngineState;
use agenthub_engines::http::{HttpEngineConfig, HttpStreamAdapter};
use agenthub_engines::model::{ContentBlock, EngineType, PartBody, Role};
use agenthub_engines::{EngineAdapter, EngineEvent, SendOptions};
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone)]
struct FakeBackend {
    events: broadcast::Sender<Value>,
}

impl FakeBackend {
    fn emit(&self, kind: &str, properties: Value) {
        let _ = self
            .events
            .send(json!({"payload": {"type": kind, "properties": properties}}));
    }
}

async fn sse_handler(
    State(backend): State<FakeBackend>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = backend.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(frame) => Some((Ok(Event::default().data(frame.to_string())), rx)),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some((Ok(Event::default().comment("lagged")), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });
    Sse::new(stream)
}

async fn spawn_fake_backend() -> (FakeBackend, String) {
    let (events, _) = broadcast::channel(64);
    let backend = FakeBackend { events };

    let app = Router::new()
        .route(
            "/provider",
            get(|| async { Json(json!({"providers": [{"id": "fake", "models": {"m1": {}}}]})) }),
        )
        .route(
            "/session",
            get(|| async { Json(json!([])) }).post(|| async {
                Json(json!({
                    "id": "s-http-1",
                    "directory": "/work/app",
                    "title": "",
                    "time": {"created": 1, "updated": 1}
                }))
            }),
        )
        .route(
            "/session/{id}/message",
            get(|| async { Json(json!([])) }).post(|| async { Json(json!({})) }),
        )
        .route("/session/{id}/abort", post(|| async { Json(json!({})) }))
        .route("/global/event", get(sse_handler))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (backend, format!("http://{addr}"))
}

async fn attached_adapter(base_url: &str) -> HttpStreamAdapter {
    let mut config = HttpEngineConfig::new(EngineType::from("resty"));
    config.base_url = Some(base_url.to_string());
    config.message_timeout = Duration::from_secs(10);
    let adapter = HttpStreamAdapter::new(config);
    adapter.start().await.expect("start");
    assert_eq!(adapter.state(), EngineState::Running);
    // Give the event loop a beat to open the stream.
    tokio::time::sleep(Duration::from_millis(100)).await;
    adapter
}

fn part_frame(id: &str, text: &str) -> Value {
    json!({
        "part": {
            "id": id,
            "messageID": "msg-a",
            "sessionID": "s-http-1",
            "type": "text",
            "text": text
        }
    })
}

#[tokio::test]
async fn attaches_to_running_backend_and_lists_models() {
    let (_backend, url) = spawn_fake_backend().await;
    let adapter = attached_adapter(&url).await;

    let models = adapter.list_models().await.expect("models");
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "fake/m1");
    assert!(adapter.health_check().await.expect("health"));
}

#[tokio::test]
async fn prompt_completes_from_streamed_events() {
    let (backend, url) = spawn_fake_backend().await;
    let adapter = Arc::new(attached_adapter(&url).await);
    let session = adapter.create_session("/work/app").await.expect("session");
    assert_eq!(session.id, "s-http-1");

    let send_task = {
        let adapter = Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("hello")],
                    SendOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.emit(
        "message.updated",
        json!({"info": {
            "id": "msg-a",
            "sessionID": "s-http-1",
            "role": "assistant",
            "time": {"created": 5}
        }}),
    );
    backend.emit("message.part.updated", part_frame("prt-1", "Hel"));
    backend.emit(
        "message.part.delta",
        json!({
            "sessionID": "s-http-1",
            "messageID": "msg-a",
            "partID": "prt-1",
            "field": "text",
            "delta": "lo world"
        }),
    );
    backend.emit(
        "message.updated",
        json!({"info": {
            "id": "msg-a",
            "sessionID": "s-http-1",
            "role": "assistant",
            "time": {"created": 5, "completed": 9}
        }}),
    );

    let message = tokio::time::timeout(Duration::from_secs(5), send_task)
        .await
        .expect("completes from stream")
        .expect("join")
        .expect("send");
    assert_eq!(message.id, "msg-a");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.time.completed, Some(9));
    assert_eq!(message.parts.len(), 1);
    let PartBody::Text { text } = &message.parts[0].body else {
        panic!("text part expected");
    };
    assert_eq!(text, "Hello world");
}

#[tokio::test]
async fn step_finish_inside_pending_message_completes_the_turn() {
    let (backend, url) = spawn_fake_backend().await;
    let adapter = Arc::new(attached_adapter(&url).await);
    let session = adapter.create_session("/work/app").await.expect("session");

    let send_task = {
        let adapter = Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("hello")],
                    SendOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.emit(
        "message.updated",
        json!({"info": {
            "id": "msg-a",
            "sessionID": "s-http-1",
            "role": "assistant",
            "time": {"created": 5}
        }}),
    );
    backend.emit("message.part.updated", part_frame("prt-1", "done"));
    backend.emit(
        "message.part.updated",
        json!({
            "part": {
                "id": "prt-2",
                "messageID": "msg-a",
                "sessionID": "s-http-1",
                "type": "step-finish"
            }
        }),
    );

    let message = tokio::time::timeout(Duration::from_secs(5), send_task)
        .await
        .expect("step-finish completes the turn")
        .expect("join")
        .expect("send");
    assert_eq!(message.id, "msg-a");
    assert!(message.time.completed.is_some());
}

#[tokio::test]
async fn cancelled_sessions_gate_late_events_until_next_send() {
    let (backend, url) = spawn_fake_backend().await;
    let adapter = Arc::new(attached_adapter(&url).await);
    let session = adapter.create_session("/work/app").await.expect("session");

    let send_task = {
        let adapter = Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("hello")],
                    SendOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    adapter.cancel_message(&session.id).await.expect("cancel");
    let message = tokio::time::timeout(Duration::from_secs(2), send_task)
        .await
        .expect("cancel resolves the send")
        .expect("join")
        .expect("cancelled send still yields a message");
    assert_eq!(message.error.as_deref(), Some("Cancelled"));

    // A late delta from the dead turn must not escape.
    let mut rx = adapter.events().subscribe();
    backend.emit("message.part.updated", part_frame("prt-9", "late"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let leaked = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::MessagePartUpdated { .. }))
        .count();
    assert_eq!(leaked, 0, "cancelled session must drop stream events");
}

#[tokio::test]
async fn message_timeout_resolves_with_error() {
    let (_backend, url) = spawn_fake_backend().await;
    let mut config = HttpEngineConfig::new(EngineType::from("resty"));
    config.base_url = Some(url);
    config.message_timeout = Duration::from_millis(300);
    let adapter = HttpStreamAdapter::new(config);
    adapter.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = adapter.create_session("/work/app").await.expect("session");
    let message = adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text("nobody answers")],
            SendOptions::default(),
        )
        .await
        .expect("timeout still yields a terminal message");
    assert_eq!(message.error.as_deref(), Some("Message timeout"));
    assert!(message.time.completed.is_some());
}
