//! End-to-end WebSocket API tests: a real gateway over the mock engine,
//! driven by a tokio-tungstenite client.

use agenthub_engines::EngineAdapter;
use agenthub_engines::mock::MockAdapter;
use agenthub_gateway::manager::EngineManager;
use agenthub_gateway::server::{GatewayServer, TokenValidator};
use agenthub_gateway::store::SessionStore;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestGateway {
    addr: std::net::SocketAddr,
    mock: Arc<MockAdapter>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn boot(auth_token: Option<&str>) -> TestGateway {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::load_with_debounce(dir.path(), Duration::ZERO).expect("store");
    let manager = EngineManager::new(store);

    let mock = Arc::new(MockAdapter::default());
    manager.register(Arc::clone(&mock) as Arc<dyn EngineAdapter>);
    manager.start_all().await;

    let shutdown = CancellationToken::new();
    let validator: Option<TokenValidator> = auth_token.map(|expected| {
        let expected = expected.to_string();
        Arc::new(move |token: &str| token == expected) as TokenValidator
    });
    let server = GatewayServer::new(Arc::clone(&manager), "/ws", validator, shutdown.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    agenthub_test_support::wait_http_ok(
        &format!("http://{addr}/health"),
        Duration::from_secs(5),
    )
    .await
    .expect("gateway up");

    TestGateway {
        addr,
        mock,
        shutdown,
        _dir: dir,
    }
}

async fn connect(gateway: &TestGateway, token: Option<&str>) -> Client {
    let url = match token {
        Some(token) => format!("ws://{}/ws?token={token}", gateway.addr),
        None => format!("ws://{}/ws", gateway.addr),
    };
    let (client, _) = connect_async(url).await.expect("ws connect");
    client
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Send one request and read until its response arrives; notifications
/// received on the way are returned alongside.
async fn call(client: &mut Client, kind: &str, payload: Value) -> (Value, Vec<Value>) {
    let request_id = format!("req-{}", REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed));
    let frame = json!({"type": kind, "requestId": request_id, "payload": payload});
    client
        .send(WsMsg::Text(frame.to_string().into()))
        .await
        .expect("send request");

    let mut notifications = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("response before timeout")
            .expect("socket open")
            .expect("frame");
        let WsMsg::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
        if value["type"] == "response" && value["requestId"] == request_id.as_str() {
            return (value, notifications);
        }
        notifications.push(value);
    }
}

async fn next_notification(client: &mut Client, topic: &str) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("notification before timeout")
            .expect("socket open")
            .expect("frame");
        let WsMsg::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
        if value["type"] == topic {
            return value;
        }
    }
}

/// Keep reading until every listed topic has been seen at least once
/// (frames already captured count too). Returns everything seen.
async fn await_topics(client: &mut Client, topics: &[&str], seed: Vec<Value>) -> Vec<Value> {
    let mut seen = seed;
    let mut pending: Vec<&str> = topics
        .iter()
        .copied()
        .filter(|t| !seen.iter().any(|n| n["type"] == *t))
        .collect();
    while !pending.is_empty() {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("notification before timeout")
            .expect("socket open")
            .expect("frame");
        let WsMsg::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
        pending.retain(|t| value["type"] != *t);
        seen.push(value);
    }
    seen
}

#[tokio::test]
async fn engine_list_and_math_prompt_round_trip() {
    let gateway = boot(None).await;
    let mut client = connect(&gateway, None).await;

    let (response, _) = call(&mut client, "engine.list", json!({})).await;
    let engines = response["payload"]["engines"]
        .as_array()
        .expect("engine rows");
    assert_eq!(engines.len(), 1);
    assert_eq!(engines[0]["engineType"], "mock");
    assert_eq!(engines[0]["state"], "running");

    let (response, _) = call(
        &mut client,
        "session.create",
        json!({"engineType": "mock", "directory": "/tmp/demo"}),
    )
    .await;
    let session_id = response["payload"]["session"]["id"]
        .as_str()
        .expect("session id")
        .to_string();

    let (response, notifications) = call(
        &mut client,
        "message.send",
        json!({"sessionId": session_id, "content": "2+2"}),
    )
    .await;
    let message = &response["payload"]["message"];
    assert_eq!(message["parts"][0]["type"], "text");
    assert_eq!(message["parts"][0]["text"], "The answer is 4");
    assert!(message["time"]["completed"].is_number());

    // The turn streamed to us; depending on scheduling some frames may
    // trail the response.
    let seen = await_topics(
        &mut client,
        &["message.part.updated", "message.updated"],
        notifications,
    )
    .await;
    assert!(seen.iter().any(|n| n["type"] == "message.part.updated"));
    assert!(seen.iter().any(|n| n["type"] == "message.updated"));

    let (response, _) = call(
        &mut client,
        "message.list",
        json!({"sessionId": session_id}),
    )
    .await;
    let messages = response["payload"]["messages"].as_array().expect("history");
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn title_fallback_renames_default_sessions() {
    let gateway = boot(None).await;
    let mut client = connect(&gateway, None).await;

    let (response, _) = call(
        &mut client,
        "session.create",
        json!({"engineType": "mock", "directory": "/tmp/demo"}),
    )
    .await;
    let session = &response["payload"]["session"];
    let session_id = session["id"].as_str().expect("id").to_string();
    let title = session["title"].as_str().expect("title");
    assert!(title.starts_with("New session"), "default title, got {title}");

    let (_, notifications) = call(
        &mut client,
        "message.send",
        json!({"sessionId": session_id, "content": "Fix the login bug"}),
    )
    .await;

    let seen = await_topics(&mut client, &["session.updated"], notifications).await;
    let renamed = seen.iter().find(|n| {
        n["type"] == "session.updated"
            && n["payload"]["session"]["title"] == "Fix the login bug"
    });
    assert!(renamed.is_some(), "title fallback notification expected");
}

#[tokio::test]
async fn permission_reply_routes_once_over_the_wire() {
    let gateway = boot(None).await;
    let mut client = connect(&gateway, None).await;

    let (response, _) = call(
        &mut client,
        "session.create",
        json!({"engineType": "mock", "directory": "/tmp/demo"}),
    )
    .await;
    let session_id = response["payload"]["session"]["id"]
        .as_str()
        .expect("id")
        .to_string();

    let permission = gateway.mock.raise_permission(&session_id, "Write x");
    let asked = next_notification(&mut client, "permission.asked").await;
    assert_eq!(asked["payload"]["permission"]["id"], permission.id.as_str());
    assert_eq!(asked["payload"]["permission"]["title"], "Write x");

    let (response, _) = call(
        &mut client,
        "permission.reply",
        json!({"permissionId": permission.id, "optionId": "allow_once"}),
    )
    .await;
    assert_eq!(response["payload"]["ok"], true);

    let (response, _) = call(
        &mut client,
        "permission.reply",
        json!({"permissionId": permission.id, "optionId": "allow_once"}),
    )
    .await;
    assert_eq!(response["error"]["code"], "ENGINE_ERROR");
}

#[tokio::test]
async fn unknown_request_types_are_rejected() {
    let gateway = boot(None).await;
    let mut client = connect(&gateway, None).await;

    let (response, _) = call(&mut client, "no.such.request", json!({})).await;
    assert_eq!(response["error"]["code"], "UNKNOWN_REQUEST");

    let (response, _) = call(&mut client, "session.list", json!({})).await;
    assert_eq!(response["error"]["code"], "PARSE_ERROR");
}

#[tokio::test]
async fn query_token_authenticates_the_handshake() {
    let gateway = boot(Some("sekret")).await;

    let mut client = connect(&gateway, Some("sekret")).await;
    let (response, _) = call(&mut client, "engine.list", json!({})).await;
    assert!(response["payload"]["engines"].is_array());
}

#[tokio::test]
async fn bad_token_closes_with_4001() {
    let gateway = boot(Some("sekret")).await;
    let mut client = connect(&gateway, Some("wrong")).await;

    let close_code = loop {
        match client.next().await {
            Some(Ok(WsMsg::Close(frame))) => break frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break None,
        }
    };
    assert_eq!(close_code, Some(4001));
}

#[tokio::test]
async fn auth_frame_authenticates_after_handshake() {
    let gateway = boot(Some("sekret")).await;
    let mut client = connect(&gateway, None).await;

    let frame = json!({"type": "auth", "token": "sekret", "requestId": "auth-1"});
    client
        .send(WsMsg::Text(frame.to_string().into()))
        .await
        .expect("send auth");
    let ack = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("ack timely")
            .expect("open")
            .expect("frame");
        if let WsMsg::Text(text) = message {
            break serde_json::from_str::<Value>(text.as_str()).expect("json");
        }
    };
    assert_eq!(ack["requestId"], "auth-1");
    assert_eq!(ack["payload"]["ok"], true);

    let (response, _) = call(&mut client, "engine.list", json!({})).await;
    assert!(response["payload"]["engines"].is_array());
}

#[tokio::test]
async fn wrong_auth_frame_closes_with_4001() {
    let gateway = boot(Some("sekret")).await;
    let mut client = connect(&gateway, None).await;

    let frame = json!({"type": "auth", "token": "wrong"});
    client
        .send(WsMsg::Text(frame.to_string().into()))
        .await
        .expect("send auth");
    let close_code = loop {
        match client.next().await {
            Some(Ok(WsMsg::Close(frame))) => break frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break None,
        }
    };
    assert_eq!(close_code, Some(4001));
}
