//! Integration tests driving `StdioRpcAdapter` against the scripted stdio
//! test agent (a real child process speaking the line protocol).

use agenthub_engines::engine::EngineState;
use agenthub_engines::model::{ContentBlock, EngineType, PartBody, PermissionReply, Role, ToolState};
use agenthub_engines::stdio::{StdioEngineConfig, StdioRpcAdapter};
use agenthub_engines::{EngineAdapter, EngineError, EngineEvent, SendOptions};
use std::time::{Duration, Instant};

fn agent_config() -> StdioEngineConfig {
    StdioEngineConfig::new(
        EngineType::from("test-agent"),
        env!("CARGO_BIN_EXE_agenthub-stdio-test-agent"),
    )
}

async fn running_adapter() -> StdioRpcAdapter {
    let adapter = StdioRpcAdapter::new(agent_config());
    adapter.start().await.expect("start adapter");
    assert_eq!(adapter.state(), EngineState::Running);
    adapter
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn start_is_idempotent_and_reports_agent_info() {
    let adapter = running_adapter().await;
    adapter.start().await.expect("second start is a no-op");

    let info = adapter.info();
    assert_eq!(info.name, "stdio-test-agent");
    assert!(info.capabilities.load_session);

    adapter.stop().await.expect("stop");
    adapter.stop().await.expect("second stop is a no-op");
    assert_eq!(adapter.state(), EngineState::Stopped);
}

#[tokio::test]
async fn streaming_text_accumulates_into_one_ordered_part() {
    let adapter = running_adapter().await;
    let session = adapter
        .create_session("/tmp/streaming")
        .await
        .expect("session");
    let mut rx = adapter.events().subscribe();

    let message = adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text("hi")],
            SendOptions::default(),
        )
        .await
        .expect("send");

    assert_eq!(message.role, Role::Assistant);
    assert!(message.time.completed.is_some());
    assert_eq!(message.parts.len(), 1);
    let PartBody::Text { text } = &message.parts[0].body else {
        panic!("text part expected");
    };
    assert_eq!(text, "Hello world");

    // Exactly three part updates, same part id, text growing in order.
    let updates: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::MessagePartUpdated { part } if part.message_id == message.id => {
                match part.body {
                    PartBody::Text { text } => Some(text),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec!["Hel", "Hello ", "Hello world"]);

    let history = adapter.list_messages(&session.id).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert!(history[0].id < history[1].id, "message ids sort by creation");
}

#[tokio::test]
async fn tool_lifecycle_closes_the_open_text_part() {
    let adapter = running_adapter().await;
    let session = adapter.create_session("/tmp/tools").await.expect("session");

    let message = adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text("use tool")],
            SendOptions::default(),
        )
        .await
        .expect("send");

    assert_eq!(message.parts.len(), 2);
    let PartBody::Text { text } = &message.parts[0].body else {
        panic!("leading text part expected");
    };
    assert_eq!(text, "Reading ");

    let PartBody::Tool {
        call_id,
        title,
        state,
        ..
    } = &message.parts[1].body
    else {
        panic!("tool part expected");
    };
    assert_eq!(call_id, "t1");
    assert_eq!(title, "Read foo");
    let ToolState::Completed { output, .. } = state else {
        panic!("completed tool expected, got {state:?}");
    };
    assert_eq!(output, &serde_json::json!("hi"));

    assert!(
        message.parts[0].id < message.parts[1].id,
        "part ids sort by arrival"
    );
}

#[tokio::test]
async fn permission_round_trip_selects_an_option() {
    let adapter = std::sync::Arc::new(running_adapter().await);
    let session = adapter.create_session("/tmp/perm").await.expect("session");
    let mut rx = adapter.events().subscribe();

    let send_task = {
        let adapter = std::sync::Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("ask permission")],
                    SendOptions::default(),
                )
                .await
        })
    };

    // Wait for the reverse request to surface as permission.asked.
    let permission = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::PermissionAsked { permission }) = rx.recv().await {
                return permission;
            }
        }
    })
    .await
    .expect("permission asked");
    assert_eq!(permission.title, "Write x");
    assert_eq!(permission.options.len(), 2);

    adapter
        .reply_permission(
            &permission.id,
            PermissionReply {
                option_id: Some("allow_once".to_string()),
            },
        )
        .await
        .expect("reply");

    let message = send_task.await.expect("join").expect("send");
    let PartBody::Text { text } = &message.parts[0].body else {
        panic!("text part expected");
    };
    assert_eq!(text, "Permission: allow_once");

    // The id was consumed by the first reply.
    let err = adapter
        .reply_permission(&permission.id, PermissionReply::default())
        .await
        .expect_err("second reply fails");
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn cancel_resolves_the_caller_quickly() {
    let adapter = std::sync::Arc::new(running_adapter().await);
    let session = adapter.create_session("/tmp/cancel").await.expect("session");

    let send_task = {
        let adapter = std::sync::Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("hang")],
                    SendOptions::default(),
                )
                .await
        })
    };
    // Let the prompt reach the backend.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    adapter.cancel_message(&session.id).await.expect("cancel");
    let message = tokio::time::timeout(Duration::from_millis(50), send_task)
        .await
        .expect("cancel must unblock the caller within 50ms")
        .expect("join")
        .expect("cancelled sends still resolve");
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(message.error.as_deref(), Some("Cancelled"));
    assert!(message.time.completed.is_some());
}

#[tokio::test]
async fn watchdog_cancels_idle_prompts() {
    let mut config = agent_config();
    config.watchdog_poll = Duration::from_millis(50);
    config.watchdog_idle = Duration::from_millis(250);
    let adapter = StdioRpcAdapter::new(config);
    adapter.start().await.expect("start");
    let session = adapter.create_session("/tmp/watchdog").await.expect("session");

    let started = Instant::now();
    let message = adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text("hang")],
            SendOptions::default(),
        )
        .await
        .expect("watchdog resolves the send");
    assert_eq!(message.error.as_deref(), Some("Cancelled"));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "watchdog should fire well before any RPC deadline"
    );
}

#[tokio::test]
async fn stop_mid_prompt_unblocks_with_error_annotated_message() {
    let adapter = std::sync::Arc::new(running_adapter().await);
    let session = adapter.create_session("/tmp/teardown").await.expect("session");

    let send_task = {
        let adapter = std::sync::Arc::clone(&adapter);
        let session_id = session.id.clone();
        tokio::spawn(async move {
            adapter
                .send_message(
                    &session_id,
                    vec![ContentBlock::text("hang")],
                    SendOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    adapter.stop().await.expect("stop");
    let message = tokio::time::timeout(Duration::from_secs(2), send_task)
        .await
        .expect("stop unblocks the prompt")
        .expect("join")
        .expect("send resolves with an annotated message");
    assert!(message.error.is_some());
    assert!(message.time.completed.is_some());
    assert_eq!(adapter.state(), EngineState::Stopped);
}

#[tokio::test]
async fn reverse_file_read_feeds_content_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("note.txt");
    std::fs::write(&file, "file-content").expect("write");

    let adapter = running_adapter().await;
    let session = adapter.create_session("/tmp/fs").await.expect("session");
    let message = adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text(format!("read {}", file.display()))],
            SendOptions::default(),
        )
        .await
        .expect("send");

    let PartBody::Text { text } = &message.parts[0].body else {
        panic!("text part expected");
    };
    assert_eq!(text, "file-content");
}

#[tokio::test]
async fn session_list_falls_back_when_unsupported() {
    let adapter = running_adapter().await;
    let session = adapter
        .create_session("/tmp/listless-dir")
        .await
        .expect("session");

    let listed = adapter
        .list_sessions(Some("/tmp/listless-dir"))
        .await
        .expect("fallback listing");
    assert!(listed.iter().any(|s| s.id == session.id));
}

#[tokio::test]
async fn history_replay_is_loaded_once_and_silently() {
    let adapter = running_adapter().await;
    let listed = adapter
        .list_sessions(Some("/tmp/replay"))
        .await
        .expect("backend listing");
    let old = listed
        .iter()
        .find(|s| s.id == "hist-1")
        .expect("backend-provided session");
    assert_eq!(old.title, "Old session");

    let mut rx = adapter.events().subscribe();
    let history = adapter.list_messages("hist-1").await.expect("replay");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    let PartBody::Text { text } = &history[0].parts[0].body else {
        panic!("text part expected");
    };
    assert_eq!(text, "Earlier question");

    // Replay must not leak streaming events to clients.
    let leaked = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::MessagePartUpdated { .. }))
        .count();
    assert_eq!(leaked, 0, "replay events must be suppressed");

    // Second call serves the cached history without another load.
    let again = adapter.list_messages("hist-1").await.expect("cached");
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn title_updates_flow_through_session_updated() {
    let adapter = running_adapter().await;
    let session = adapter.create_session("/tmp/title").await.expect("session");
    let mut rx = adapter.events().subscribe();

    adapter
        .send_message(
            &session.id,
            vec![ContentBlock::text("title Renamed by agent")],
            SendOptions::default(),
        )
        .await
        .expect("send");

    let renamed = drain(&mut rx).into_iter().find_map(|event| match event {
        EngineEvent::SessionUpdated { session: updated } if updated.id == session.id => {
            Some(updated.title)
        }
        _ => None,
    });
    assert_eq!(renamed.as_deref(), Some("Renamed by agent"));
}
