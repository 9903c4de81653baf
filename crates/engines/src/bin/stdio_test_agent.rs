//! Minimal stdio agent used only by adapter integration tests.
//!
//! This intentionally does not depend on the adapter's production code
//! paths; it speaks the line-framed JSON-RPC protocol directly (one JSON
//! message per line) and keys its behaviour off the prompt text so tests
//! can drive specific scenarios.

use serde_json::{Value, json};
use std::io::{BufRead as _, StdinLock, Write};

fn main() -> anyhow::Result<()> {
    let mut state = AgentState::new();
    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout().lock();

    let mut line = String::new();
    loop {
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        handle_line(&mut state, &mut stdin, &mut stdout, &line)?;
    }
    Ok(())
}

struct AgentState {
    session_counter: u64,
    reverse_counter: u64,
    /// Prompt id parked by a `hang` prompt, answered on `session/cancel`.
    hung_prompt: Option<Value>,
}

impl AgentState {
    fn new() -> Self {
        Self {
            session_counter: 0,
            reverse_counter: 1000,
            hung_prompt: None,
        }
    }
}

fn write_json_line(out: &mut impl Write, value: &Value) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn jsonrpc_ok(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn jsonrpc_err(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn session_update(session_id: &str, update: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {"sessionId": session_id, "update": update}
    })
}

fn text_chunk(kind: &str, text: &str) -> Value {
    json!({"sessionUpdate": kind, "content": {"type": "text", "text": text}})
}

fn handle_line(
    state: &mut AgentState,
    stdin: &mut StdinLock<'_>,
    out: &mut impl Write,
    line: &str,
) -> anyhow::Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let Ok(msg) = serde_json::from_str::<Value>(line) else {
        return Ok(());
    };
    handle_message(state, stdin, out, &msg)
}

fn handle_message(
    state: &mut AgentState,
    stdin: &mut StdinLock<'_>,
    out: &mut impl Write,
    msg: &Value,
) -> anyhow::Result<()> {
    let Some(method) = msg.get("method").and_then(Value::as_str) else {
        return Ok(());
    };
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    match (method, id) {
        ("initialize", Some(id)) => write_json_line(
            out,
            &jsonrpc_ok(
                &id,
                json!({
                    "protocolVersion": 1,
                    "agentCapabilities": {"loadSession": true},
                    "agentInfo": {"name": "stdio-test-agent", "version": "0.0.1"}
                }),
            ),
        ),
        ("session/new", Some(id)) => {
            state.session_counter += 1;
            write_json_line(
                out,
                &jsonrpc_ok(
                    &id,
                    json!({
                        "sessionId": format!("sess-{}", state.session_counter),
                        "models": {
                            "availableModels": [
                                {"modelId": "fast", "name": "Fast"},
                                {"modelId": "smart", "name": "Smart"}
                            ],
                            "currentModelId": "fast"
                        },
                        "modes": {
                            "availableModes": [
                                {"id": "default", "name": "Default"},
                                {"id": "autopilot", "name": "Autopilot"}
                            ],
                            "currentModeId": "default"
                        }
                    }),
                ),
            )
        }
        ("session/list", Some(id)) => {
            // Directories named "listless" simulate a backend without
            // session listing; everything else returns one old session.
            let cwd = params
                .get("cwd")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if cwd.contains("listless") {
                write_json_line(out, &jsonrpc_err(&id, -32601, "method not found"))
            } else {
                write_json_line(
                    out,
                    &jsonrpc_ok(
                        &id,
                        json!({
                            "sessions": [{
                                "sessionId": "hist-1",
                                "cwd": cwd,
                                "title": "Old session",
                                "createdAt": 100,
                                "updatedAt": 200
                            }]
                        }),
                    ),
                )
            }
        }
        ("session/load", Some(id)) => {
            let session_id = params
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            write_json_line(
                out,
                &session_update(&session_id, text_chunk("user_message_chunk", "Earlier question")),
            )?;
            write_json_line(
                out,
                &session_update(&session_id, text_chunk("agent_message_chunk", "Earlier answer")),
            )?;
            write_json_line(out, &jsonrpc_ok(&id, json!({})))
        }
        ("session/delete", Some(id)) => write_json_line(out, &jsonrpc_ok(&id, json!({}))),
        ("session/prompt", Some(id)) => handle_prompt(state, stdin, out, &id, &params),
        ("session/cancel", None) => {
            if let Some(prompt_id) = state.hung_prompt.take() {
                write_json_line(out, &jsonrpc_ok(&prompt_id, json!({"stopReason": "cancelled"})))?;
            }
            Ok(())
        }
        (_, Some(id)) => write_json_line(out, &jsonrpc_err(&id, -32601, "method not found")),
        (_, None) => Ok(()),
    }
}

fn prompt_text(params: &Value) -> String {
    params
        .get("prompt")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn handle_prompt(
    state: &mut AgentState,
    stdin: &mut StdinLock<'_>,
    out: &mut impl Write,
    id: &Value,
    params: &Value,
) -> anyhow::Result<()> {
    let session_id = params
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let text = prompt_text(params);

    if text.contains("hang") {
        // Park the prompt; only session/cancel releases it.
        state.hung_prompt = Some(id.clone());
        return Ok(());
    }

    if text.contains("use tool") {
        write_json_line(
            out,
            &session_update(&session_id, text_chunk("agent_message_chunk", "Reading ")),
        )?;
        write_json_line(
            out,
            &session_update(
                &session_id,
                json!({
                    "sessionUpdate": "tool_call",
                    "callId": "t1",
                    "title": "Read foo",
                    "kind": "read",
                    "status": "pending"
                }),
            ),
        )?;
        write_json_line(
            out,
            &session_update(
                &session_id,
                json!({
                    "sessionUpdate": "tool_call_update",
                    "callId": "t1",
                    "status": "completed",
                    "rawOutput": {"content": "hi"}
                }),
            ),
        )?;
        return write_json_line(out, &jsonrpc_ok(id, json!({"stopReason": "end_turn"})));
    }

    if text.contains("ask permission") {
        state.reverse_counter += 1;
        let reverse_id = json!(state.reverse_counter);
        write_json_line(
            out,
            &json!({
                "jsonrpc": "2.0",
                "id": reverse_id,
                "method": "session/request_permission",
                "params": {
                    "sessionId": session_id,
                    "toolCall": {"title": "Write x", "kind": "edit"},
                    "options": [
                        {"optionId": "allow_once", "kind": "allow_once", "name": "Allow"},
                        {"optionId": "reject_once", "kind": "reject", "name": "Reject"}
                    ]
                }
            }),
        )?;
        let outcome = wait_for_response(stdin, &reverse_id)?;
        let picked = outcome
            .pointer("/result/outcome/optionId")
            .and_then(Value::as_str)
            .unwrap_or("none");
        write_json_line(
            out,
            &session_update(
                &session_id,
                text_chunk("agent_message_chunk", &format!("Permission: {picked}")),
            ),
        )?;
        return write_json_line(out, &jsonrpc_ok(id, json!({"stopReason": "end_turn"})));
    }

    if let Some(path) = text.strip_prefix("read ") {
        state.reverse_counter += 1;
        let reverse_id = json!(state.reverse_counter);
        write_json_line(
            out,
            &json!({
                "jsonrpc": "2.0",
                "id": reverse_id,
                "method": "fs/read_text_file",
                "params": {"path": path.trim()}
            }),
        )?;
        let outcome = wait_for_response(stdin, &reverse_id)?;
        let content = outcome
            .pointer("/result/content")
            .and_then(Value::as_str)
            .unwrap_or("<error>")
            .to_string();
        write_json_line(
            out,
            &session_update(&session_id, text_chunk("agent_message_chunk", &content)),
        )?;
        return write_json_line(out, &jsonrpc_ok(id, json!({"stopReason": "end_turn"})));
    }

    if let Some(rest) = text.strip_prefix("title ") {
        write_json_line(
            out,
            &session_update(
                &session_id,
                json!({"sessionUpdate": "session_info_update", "title": rest.trim()}),
            ),
        )?;
        return write_json_line(out, &jsonrpc_ok(id, json!({"stopReason": "end_turn"})));
    }

    // Default: stream a three-chunk greeting.
    for chunk in ["Hel", "lo ", "world"] {
        write_json_line(
            out,
            &session_update(&session_id, text_chunk("agent_message_chunk", chunk)),
        )?;
    }
    write_json_line(out, &jsonrpc_ok(id, json!({"stopReason": "end_turn"})))
}

/// Block on stdin until the response for `reverse_id` arrives. Anything
/// else read while waiting is dropped; the tests never interleave other
/// traffic with a parked reverse request.
fn wait_for_response(stdin: &mut StdinLock<'_>, reverse_id: &Value) -> anyhow::Result<Value> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            anyhow::bail!("stdin closed while waiting for reverse response");
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if msg.get("method").is_none() && msg.get("id") == Some(reverse_id) {
            return Ok(msg);
        }
    }
}
