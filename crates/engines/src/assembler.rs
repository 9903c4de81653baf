//! Streaming aggregation: backend deltas in, canonical parts out.
//!
//! [`MessageBuffer`] is a pure state machine guarded by the owning
//! adapter's lock; it never does I/O and never emits events itself. Each
//! mutation returns the part that changed so the adapter can publish
//! `message.part.updated` (or suppress it during history replay).

use crate::ids;
use crate::model::{
    Message, MessageTime, Part, PartBody, Role, TokenUsage, ToolLocation, ToolState,
    ToolTimeRange, ToolTimeStart,
};
use serde_json::Value;

/// Lifecycle phase reported by a backend for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A new tool call observed in the stream.
#[derive(Debug, Clone)]
pub struct ToolStart {
    pub call_id: String,
    pub title: String,
    pub kind: Option<String>,
    pub normalized_tool: Option<String>,
    pub original_tool: Option<String>,
    pub input: Option<Value>,
    pub phase: ToolPhase,
    pub locations: Option<Vec<ToolLocation>>,
    pub diff: Option<String>,
}

/// A follow-up for an existing tool call, located by `call_id`.
#[derive(Debug, Clone, Default)]
pub struct ToolUpdate {
    pub call_id: String,
    pub phase: Option<ToolPhase>,
    pub title: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub locations: Option<Vec<ToolLocation>>,
    pub diff: Option<String>,
}

/// Accumulates one in-flight message from streaming deltas.
#[derive(Debug)]
pub struct MessageBuffer {
    message_id: String,
    session_id: String,
    role: Role,
    created: i64,
    parts: Vec<Part>,
    text: String,
    text_part_id: Option<String>,
    reasoning: String,
    reasoning_part_id: Option<String>,
    tokens: Option<TokenUsage>,
    cost: Option<f64>,
    model_id: Option<String>,
    mode: Option<String>,
    error: Option<String>,
}

impl MessageBuffer {
    #[must_use]
    pub fn new(session_id: &str, role: Role, now: i64) -> Self {
        Self {
            message_id: ids::message_id(),
            session_id: session_id.to_string(),
            role,
            created: now,
            parts: Vec::new(),
            text: String::new(),
            text_part_id: None,
            reasoning: String::new(),
            reasoning_part_id: None,
            tokens: None,
            cost: None,
            model_id: None,
            mode: None,
            error: None,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.text.is_empty() && self.reasoning.is_empty()
    }

    pub fn set_model(&mut self, model_id: impl Into<String>) {
        self.model_id = Some(model_id.into());
    }

    pub fn set_mode(&mut self, mode: impl Into<String>) {
        self.mode = Some(mode.into());
    }

    pub fn set_usage(&mut self, tokens: Option<TokenUsage>, cost: Option<f64>) {
        if tokens.is_some() {
            self.tokens = tokens;
        }
        if cost.is_some() {
            self.cost = cost;
        }
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    /// Append a text delta, upserting the open text part.
    pub fn append_text(&mut self, delta: &str) -> Part {
        self.text.push_str(delta);
        let accumulated = self.text.clone();
        let part_id = match &self.text_part_id {
            Some(id) => id.clone(),
            None => {
                let id = ids::part_id();
                self.text_part_id = Some(id.clone());
                self.parts.push(self.make_part(
                    id.clone(),
                    PartBody::Text {
                        text: String::new(),
                    },
                ));
                id
            }
        };
        self.replace_body(&part_id, PartBody::Text { text: accumulated })
    }

    /// Append a reasoning delta; symmetrical with [`Self::append_text`].
    pub fn append_reasoning(&mut self, delta: &str) -> Part {
        self.reasoning.push_str(delta);
        let accumulated = self.reasoning.clone();
        let part_id = match &self.reasoning_part_id {
            Some(id) => id.clone(),
            None => {
                let id = ids::part_id();
                self.reasoning_part_id = Some(id.clone());
                self.parts.push(self.make_part(
                    id.clone(),
                    PartBody::Reasoning {
                        text: String::new(),
                    },
                ));
                id
            }
        };
        self.replace_body(&part_id, PartBody::Reasoning { text: accumulated })
    }

    /// Close the open text/reasoning parts. The finalised parts stay in
    /// the message; the next delta starts a fresh part.
    pub fn flush_accumulators(&mut self) {
        self.text.clear();
        self.text_part_id = None;
        self.reasoning.clear();
        self.reasoning_part_id = None;
    }

    /// Register a tool call. Flushes both accumulators first so the tool
    /// part lands after the finalised text. A duplicate `call_id` is
    /// treated as an update.
    pub fn tool_start(&mut self, start: ToolStart, now: i64) -> Part {
        self.flush_accumulators();

        if self.find_tool(&start.call_id).is_some() {
            let update = ToolUpdate {
                call_id: start.call_id.clone(),
                phase: Some(start.phase),
                title: Some(start.title),
                input: start.input,
                locations: start.locations,
                diff: start.diff,
                ..ToolUpdate::default()
            };
            if let Some(part) = self.tool_update(update, now) {
                return part;
            }
            // Terminal part resisted the update; return its current shape.
            let idx = self.find_tool(&start.call_id).expect("tool part exists");
            return self.parts[idx].clone();
        }

        let state = match start.phase {
            ToolPhase::Running => ToolState::Running {
                input: start.input,
                time: ToolTimeStart { start: now },
            },
            ToolPhase::Completed => ToolState::Completed {
                input: start.input,
                time: ToolTimeRange {
                    start: now,
                    end: now,
                    duration: 0,
                },
                output: Value::Null,
            },
            ToolPhase::Failed => ToolState::Error {
                input: start.input,
                time: ToolTimeRange {
                    start: now,
                    end: now,
                    duration: 0,
                },
                error: "Tool failed".to_string(),
            },
            ToolPhase::Pending => ToolState::Pending { input: start.input },
        };

        let part = self.make_part(
            ids::part_id(),
            PartBody::Tool {
                call_id: start.call_id,
                normalized_tool: start.normalized_tool,
                original_tool: start.original_tool,
                title: start.title,
                kind: start.kind,
                state,
                locations: start.locations,
                diff: start.diff,
            },
        );
        self.parts.push(part.clone());
        part
    }

    /// Apply a tool update. Returns `None` when the call id is unknown or
    /// the part is already terminal (terminal states are never re-entered).
    pub fn tool_update(&mut self, update: ToolUpdate, now: i64) -> Option<Part> {
        let idx = self.find_tool(&update.call_id)?;
        let PartBody::Tool {
            title,
            state,
            locations,
            diff,
            ..
        } = &mut self.parts[idx].body
        else {
            return None;
        };

        if state.is_terminal() {
            return None;
        }

        let update_input_was_some = update.input.is_some();
        let input = update.input.or_else(|| state.input().cloned());
        let started = state.started_at().unwrap_or(now);

        if let Some(phase) = update.phase {
            *state = match phase {
                ToolPhase::Pending => ToolState::Pending { input },
                ToolPhase::Running => ToolState::Running {
                    input,
                    time: ToolTimeStart { start: started },
                },
                ToolPhase::Completed => ToolState::Completed {
                    input,
                    time: ToolTimeRange {
                        start: started,
                        end: now,
                        duration: now - started,
                    },
                    output: update.output.unwrap_or(Value::Null),
                },
                ToolPhase::Failed => ToolState::Error {
                    input,
                    time: ToolTimeRange {
                        start: started,
                        end: now,
                        duration: now - started,
                    },
                    error: update
                        .error
                        .unwrap_or_else(|| "Tool failed".to_string()),
                },
            };
        } else if update_input_was_some {
            let refreshed = match &*state {
                ToolState::Pending { .. } => ToolState::Pending { input },
                ToolState::Running { time, .. } => ToolState::Running { input, time: *time },
                terminal => terminal.clone(),
            };
            *state = refreshed;
        }

        if let Some(t) = update.title {
            *title = t;
        }
        if update.locations.is_some() {
            *locations = update.locations;
        }
        if update.diff.is_some() {
            *diff = update.diff;
        }

        Some(self.parts[idx].clone())
    }

    /// Mark the beginning of a turn.
    pub fn step_start(&mut self) -> Part {
        let part = self.make_part(ids::part_id(), PartBody::StepStart);
        self.parts.push(part.clone());
        part
    }

    /// Mark the end of a turn; flushes accumulators first.
    pub fn step_finish(&mut self) -> Part {
        self.flush_accumulators();
        let part = self.make_part(ids::part_id(), PartBody::StepFinish);
        self.parts.push(part.clone());
        part
    }

    /// Seal the buffer into a terminal message: flush accumulators, force
    /// any non-terminal tool part to `completed` with a null output, stamp
    /// `time.completed`.
    #[must_use]
    pub fn finalize(mut self, now: i64, error: Option<String>) -> Message {
        self.flush_accumulators();

        for part in &mut self.parts {
            if let PartBody::Tool { state, .. } = &mut part.body
                && !state.is_terminal()
            {
                let started = state.started_at().unwrap_or(now);
                *state = ToolState::Completed {
                    input: state.input().cloned(),
                    time: ToolTimeRange {
                        start: started,
                        end: now,
                        duration: now - started,
                    },
                    output: Value::Null,
                };
            }
        }

        Message {
            id: self.message_id,
            session_id: self.session_id,
            role: self.role,
            parts: self.parts,
            time: MessageTime {
                created: self.created,
                completed: Some(now),
            },
            tokens: self.tokens,
            cost: self.cost,
            model_id: self.model_id,
            mode: self.mode,
            error: error.or(self.error),
        }
    }

    fn make_part(&self, id: String, body: PartBody) -> Part {
        Part {
            id,
            message_id: self.message_id.clone(),
            session_id: self.session_id.clone(),
            body,
        }
    }

    fn replace_body(&mut self, part_id: &str, body: PartBody) -> Part {
        let part = self
            .parts
            .iter_mut()
            .find(|p| p.id == part_id)
            .expect("open accumulator part exists");
        part.body = body;
        part.clone()
    }

    fn find_tool(&self, call_id: &str) -> Option<usize> {
        self.parts.iter().position(|p| {
            matches!(&p.body, PartBody::Tool { call_id: existing, .. } if existing == call_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(part: &Part) -> &str {
        match &part.body {
            PartBody::Text { text } | PartBody::Reasoning { text } => text,
            other => panic!("expected text-ish part, got {other:?}"),
        }
    }

    #[test]
    fn text_deltas_accumulate_into_one_part() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        let a = buf.append_text("Hel");
        let b = buf.append_text("lo ");
        let c = buf.append_text("world");

        assert_eq!(a.id, b.id);
        assert_eq!(b.id, c.id);
        assert_eq!(text_of(&c), "Hello world");

        let message = buf.finalize(2000, None);
        assert_eq!(message.parts.len(), 1);
        assert_eq!(text_of(&message.parts[0]), "Hello world");
        assert_eq!(message.time.completed, Some(2000));
    }

    #[test]
    fn tool_start_closes_the_open_text_part() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.append_text("Reading ");
        buf.tool_start(
            ToolStart {
                call_id: "t1".into(),
                title: "Read foo".into(),
                kind: Some("read".into()),
                normalized_tool: None,
                original_tool: None,
                input: None,
                phase: ToolPhase::Running,
                locations: None,
                diff: None,
            },
            1100,
        );
        // Text after the tool call must land in a fresh part.
        let later = buf.append_text("done");
        assert_eq!(text_of(&later), "done");

        let message = buf.finalize(1200, None);
        assert_eq!(message.parts.len(), 3);
        assert_eq!(text_of(&message.parts[0]), "Reading ");
        assert!(matches!(message.parts[1].body, PartBody::Tool { .. }));
        assert_eq!(text_of(&message.parts[2]), "done");
    }

    #[test]
    fn tool_lifecycle_transitions_and_carries_output() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.tool_start(
            ToolStart {
                call_id: "t1".into(),
                title: "Read foo".into(),
                kind: Some("read".into()),
                normalized_tool: None,
                original_tool: None,
                input: Some(serde_json::json!({"path": "foo"})),
                phase: ToolPhase::Pending,
                locations: None,
                diff: None,
            },
            1000,
        );

        let running = buf
            .tool_update(
                ToolUpdate {
                    call_id: "t1".into(),
                    phase: Some(ToolPhase::Running),
                    ..ToolUpdate::default()
                },
                1010,
            )
            .expect("running update");
        let PartBody::Tool { state, .. } = &running.body else {
            panic!("tool part expected");
        };
        assert!(matches!(state, ToolState::Running { .. }));

        let completed = buf
            .tool_update(
                ToolUpdate {
                    call_id: "t1".into(),
                    phase: Some(ToolPhase::Completed),
                    output: Some(serde_json::json!({"content": "hi"})),
                    ..ToolUpdate::default()
                },
                1050,
            )
            .expect("completed update");
        let PartBody::Tool { state, .. } = &completed.body else {
            panic!("tool part expected");
        };
        let ToolState::Completed {
            input,
            time,
            output,
        } = state
        else {
            panic!("completed state expected, got {state:?}");
        };
        assert_eq!(input.as_ref().unwrap()["path"], "foo");
        assert_eq!(time.start, 1010);
        assert_eq!(time.end, 1050);
        assert_eq!(time.duration, 40);
        assert_eq!(output["content"], "hi");
    }

    #[test]
    fn terminal_tool_parts_are_never_reentered() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.tool_start(
            ToolStart {
                call_id: "t1".into(),
                title: "Run".into(),
                kind: None,
                normalized_tool: None,
                original_tool: None,
                input: None,
                phase: ToolPhase::Completed,
                locations: None,
                diff: None,
            },
            1000,
        );
        let revived = buf.tool_update(
            ToolUpdate {
                call_id: "t1".into(),
                phase: Some(ToolPhase::Running),
                ..ToolUpdate::default()
            },
            1100,
        );
        assert!(revived.is_none());
    }

    #[test]
    fn finalize_forces_open_tools_to_completed_null() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.tool_start(
            ToolStart {
                call_id: "t1".into(),
                title: "Slow".into(),
                kind: None,
                normalized_tool: None,
                original_tool: None,
                input: None,
                phase: ToolPhase::Running,
                locations: None,
                diff: None,
            },
            1000,
        );
        let message = buf.finalize(1500, Some("Cancelled".into()));
        let PartBody::Tool { state, .. } = &message.parts[0].body else {
            panic!("tool part expected");
        };
        let ToolState::Completed { output, time, .. } = state else {
            panic!("forced completion expected, got {state:?}");
        };
        assert_eq!(*output, Value::Null);
        assert_eq!(time.start, 1000);
        assert_eq!(time.end, 1500);
        assert_eq!(message.error.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn part_ids_are_ordered_by_arrival() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.append_text("a");
        buf.tool_start(
            ToolStart {
                call_id: "t1".into(),
                title: "x".into(),
                kind: None,
                normalized_tool: None,
                original_tool: None,
                input: None,
                phase: ToolPhase::Pending,
                locations: None,
                diff: None,
            },
            1001,
        );
        buf.append_text("b");
        let message = buf.finalize(1002, None);
        let ids: Vec<&str> = message.parts.iter().map(|p| p.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "arrival order must equal id order");
    }

    #[test]
    fn step_finish_flushes_text() {
        let mut buf = MessageBuffer::new("s1", Role::Assistant, 1000);
        buf.step_start();
        buf.append_text("turn one");
        buf.step_finish();
        let fresh = buf.append_text("turn two");
        assert_eq!(text_of(&fresh), "turn two");

        let message = buf.finalize(1100, None);
        assert!(matches!(message.parts[0].body, PartBody::StepStart));
        assert!(matches!(message.parts[2].body, PartBody::StepFinish));
        assert_eq!(message.parts.len(), 4);
    }
}
