//! Upstream events -> OpenAI-shaped chunks
//!
//! A [`ResponseTranslator`] is the per-request conversion context. It is fed
//! decoded [`KiroEvent`]s in arrival order and produces canonical
//! [`StreamEvent`]s; [`ResponseAggregator`] folds those back into a single
//! response for non-streaming callers.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::error::LlmError;
use crate::protocol::kiro::{CONTENT_LENGTH_EXCEEDED, KiroEvent, ToolUseEvent};
use crate::types::{
    Choice, ChoiceMessage, CompletionResponse, FinishReason, Role, StreamDelta, StreamEvent, StreamToolCall, ToolCall,
    Usage,
};
use crate::usage::UsageBasis;

/// Tool calls the model wrote out as text instead of structured events
static BRACKET_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").unwrap());

/// Argument buffer for one upstream tool use
#[derive(Debug, Default)]
struct ToolBuffer {
    name: String,
    arguments: String,
    emitted: bool,
}

/// Per-request conversion state
#[derive(Debug)]
pub struct ResponseTranslator {
    basis: UsageBasis,
    role_sent: bool,
    content: String,
    last_text: Option<String>,
    tool_calls: IndexMap<String, ToolBuffer>,
    /// Calls handed out so far; its length is the next `OpenAI` call index
    emitted: Vec<ToolCall>,
    length_exceeded: bool,
    finish_reason: Option<FinishReason>,
    context_usage_percentage: Option<f64>,
    credits_used: Option<f64>,
}

impl ResponseTranslator {
    pub fn new(basis: UsageBasis) -> Self {
        Self {
            basis,
            role_sent: false,
            content: String::new(),
            last_text: None,
            tool_calls: IndexMap::new(),
            emitted: Vec::new(),
            length_exceeded: false,
            finish_reason: None,
            context_usage_percentage: None,
            credits_used: None,
        }
    }

    /// Translate one upstream event
    ///
    /// An upstream exception other than the length signal ends translation
    /// with [`LlmError::UpstreamException`].
    pub fn apply(&mut self, event: KiroEvent) -> Result<Vec<StreamEvent>, LlmError> {
        match event {
            KiroEvent::AssistantResponse(event) => {
                if event.content.is_empty() || self.last_text.as_deref() == Some(event.content.as_str()) {
                    return Ok(vec![]);
                }
                self.content.push_str(&event.content);
                let delta = StreamDelta::content(event.content.as_str());
                self.last_text = Some(event.content);
                Ok(vec![self.delta(delta)])
            }
            KiroEvent::ToolUse(event) => Ok(self.tool_use(event).into_iter().collect()),
            KiroEvent::Metering(event) => {
                if event.usage.is_some() {
                    self.credits_used = event.usage;
                }
                Ok(vec![])
            }
            KiroEvent::ContextUsage(event) => {
                self.context_usage_percentage = Some(event.context_usage_percentage);
                Ok(vec![])
            }
            KiroEvent::Exception { kind, message } => {
                if kind == CONTENT_LENGTH_EXCEEDED {
                    tracing::debug!(%message, "upstream output hit its length limit");
                    self.length_exceeded = true;
                    return Ok(vec![]);
                }
                Err(LlmError::UpstreamException { kind, message })
            }
            KiroEvent::Unknown { event_type, payload } => {
                tracing::debug!(%event_type, bytes = payload.len(), "ignoring unrecognised upstream event");
                Ok(vec![])
            }
        }
    }

    /// Close the response: pending tool calls, finish reason, usage, done
    ///
    /// Calling it again yields nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finish_reason.is_some() {
            return vec![];
        }

        let mut events = Vec::new();

        let pending: Vec<usize> = (0..self.tool_calls.len())
            .filter(|&i| self.tool_calls.get_index(i).is_some_and(|(_, buffer)| !buffer.emitted))
            .collect();
        for slot in pending {
            events.extend(self.emit_tool_call(slot));
        }

        for (name, arguments) in bracket_calls(&self.content) {
            let duplicate = self
                .emitted
                .iter()
                .any(|call| call.function.name == name && call.function.arguments == arguments);
            if duplicate {
                continue;
            }

            let call = ToolCall::new(generate_call_id(), name, arguments);
            tracing::debug!(tool = %call.function.name, "recovered tool call from assistant text");
            events.push(self.emit(call));
        }

        let reason = if !self.emitted.is_empty() {
            FinishReason::ToolCalls
        } else if self.length_exceeded {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };
        self.finish_reason = Some(reason);

        events.push(self.delta(StreamDelta::finish(reason)));
        events.push(StreamEvent::Usage(self.basis.usage(
            &self.content,
            self.context_usage_percentage,
            self.credits_used,
        )));
        events.push(StreamEvent::Done);
        events
    }

    fn tool_use(&mut self, event: ToolUseEvent) -> Option<StreamEvent> {
        let tool_use_id = if event.tool_use_id.is_empty() {
            // Nameless fragments without an id can only continue the latest call
            self.tool_calls.last().map(|(id, _)| id.clone()).unwrap_or_default()
        } else {
            event.tool_use_id
        };

        let entry = self.tool_calls.entry(tool_use_id.clone());
        let slot = entry.index();
        let buffer = entry.or_default();

        if buffer.emitted {
            tracing::warn!(%tool_use_id, "tool use event after its stop, ignoring");
            return None;
        }

        if let Some(name) = event.name.filter(|name| !name.is_empty()) {
            if buffer.name.is_empty() {
                buffer.name = name;
            } else if buffer.name != name {
                tracing::warn!(
                    %tool_use_id,
                    first = %buffer.name,
                    conflicting = %name,
                    "conflicting tool name for one tool use, keeping the first"
                );
            }
        }

        match event.input {
            Some(serde_json::Value::String(fragment)) => buffer.arguments.push_str(&fragment),
            Some(serde_json::Value::Null) | None => {}
            Some(value) => buffer.arguments.push_str(&value.to_string()),
        }

        if event.stop { self.emit_tool_call(slot) } else { None }
    }

    fn emit_tool_call(&mut self, slot: usize) -> Option<StreamEvent> {
        let (id, buffer) = self.tool_calls.get_index_mut(slot)?;
        buffer.emitted = true;

        if buffer.name.is_empty() {
            tracing::warn!(tool_use_id = %id, "dropping tool call without a name");
            return None;
        }

        let id = if id.is_empty() { generate_call_id() } else { id.clone() };
        let call = ToolCall::new(id, buffer.name.clone(), finalize_arguments(&buffer.arguments));
        Some(self.emit(call))
    }

    /// Hand out a complete call under the next free index
    fn emit(&mut self, call: ToolCall) -> StreamEvent {
        let index = u32::try_from(self.emitted.len()).unwrap_or(u32::MAX);
        self.emitted.push(call.clone());
        self.delta(StreamDelta {
            tool_call: Some(StreamToolCall { index, call }),
            ..StreamDelta::default()
        })
    }

    /// Wrap a delta, marking the first one with the assistant role
    fn delta(&mut self, mut delta: StreamDelta) -> StreamEvent {
        if !self.role_sent {
            delta.role = Some(Role::Assistant);
            self.role_sent = true;
        }
        StreamEvent::Delta(delta)
    }
}

/// Accumulated arguments as a JSON object string
///
/// Truncated objects get their missing closing braces; anything still
/// unparseable becomes `{}`.
fn finalize_arguments(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "{}".to_owned();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        return value.to_string();
    }

    let open = raw.matches('{').count();
    let close = raw.matches('}').count();
    if open > close {
        let repaired = format!("{raw}{}", "}".repeat(open - close));
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&repaired) {
            return value.to_string();
        }
    }

    tracing::warn!(arguments = raw, "unparseable tool arguments, substituting an empty object");
    "{}".to_owned()
}

/// `(name, arguments)` for every `[Called name with args: {...}]` in `text`
fn bracket_calls(text: &str) -> Vec<(String, String)> {
    let mut calls: Vec<(String, String)> = Vec::new();

    for captures in BRACKET_CALL.captures_iter(text) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let rest = &text[whole.end()..];
        let Some(end) = matching_brace(rest) else {
            continue;
        };

        let call = (name.as_str().to_owned(), finalize_arguments(&rest[..=end]));
        if !calls.contains(&call) {
            calls.push(call);
        }
    }

    calls
}

/// Byte offset of the brace closing the object `text` starts with
fn matching_brace(text: &str) -> Option<usize> {
    if !text.starts_with('{') {
        return None;
    }

    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn generate_call_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &id[..8])
}

/// Folds translated events into one `chat.completion`
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    content: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl ResponseAggregator {
    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Delta(delta) => {
                if let Some(text) = delta.content {
                    self.content.push_str(&text);
                }
                if let Some(tool_call) = delta.tool_call {
                    self.tool_calls.push(tool_call.call);
                }
                if delta.finish_reason.is_some() {
                    self.finish_reason = delta.finish_reason;
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(usage),
            StreamEvent::Done => {}
        }
    }

    pub fn into_response(self, id: String, model: String, created: u64) -> CompletionResponse {
        let content = self.tool_calls.is_empty().then_some(self.content);

        CompletionResponse {
            id,
            created,
            model,
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    content,
                    tool_calls: self.tool_calls,
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}
