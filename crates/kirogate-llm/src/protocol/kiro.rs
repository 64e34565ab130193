//! Upstream (`CodeWhisperer`) JSON payloads
//!
//! The request side is the `generateAssistantResponse` body. The event side
//! are the JSON payloads carried inside binary event-stream frames, keyed by
//! their `:event-type` header.

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::eventstream::{ERROR_CODE, EXCEPTION_TYPE, Frame, ProtocolError};

/// Origin tag the upstream expects on every user turn
pub const ORIGIN: &str = "AI_EDITOR";

/// Exception the upstream raises when output hit the length limit
pub const CONTENT_LENGTH_EXCEEDED: &str = "ContentLengthExceededException";

// -- Request types --

/// Body of a `generateAssistantResponse` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroRequest {
    pub conversation_state: ConversationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

/// Conversation threaded through explicit history turns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

/// One prior turn; the upstream requires user and assistant to alternate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEntry {
    UserInputMessage(UserInputMessage),
    AssistantResponseMessage(AssistantResponseMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<KiroImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<KiroTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<KiroToolResult>,
}

impl UserInputMessageContext {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.tool_results.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<KiroToolUse>,
}

/// Inline image: `format` is the media subtype (`png`, `jpeg`, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KiroImage {
    pub format: String,
    pub source: KiroImageSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KiroImageSource {
    /// Base64 image data
    pub bytes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroTool {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolResult {
    pub content: Vec<KiroText>,
    pub status: String,
    pub tool_use_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KiroText {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroToolUse {
    pub name: String,
    pub input: serde_json::Value,
    pub tool_use_id: String,
}

// -- Model listing --

/// Response of `ListAvailableModels`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KiroModelList {
    #[serde(default)]
    pub models: Vec<KiroModelInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroModelInfo {
    pub model_id: String,
    #[serde(default)]
    pub token_limits: Option<KiroTokenLimits>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroTokenLimits {
    #[serde(default)]
    pub max_input_tokens: Option<u32>,
}

// -- Stream events --

/// Assistant text fragment
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantResponseEvent {
    #[serde(default)]
    pub content: String,
}

/// Tool-use fragment: a start (name and id), an input piece, a stop, or all at once
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    pub tool_use_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Argument text fragment, or a complete object
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeteringEvent {
    /// Credits consumed by the request
    #[serde(default)]
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsageEvent {
    pub context_usage_percentage: f64,
}

#[derive(Debug, Deserialize)]
struct ExceptionBody {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// Typed view of one decoded frame
#[derive(Debug, Clone)]
pub enum KiroEvent {
    AssistantResponse(AssistantResponseEvent),
    ToolUse(ToolUseEvent),
    Metering(MeteringEvent),
    ContextUsage(ContextUsageEvent),
    /// `exception` or `error` message
    Exception { kind: String, message: String },
    /// Event kinds this gateway does not interpret, kept for forward compatibility
    Unknown { event_type: String, payload: bytes::Bytes },
}

impl TryFrom<&Frame> for KiroEvent {
    type Error = LlmError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        match frame.message_type() {
            "exception" | "error" => {
                let kind = frame
                    .header_str(EXCEPTION_TYPE)
                    .or_else(|| frame.header_str(ERROR_CODE))
                    .unwrap_or("UnknownException")
                    .to_owned();
                let message = serde_json::from_slice::<ExceptionBody>(&frame.payload)
                    .ok()
                    .and_then(|body| body.message)
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).into_owned());

                Ok(Self::Exception { kind, message })
            }
            _ => {
                let event_type = frame.event_type().unwrap_or_default();
                let event = match event_type {
                    "assistantResponseEvent" => Self::AssistantResponse(parse(event_type, &frame.payload)?),
                    "toolUseEvent" => Self::ToolUse(parse(event_type, &frame.payload)?),
                    "meteringEvent" => Self::Metering(parse(event_type, &frame.payload)?),
                    "contextUsageEvent" => Self::ContextUsage(parse(event_type, &frame.payload)?),
                    other => Self::Unknown {
                        event_type: other.to_owned(),
                        payload: frame.payload.clone(),
                    },
                };
                Ok(event)
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(event_type: &str, payload: &[u8]) -> Result<T, LlmError> {
    serde_json::from_slice(payload).map_err(|e| {
        LlmError::Protocol(ProtocolError::MalformedPayload {
            event_type: event_type.to_owned(),
            message: e.to_string(),
        })
    })
}
