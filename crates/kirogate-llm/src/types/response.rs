use serde::{Deserialize, Serialize};

use super::message::ToolCall;

/// Reason the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Upstream signalled that output hit its length limit
    Length,
    ToolCalls,
}

impl FinishReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Upstream credits reported by a metering event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_used: Option<f64>,
}

/// A single completion choice
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: ChoiceMessage,
    pub finish_reason: Option<FinishReason>,
}

/// Assistant message within a response choice
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceMessage {
    /// Absent when the turn ended in tool calls
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Aggregated (non-streaming) completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// `chatcmpl-` prefixed identifier
    pub id: String,
    /// Unix timestamp of creation
    pub created: u64,
    /// Model name as the caller requested it
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}
