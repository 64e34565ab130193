use super::message::{Role, ToolCall};
use super::response::{FinishReason, Usage};

/// One outward event of a translated response
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental content delta
    Delta(StreamDelta),
    /// Final usage statistics, sent once after the last delta
    Usage(Usage),
    /// Stream has completed
    Done,
}

/// Incremental update within a streaming response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    /// Present on the first delta only
    pub role: Option<Role>,
    pub content: Option<String>,
    pub tool_call: Option<StreamToolCall>,
    /// Present on the final delta only
    pub finish_reason: Option<FinishReason>,
}

impl StreamDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Completed tool call placed at its position in the `tool_calls` array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamToolCall {
    pub index: u32,
    pub call: ToolCall,
}
