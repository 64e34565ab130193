use super::message::Message;
use super::tool::{ToolChoice, ToolDefinition};

/// Validated chat completion request
///
/// Sampling parameters are dropped during validation since the upstream
/// has no equivalent for them.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model name as the caller sent it
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub stream: bool,
}

impl CompletionRequest {
    /// Tools the upstream should see after applying `tool_choice`
    pub fn effective_tools(&self) -> &[ToolDefinition] {
        match &self.tool_choice {
            Some(ToolChoice::None) => &[],
            Some(ToolChoice::Function(name)) => self
                .tools
                .iter()
                .position(|tool| &tool.name == name)
                .map_or(&[][..], |i| &self.tools[i..=i]),
            Some(ToolChoice::Auto | ToolChoice::Required) | None => &self.tools,
        }
    }
}
