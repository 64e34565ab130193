//! Conversion between internal types and `OpenAI` wire format
//!
//! Inbound conversion is fallible: anything the upstream cannot carry is
//! rejected with `LlmError::Validation` instead of being dropped.

use base64::Engine as _;

use crate::error::LlmError;
use crate::protocol::openai::{
    OpenAiChoice, OpenAiChoiceMessage, OpenAiContent, OpenAiContentPart, OpenAiMessage, OpenAiRequest,
    OpenAiResponse, OpenAiStreamChoice, OpenAiStreamChunk, OpenAiStreamDelta, OpenAiStreamToolCall, OpenAiTool,
    OpenAiToolCall, OpenAiUsage,
};
use crate::types::{
    Choice, CompletionRequest, CompletionResponse, Content, ContentPart, FinishReason, ImageData, Message, Role,
    StreamDelta, ToolCall, ToolChoice, ToolDefinition, Usage,
};

/// Image media types the upstream accepts
const IMAGE_FORMATS: &[&str] = &["png", "jpeg", "gif", "webp"];

// -- Inbound: OpenAI wire format -> internal types --

impl TryFrom<OpenAiRequest> for CompletionRequest {
    type Error = LlmError;

    fn try_from(req: OpenAiRequest) -> Result<Self, Self::Error> {
        if req.messages.is_empty() {
            return Err(LlmError::Validation("messages must not be empty".to_owned()));
        }

        let messages = req
            .messages
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let tools = req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(ToolDefinition::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let tool_choice = req.tool_choice.as_ref().map(parse_tool_choice).transpose()?;
        if let Some(ToolChoice::Function(name)) = &tool_choice
            && !tools.iter().any(|tool| &tool.name == name)
        {
            return Err(LlmError::Validation(format!(
                "tool_choice names function '{name}' which is not among the provided tools"
            )));
        }

        Ok(Self {
            model: req.model,
            messages,
            tools,
            tool_choice,
            stream: req.stream.unwrap_or(false),
        })
    }
}

impl TryFrom<OpenAiMessage> for Message {
    type Error = LlmError;

    fn try_from(msg: OpenAiMessage) -> Result<Self, Self::Error> {
        let role = match msg.role.as_str() {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => return Err(LlmError::Validation(format!("unsupported message role '{other}'"))),
        };

        if role == Role::Tool && msg.tool_call_id.is_none() {
            return Err(LlmError::Validation("tool message is missing tool_call_id".to_owned()));
        }

        let content = match msg.content {
            Some(OpenAiContent::Text(text)) => Content::Text(text),
            Some(OpenAiContent::Parts(parts)) => Content::Parts(
                parts
                    .into_iter()
                    .map(ContentPart::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => Content::Text(String::new()),
        };

        let tool_calls = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        Ok(Self {
            role,
            content,
            name: msg.name,
            tool_calls,
            tool_call_id: msg.tool_call_id,
        })
    }
}

impl TryFrom<OpenAiContentPart> for ContentPart {
    type Error = LlmError;

    fn try_from(part: OpenAiContentPart) -> Result<Self, Self::Error> {
        match part {
            OpenAiContentPart::Text { text } => Ok(Self::Text(text)),
            OpenAiContentPart::ImageUrl { image_url } => parse_data_uri(&image_url.url).map(Self::Image),
            OpenAiContentPart::Unsupported => Err(LlmError::Validation(
                "unsupported content part; only text and image_url are accepted".to_owned(),
            )),
        }
    }
}

impl TryFrom<OpenAiTool> for ToolDefinition {
    type Error = LlmError;

    fn try_from(tool: OpenAiTool) -> Result<Self, Self::Error> {
        if tool.kind != "function" {
            return Err(LlmError::Validation(format!("unsupported tool type '{}'", tool.kind)));
        }
        if tool.function.name.is_empty() {
            return Err(LlmError::Validation("tool function name must not be empty".to_owned()));
        }

        let parameters = match tool.function.parameters {
            None | Some(serde_json::Value::Null) => serde_json::json!({ "type": "object", "properties": {} }),
            Some(schema @ serde_json::Value::Object(_)) => schema,
            Some(_) => {
                return Err(LlmError::Validation(format!(
                    "parameters of tool '{}' must be a JSON Schema object",
                    tool.function.name
                )));
            }
        };

        Ok(Self {
            name: tool.function.name,
            description: tool.function.description,
            parameters,
        })
    }
}

/// Parse `OpenAI`'s flexible `tool_choice` field
fn parse_tool_choice(value: &serde_json::Value) -> Result<ToolChoice, LlmError> {
    match value {
        serde_json::Value::String(mode) => match mode.as_str() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Required),
            other => Err(LlmError::Validation(format!("unsupported tool_choice '{other}'"))),
        },
        serde_json::Value::Object(_) => value
            .pointer("/function/name")
            .and_then(serde_json::Value::as_str)
            .map(|name| ToolChoice::Function(name.to_owned()))
            .ok_or_else(|| LlmError::Validation("tool_choice object must name a function".to_owned())),
        _ => Err(LlmError::Validation("tool_choice must be a string or object".to_owned())),
    }
}

/// Split a `data:image/<format>;base64,<data>` URI
fn parse_data_uri(url: &str) -> Result<ImageData, LlmError> {
    let Some(rest) = url.strip_prefix("data:") else {
        return Err(LlmError::Validation(
            "image_url must be a base64 data URI; remote images are not supported".to_owned(),
        ));
    };

    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| LlmError::Validation("malformed image data URI".to_owned()))?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| LlmError::Validation("image data URI must be base64 encoded".to_owned()))?;
    let format = media_type
        .strip_prefix("image/")
        .map(|subtype| if subtype == "jpg" { "jpeg" } else { subtype })
        .filter(|subtype| IMAGE_FORMATS.contains(subtype))
        .ok_or_else(|| LlmError::Validation(format!("unsupported image media type '{media_type}'")))?;

    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| LlmError::Validation(format!("invalid base64 image data: {e}")))?;

    Ok(ImageData {
        format: format.to_owned(),
        base64: data.to_owned(),
    })
}

// -- Outbound: internal types -> OpenAI wire format --

impl From<CompletionResponse> for OpenAiResponse {
    fn from(resp: CompletionResponse) -> Self {
        Self {
            id: resp.id,
            object: "chat.completion",
            created: resp.created,
            model: resp.model,
            choices: resp.choices.into_iter().map(Into::into).collect(),
            usage: resp.usage.map(Into::into),
        }
    }
}

impl From<Choice> for OpenAiChoice {
    fn from(choice: Choice) -> Self {
        Self {
            index: choice.index,
            message: OpenAiChoiceMessage {
                role: Role::Assistant.as_str(),
                content: choice.message.content,
                tool_calls: choice.message.tool_calls.into_iter().map(Into::into).collect(),
            },
            finish_reason: choice.finish_reason.map(FinishReason::as_str),
        }
    }
}

impl From<ToolCall> for OpenAiToolCall {
    fn from(call: ToolCall) -> Self {
        Self::function(call.id, call.function.name, call.function.arguments)
    }
}

impl From<Usage> for OpenAiUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            credits_used: usage.credits_used,
        }
    }
}

// -- Stream conversion --

/// Convert an internal stream delta to an `OpenAI` stream chunk
pub fn delta_to_openai_chunk(delta: &StreamDelta, id: &str, model: &str, created: u64) -> OpenAiStreamChunk {
    let tool_calls = delta
        .tool_call
        .iter()
        .map(|tc| OpenAiStreamToolCall {
            index: tc.index,
            call: tc.call.clone().into(),
        })
        .collect();

    OpenAiStreamChunk {
        id: id.to_owned(),
        object: "chat.completion.chunk",
        created,
        model: model.to_owned(),
        choices: vec![OpenAiStreamChoice {
            index: 0,
            delta: OpenAiStreamDelta {
                role: delta.role.map(Role::as_str),
                content: delta.content.clone(),
                tool_calls,
            },
            finish_reason: delta.finish_reason.map(FinishReason::as_str),
        }],
        usage: None,
    }
}

/// Convert an internal `Usage` to an `OpenAI` stream chunk with usage data
pub fn usage_to_openai_chunk(usage: &Usage, id: &str, model: &str, created: u64) -> OpenAiStreamChunk {
    OpenAiStreamChunk {
        id: id.to_owned(),
        object: "chat.completion.chunk",
        created,
        model: model.to_owned(),
        choices: vec![],
        usage: Some((*usage).into()),
    }
}
