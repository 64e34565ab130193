//! Canonical request -> upstream conversation payload
//!
//! The upstream takes one current user message plus a history of strictly
//! alternating user and assistant turns. System messages have no place in
//! that model, so they are folded into the first user turn.

use crate::error::LlmError;
use crate::protocol::kiro::{
    AssistantResponseMessage, ConversationState, CurrentMessage, HistoryEntry, InputSchema, KiroImage, KiroImageSource,
    KiroRequest, KiroText, KiroTool, KiroToolResult, KiroToolUse, ORIGIN, ToolSpecification, UserInputMessage,
    UserInputMessageContext,
};
use crate::types::{CompletionRequest, ImageData, Message, Role, ToolDefinition};

/// Sent when the caller's last turn has no text of its own
const CONTINUE_PROMPT: &str = "Continue";

/// Builds upstream payloads from validated requests
#[derive(Debug, Clone, Copy)]
pub struct RequestTranslator {
    /// Longer descriptions move to the system prompt; zero disables
    tool_description_max_length: usize,
}

/// A user or assistant turn after merging
#[derive(Debug, Default)]
struct Turn {
    role: Option<Role>,
    text: String,
    images: Vec<ImageData>,
    tool_results: Vec<KiroToolResult>,
    tool_uses: Vec<KiroToolUse>,
}

impl Turn {
    fn absorb(&mut self, other: Self) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&other.text);
        }
        self.images.extend(other.images);
        self.tool_results.extend(other.tool_results);
        self.tool_uses.extend(other.tool_uses);
    }

    fn into_user_message(self, model_id: &str, tools: Vec<KiroTool>) -> UserInputMessage {
        let context = UserInputMessageContext {
            tools,
            tool_results: self.tool_results,
        };

        UserInputMessage {
            content: self.text,
            model_id: model_id.to_owned(),
            origin: ORIGIN.to_owned(),
            images: self
                .images
                .into_iter()
                .map(|image| KiroImage {
                    format: image.format,
                    source: KiroImageSource { bytes: image.base64 },
                })
                .collect(),
            user_input_message_context: (!context.is_empty()).then_some(context),
        }
    }

    fn into_history(self, model_id: &str) -> HistoryEntry {
        if self.role == Some(Role::Assistant) {
            HistoryEntry::AssistantResponseMessage(AssistantResponseMessage {
                content: self.text,
                tool_uses: self.tool_uses,
            })
        } else {
            HistoryEntry::UserInputMessage(self.into_user_message(model_id, Vec::new()))
        }
    }
}

impl RequestTranslator {
    pub const fn new(tool_description_max_length: usize) -> Self {
        Self {
            tool_description_max_length,
        }
    }

    /// Build the payload for `request` addressed to upstream model `model_id`
    pub fn translate(
        &self,
        request: &CompletionRequest,
        model_id: &str,
        profile_arn: Option<String>,
    ) -> Result<KiroRequest, LlmError> {
        self.build(request, model_id, profile_arn, uuid::Uuid::new_v4().to_string())
    }

    fn build(
        &self,
        request: &CompletionRequest,
        model_id: &str,
        profile_arn: Option<String>,
        conversation_id: String,
    ) -> Result<KiroRequest, LlmError> {
        let (tools, tool_docs) = self.tool_specs(request.effective_tools());
        let system_prompt = system_prompt(&request.messages, &tool_docs);

        let mut turns = merge_turns(&request.messages)?;
        let Some(mut current) = turns.pop() else {
            return Err(LlmError::Validation(
                "request has no user or assistant messages".to_owned(),
            ));
        };

        if !system_prompt.is_empty() {
            let target = match turns.first_mut() {
                Some(first) if first.role == Some(Role::User) => first,
                _ => &mut current,
            };
            target.text = if target.text.is_empty() {
                system_prompt
            } else {
                format!("{system_prompt}\n\n{}", target.text)
            };
        }

        let mut history: Vec<HistoryEntry> = turns.into_iter().map(|turn| turn.into_history(model_id)).collect();

        // The upstream always answers a user message
        if current.role == Some(Role::Assistant) {
            history.push(current.into_history(model_id));
            current = Turn {
                role: Some(Role::User),
                ..Turn::default()
            };
        }
        if current.text.is_empty() {
            CONTINUE_PROMPT.clone_into(&mut current.text);
        }

        tracing::debug!(
            model = model_id,
            history = history.len(),
            tools = tools.len(),
            "built upstream conversation"
        );

        Ok(KiroRequest {
            conversation_state: ConversationState {
                chat_trigger_type: "MANUAL".to_owned(),
                conversation_id,
                current_message: CurrentMessage {
                    user_input_message: current.into_user_message(model_id, tools),
                },
                history,
            },
            profile_arn: profile_arn.filter(|arn| !arn.is_empty()),
        })
    }

    /// Tool specifications plus documentation displaced by long descriptions
    fn tool_specs(&self, tools: &[ToolDefinition]) -> (Vec<KiroTool>, Vec<String>) {
        let mut docs = Vec::new();
        let specs = tools
            .iter()
            .map(|tool| {
                let mut description = tool.description.clone().unwrap_or_default();
                if self.tool_description_max_length > 0 && description.chars().count() > self.tool_description_max_length {
                    tracing::debug!(tool = %tool.name, "moving long tool description into system prompt");
                    docs.push(format!("## Tool: {}\n\n{description}", tool.name));
                    description = format!("[Full documentation in system prompt under '## Tool: {}']", tool.name);
                }

                KiroTool {
                    tool_specification: ToolSpecification {
                        name: tool.name.clone(),
                        description,
                        input_schema: InputSchema {
                            json: tool.parameters.clone(),
                        },
                    },
                }
            })
            .collect();

        (specs, docs)
    }
}

/// System messages joined, followed by any displaced tool documentation
fn system_prompt(messages: &[Message], tool_docs: &[String]) -> String {
    let mut prompt = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_text())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned();

    if !tool_docs.is_empty() {
        let section = format!(
            "# Tool Documentation\nThe following tools have detailed documentation that couldn't fit in the tool definition.\n\n{}",
            tool_docs.join("\n\n---\n\n")
        );
        if prompt.is_empty() {
            prompt = section;
        } else {
            prompt = format!("{prompt}\n\n---\n{section}");
        }
    }

    prompt
}

/// Non-system messages as alternating turns
///
/// Tool results become user turns, then adjacent turns of the same role
/// are merged.
fn merge_turns(messages: &[Message]) -> Result<Vec<Turn>, LlmError> {
    let mut turns: Vec<Turn> = Vec::new();

    for message in messages {
        let turn = match message.role {
            Role::System => continue,
            Role::Tool => {
                let text = message.content.as_text();
                Turn {
                    role: Some(Role::User),
                    tool_results: vec![KiroToolResult {
                        content: vec![KiroText {
                            text: if text.is_empty() { "(empty result)".to_owned() } else { text },
                        }],
                        status: "success".to_owned(),
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    }],
                    ..Turn::default()
                }
            }
            Role::User => Turn {
                role: Some(Role::User),
                text: message.content.as_text(),
                images: message.content.images().cloned().collect(),
                ..Turn::default()
            },
            Role::Assistant => Turn {
                role: Some(Role::Assistant),
                text: message.content.as_text(),
                tool_uses: message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        Ok(KiroToolUse {
                            name: call.function.name.clone(),
                            input: parse_arguments(&call.function.name, &call.function.arguments)?,
                            tool_use_id: call.id.clone(),
                        })
                    })
                    .collect::<Result<_, LlmError>>()?,
                ..Turn::default()
            },
        };

        match turns.last_mut() {
            Some(last) if last.role == turn.role => last.absorb(turn),
            _ => turns.push(turn),
        }
    }

    Ok(turns)
}

fn parse_arguments(name: &str, arguments: &str) -> Result<serde_json::Value, LlmError> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }

    serde_json::from_str(arguments)
        .map_err(|e| LlmError::Validation(format!("arguments of tool call '{name}' are not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, ContentPart, ToolCall, ToolChoice};

    fn request(messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            model: "claude-sonnet-4-5".to_owned(),
            messages,
            tools: vec![],
            tool_choice: None,
            stream: false,
        }
    }

    fn tool_message(id: &str, text: &str) -> Message {
        Message {
            tool_call_id: Some(id.to_owned()),
            ..Message::text(Role::Tool, text)
        }
    }

    fn payload(translator: RequestTranslator, request: &CompletionRequest) -> serde_json::Value {
        let payload = translator
            .build(request, "MODEL", Some("arn:profile".to_owned()), "conv-1".to_owned())
            .unwrap();
        serde_json::to_value(payload).unwrap()
    }

    #[test]
    fn single_user_message_carries_system_prompt() {
        let req = request(vec![
            Message::text(Role::System, "Be terse."),
            Message::text(Role::System, "Answer in English."),
            Message::text(Role::User, "hi"),
        ]);

        assert_eq!(
            payload(RequestTranslator::new(10_000), &req),
            serde_json::json!({
                "conversationState": {
                    "chatTriggerType": "MANUAL",
                    "conversationId": "conv-1",
                    "currentMessage": { "userInputMessage": {
                        "content": "Be terse.\nAnswer in English.\n\nhi",
                        "modelId": "MODEL",
                        "origin": "AI_EDITOR"
                    }}
                },
                "profileArn": "arn:profile"
            })
        );
    }

    #[test]
    fn tool_round_trip_is_threaded_through_history() {
        let assistant = Message {
            tool_calls: vec![ToolCall::new("call_1", "search", r#"{"q":"rust"}"#)],
            ..Message::text(Role::Assistant, "")
        };
        let req = request(vec![
            Message::text(Role::System, "sys"),
            Message::text(Role::User, "find rust"),
            assistant,
            tool_message("call_1", "found it"),
            tool_message("call_2", ""),
        ]);

        let value = payload(RequestTranslator::new(10_000), &req);

        assert_eq!(
            value["conversationState"]["history"],
            serde_json::json!([
                { "userInputMessage": { "content": "sys\n\nfind rust", "modelId": "MODEL", "origin": "AI_EDITOR" } },
                { "assistantResponseMessage": {
                    "content": "",
                    "toolUses": [{ "name": "search", "input": { "q": "rust" }, "toolUseId": "call_1" }]
                }}
            ])
        );
        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"],
            serde_json::json!({
                "content": "Continue",
                "modelId": "MODEL",
                "origin": "AI_EDITOR",
                "userInputMessageContext": { "toolResults": [
                    { "content": [{ "text": "found it" }], "status": "success", "toolUseId": "call_1" },
                    { "content": [{ "text": "(empty result)" }], "status": "success", "toolUseId": "call_2" }
                ]}
            })
        );
    }

    #[test]
    fn adjacent_turns_merge_and_trailing_assistant_moves_to_history() {
        let req = request(vec![
            Message::text(Role::User, "one"),
            Message::text(Role::User, "two"),
            Message::text(Role::Assistant, "partial answer"),
        ]);

        let value = payload(RequestTranslator::new(10_000), &req);

        assert_eq!(
            value["conversationState"]["history"],
            serde_json::json!([
                { "userInputMessage": { "content": "one\ntwo", "modelId": "MODEL", "origin": "AI_EDITOR" } },
                { "assistantResponseMessage": { "content": "partial answer" } }
            ])
        );
        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "Continue"
        );
    }

    #[test]
    fn images_are_carried_on_user_turns() {
        let req = request(vec![Message {
            content: Content::Parts(vec![
                ContentPart::Text("look".to_owned()),
                ContentPart::Image(ImageData {
                    format: "png".to_owned(),
                    base64: "iVBORw0K".to_owned(),
                }),
            ]),
            ..Message::text(Role::User, "")
        }]);

        let value = payload(RequestTranslator::new(10_000), &req);

        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"]["images"],
            serde_json::json!([{ "format": "png", "source": { "bytes": "iVBORw0K" } }])
        );
    }

    #[test]
    fn long_tool_descriptions_move_to_system_prompt() {
        let mut req = request(vec![Message::text(Role::User, "go")]);
        req.tools = vec![
            ToolDefinition {
                name: "short".to_owned(),
                description: Some("tiny".to_owned()),
                parameters: serde_json::json!({ "type": "object" }),
            },
            ToolDefinition {
                name: "long".to_owned(),
                description: Some("x".repeat(20)),
                parameters: serde_json::json!({ "type": "object" }),
            },
        ];

        let value = payload(RequestTranslator::new(10), &req);
        let current = &value["conversationState"]["currentMessage"]["userInputMessage"];

        insta::assert_snapshot!(current["content"].as_str().unwrap(), @r"
        # Tool Documentation
        The following tools have detailed documentation that couldn't fit in the tool definition.

        ## Tool: long

        xxxxxxxxxxxxxxxxxxxx

        go
        ");
        assert_eq!(
            current["userInputMessageContext"]["tools"][1]["toolSpecification"]["description"],
            "[Full documentation in system prompt under '## Tool: long']"
        );
        assert_eq!(
            current["userInputMessageContext"]["tools"][0]["toolSpecification"],
            serde_json::json!({ "name": "short", "description": "tiny", "inputSchema": { "json": { "type": "object" } } })
        );
    }

    #[test]
    fn tool_choice_none_withholds_tools() {
        let mut req = request(vec![Message::text(Role::User, "go")]);
        req.tools = vec![ToolDefinition {
            name: "search".to_owned(),
            description: None,
            parameters: serde_json::json!({ "type": "object" }),
        }];
        req.tool_choice = Some(ToolChoice::None);

        let value = payload(RequestTranslator::new(10_000), &req);

        assert!(value["conversationState"]["currentMessage"]["userInputMessage"]
            .get("userInputMessageContext")
            .is_none());
    }

    #[test]
    fn system_only_request_is_rejected() {
        let req = request(vec![Message::text(Role::System, "sys")]);

        let err = RequestTranslator::new(0).translate(&req, "MODEL", None).unwrap_err();

        assert!(matches!(err, LlmError::Validation(_)));
    }

    #[test]
    fn malformed_history_arguments_are_rejected() {
        let req = request(vec![
            Message::text(Role::User, "hi"),
            Message {
                tool_calls: vec![ToolCall::new("call_1", "search", "{not json")],
                ..Message::text(Role::Assistant, "")
            },
            tool_message("call_1", "ok"),
        ]);

        let err = RequestTranslator::new(0).translate(&req, "MODEL", None).unwrap_err();

        assert!(matches!(err, LlmError::Validation(_)));
    }
}
