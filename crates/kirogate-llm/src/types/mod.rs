//! Canonical chat types shared by both translators
//!
//! Inbound `OpenAI` requests are validated into these types before the
//! upstream payload is built, and upstream events are translated into
//! them before being rendered back to the wire.

pub mod message;
pub mod request;
pub mod response;
pub mod stream;
pub mod tool;

pub use message::{Content, ContentPart, FunctionCall, ImageData, Message, Role, ToolCall};
pub use request::CompletionRequest;
pub use response::{Choice, ChoiceMessage, CompletionResponse, FinishReason, Usage};
pub use stream::{StreamDelta, StreamEvent, StreamToolCall};
pub use tool::{ToolChoice, ToolDefinition};
