//! Chat completion engine for kirogate
//!
//! Accepts OpenAI-shaped chat requests, translates them into the upstream's
//! conversation payload, and relays the upstream's binary event stream back
//! as OpenAI chunks or a single aggregated response.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod catalog;
pub mod convert;
pub mod error;
pub mod eventstream;
pub mod handler;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod translator;
pub mod transport;
pub mod types;
pub mod usage;

pub use catalog::{ModelCatalog, ModelInfoCache};
pub use error::LlmError;
pub use handler::llm_router;
pub use relay::{EventStream, RelayResponse, StreamingRelay};
pub use state::LlmState;
pub use translator::{ResponseAggregator, ResponseTranslator};
pub use transport::RetryingTransport;
pub use types::{CompletionRequest, CompletionResponse, StreamEvent};
