//! Token usage estimation
//!
//! The upstream never reports token counts. Completion tokens are counted
//! with `cl100k_base` and scaled towards Claude's tokenizer; prompt tokens
//! come from the upstream's context-usage percentage when it sends one,
//! otherwise from counting the request itself.

use std::sync::LazyLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::types::{CompletionRequest, Content, Usage};

/// Claude tokenizes roughly 15% denser than `cl100k_base`
const CORRECTION_PERCENT: u64 = 115;

/// Per-message framing overhead
const MESSAGE_OVERHEAD: u32 = 4;

/// Flat cost charged for each image part
const IMAGE_TOKENS: u32 = 100;

/// Reply priming overhead added once per request
const REPLY_PRIMING: u32 = 3;

static ENCODER: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!(error = %e, "cl100k_base unavailable, estimating tokens from length");
        None
    }
});

/// Raw token count without correction
pub fn count_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let count = ENCODER
        .as_ref()
        .map_or_else(|| text.len() / 4 + 1, |bpe| bpe.encode_with_special_tokens(text).len());
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Completion token estimate, corrected for Claude
pub fn completion_tokens(text: &str) -> u32 {
    let corrected = u64::from(count_tokens(text)) * CORRECTION_PERCENT / 100;
    u32::try_from(corrected).unwrap_or(u32::MAX)
}

/// Prompt token estimate from the request's messages and tools
pub fn prompt_tokens(request: &CompletionRequest) -> u32 {
    let messages = request.messages.iter().fold(0_u32, |total, message| {
        let content = match &message.content {
            Content::Text(text) => count_tokens(text),
            Content::Parts(_) => {
                let images = u32::try_from(message.content.images().count()).unwrap_or(u32::MAX);
                count_tokens(&message.content.as_text()).saturating_add(images.saturating_mul(IMAGE_TOKENS))
            }
        };
        let tool_calls = message.tool_calls.iter().fold(0_u32, |sum, call| {
            sum.saturating_add(MESSAGE_OVERHEAD)
                .saturating_add(count_tokens(&call.function.name))
                .saturating_add(count_tokens(&call.function.arguments))
        });

        total
            .saturating_add(MESSAGE_OVERHEAD)
            .saturating_add(count_tokens(message.role.as_str()))
            .saturating_add(content)
            .saturating_add(tool_calls)
            .saturating_add(message.tool_call_id.as_deref().map_or(0, count_tokens))
    });

    let tools = request.tools.iter().fold(0_u32, |total, tool| {
        total
            .saturating_add(MESSAGE_OVERHEAD)
            .saturating_add(count_tokens(&tool.name))
            .saturating_add(tool.description.as_deref().map_or(0, count_tokens))
            .saturating_add(count_tokens(&tool.parameters.to_string()))
    });

    messages.saturating_add(REPLY_PRIMING).saturating_add(tools)
}

/// Inputs fixed before the upstream call starts
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageBasis {
    /// Fallback prompt estimate
    pub prompt_estimate: u32,
    /// Context window of the resolved upstream model
    pub max_input_tokens: u32,
}

impl UsageBasis {
    /// Final usage for a response
    ///
    /// A positive `context_usage_percentage` makes the upstream's figure
    /// authoritative for the total; the prompt is whatever remains after
    /// the completion.
    pub fn usage(&self, completion_text: &str, context_usage_percentage: Option<f64>, credits_used: Option<f64>) -> Usage {
        let completion = completion_tokens(completion_text);

        let reported_total = context_usage_percentage
            .filter(|pct| *pct > 0.0)
            .map(|pct| percent_of(pct, self.max_input_tokens))
            .filter(|total| *total > 0);

        let (prompt, total) = match reported_total {
            Some(total) => (total.saturating_sub(completion), total),
            None => (self.prompt_estimate, self.prompt_estimate.saturating_add(completion)),
        };

        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            credits_used,
        }
    }
}

/// `pct` percent of `tokens`, truncated
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_of(pct: f64, tokens: u32) -> u32 {
    (pct / 100.0 * f64::from(tokens)).clamp(0.0, f64::from(u32::MAX)) as u32
}
