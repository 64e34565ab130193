//! One chat request from dispatch to the last chunk
//!
//! The relay resolves the model, obtains a token, translates the request
//! and opens the upstream stream. A spawned pump then decodes frames and
//! translates events into a bounded channel, so a slow consumer stops the
//! pump from reading further upstream bytes. Dropping the consumer side
//! cancels the pump, which drops the upstream body and its connection.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt, stream};
use kirogate_auth::CredentialStore;
use kirogate_config::{ModelsConfig, UpstreamConfig};
use kirogate_core::{BackoffPolicy, RequestContext};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ModelCatalog, ModelInfoCache};
use crate::convert::kiro::RequestTranslator;
use crate::error::LlmError;
use crate::eventstream::EventStreamDecoder;
use crate::protocol::kiro::KiroEvent;
use crate::transport::{ByteStream, RetryingTransport};
use crate::translator::{ResponseAggregator, ResponseTranslator};
use crate::types::{CompletionRequest, CompletionResponse, StreamEvent};
use crate::usage::{self, UsageBasis};

/// Chunks queued between the pump and the consumer
const CHANNEL_CAPACITY: usize = 16;

/// Translated events of one response, ending after `Done` or an error
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// A response whose upstream stream is open
pub struct RelayResponse {
    /// `chatcmpl-` prefixed id shared by every chunk
    pub id: String,
    /// Model name as the caller sent it
    pub model: String,
    pub created: u64,
    pub events: EventStream,
}

/// Composes credentials, translation and transport per request
pub struct StreamingRelay {
    store: CredentialStore,
    catalog: ModelCatalog,
    model_info: ModelInfoCache,
    transport: RetryingTransport,
    translator: RequestTranslator,
    idle: Duration,
    total: Duration,
}

impl StreamingRelay {
    /// Build the relay and its connection pool
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn from_config(
        upstream: Arc<UpstreamConfig>,
        models: &ModelsConfig,
        store: CredentialStore,
    ) -> anyhow::Result<Self> {
        let retry = &upstream.retry;
        let backoff = BackoffPolicy::new(retry.max_attempts, retry.base_delay(), retry.max_delay(), retry.jitter);
        let (idle, total) = (upstream.timeouts.idle(), upstream.timeouts.total());
        let transport = RetryingTransport::new(Arc::clone(&upstream), backoff)?;
        let model_info = ModelInfoCache::new(transport.http().clone(), upstream, models);

        Ok(Self {
            store,
            catalog: ModelCatalog::new(models),
            model_info,
            transport,
            translator: RequestTranslator::new(models.tool_description_max_length),
            idle,
            total,
        })
    }

    pub const fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Open the upstream stream for `request`
    ///
    /// Everything that can fail before the first upstream byte fails here;
    /// later failures arrive as the final item of `events`.
    pub async fn stream(&self, request: &CompletionRequest, context: &RequestContext) -> Result<RelayResponse, LlmError> {
        let started = Instant::now();
        let model_id = self.catalog.resolve(&request.model)?;

        let tenant = self.store.tenant(&context.tenant).await;
        let grant = tenant.valid_token().await?;
        let payload = self.translator.translate(request, model_id, grant.profile_arn.clone())?;

        let basis = UsageBasis {
            prompt_estimate: usage::prompt_tokens(request),
            max_input_tokens: self.model_info.max_input_tokens(model_id, &grant).await,
        };

        let first_byte = self.transport.first_byte_timeout(&request.model, model_id);
        tracing::debug!(
            tenant = %tenant.id(),
            model = %request.model,
            upstream_model = model_id,
            first_byte_secs = first_byte.as_secs(),
            "dispatching chat request"
        );
        let body = self.transport.send(&tenant, &payload, first_byte).await?;

        Ok(RelayResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: request.model.clone(),
            created: unix_now(),
            events: spawn_pump(body, ResponseTranslator::new(basis), self.idle, started + self.total),
        })
    }

    /// Run `request` to completion and aggregate the result
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        context: &RequestContext,
    ) -> Result<CompletionResponse, LlmError> {
        let RelayResponse {
            id,
            model,
            created,
            mut events,
        } = self.stream(request, context).await?;

        let mut aggregator = ResponseAggregator::default();
        while let Some(event) = events.next().await {
            aggregator.push(event?);
        }

        Ok(aggregator.into_response(id, model, created))
    }
}

/// Start decoding `body` in its own task
///
/// `idle` bounds the gap between complete upstream frames; `deadline`
/// bounds the whole response.
fn spawn_pump(body: ByteStream, translator: ResponseTranslator, idle: Duration, deadline: Instant) -> EventStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            () = pump_cancel.cancelled() => {
                tracing::debug!("consumer went away, abandoning upstream stream");
                return;
            }
            outcome = tokio::time::timeout_at(deadline, pump(body, translator, idle, &tx)) => outcome,
        };

        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(_) => LlmError::Timeout("response exceeded the total time limit".to_owned()),
        };
        tracing::warn!(error = %error, "upstream stream failed after it started");
        let _ = tx.send(Err(error)).await;
    });

    let guard = cancel.drop_guard();
    Box::pin(stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let item = rx.recv().await?;
        Some((item, (rx, guard)))
    }))
}

/// Decode and translate until the upstream body ends
///
/// Returns `Ok` early when the consumer has gone away.
async fn pump(
    mut body: ByteStream,
    mut translator: ResponseTranslator,
    idle: Duration,
    tx: &mpsc::Sender<Result<StreamEvent, LlmError>>,
) -> Result<(), LlmError> {
    let mut decoder = EventStreamDecoder::new();
    // Only complete frames reset the idle clock; stray bytes do not
    let mut last_frame = Instant::now();

    loop {
        let chunk = tokio::time::timeout_at(last_frame + idle, body.next())
            .await
            .map_err(|_| LlmError::Timeout(format!("no upstream frame for {idle:?}")))?;
        let Some(chunk) = chunk else {
            break;
        };

        decoder.feed(&chunk?);
        for frame in decoder.frames() {
            last_frame = Instant::now();
            let event = KiroEvent::try_from(&frame?)?;
            for translated in translator.apply(event)? {
                if tx.send(Ok(translated)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    decoder.finish()?;
    for translated in translator.finish() {
        if tx.send(Ok(translated)).await.is_err() {
            return Ok(());
        }
    }

    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
