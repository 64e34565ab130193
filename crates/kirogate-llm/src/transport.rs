//! Upstream dispatch with retries, tiered first-byte timeouts and
//! per-tenant concurrency limits

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt, stream};
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use http::StatusCode;
use kirogate_auth::{AccessGrant, Tenant, TenantId, fingerprint};
use kirogate_config::UpstreamConfig;
use kirogate_core::BackoffPolicy;
use secrecy::ExposeSecret;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::LlmError;
use crate::protocol::kiro::KiroRequest;

/// Raw upstream body, starting with the chunk that proved the stream is live
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

const SDK_VERSION: &str = "1.0.27";

/// Upstream HTTP client honoring the configured backoff and timeout policy
pub struct RetryingTransport {
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    backoff: BackoffPolicy,
    limits: DashMap<TenantId, Arc<Semaphore>>,
}

/// What one attempt concluded
enum Attempt {
    Streaming(ByteStream),
    /// 403: the access token was rejected
    Forbidden(String),
    Retry { error: LlmError, hint: Option<Duration> },
    Fatal(LlmError),
}

impl RetryingTransport {
    /// Build the transport and its connection pool
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(upstream: Arc<UpstreamConfig>, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(upstream.timeouts.connect())
            .build()?;

        Ok(Self {
            http,
            upstream,
            backoff,
            limits: DashMap::new(),
        })
    }

    /// Shared connection pool, also used for model listing
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Time allowed until the first response byte for a model
    ///
    /// The tier table is consulted with the public name first, then the
    /// upstream id.
    pub fn first_byte_timeout(&self, public_model: &str, upstream_model: &str) -> Duration {
        let timeouts = &self.upstream.timeouts;
        let tier = timeouts
            .models
            .get(public_model)
            .or_else(|| timeouts.models.get(upstream_model))
            .map_or(kirogate_config::DEFAULT_TIER, String::as_str);
        timeouts.first_byte_timeout(tier)
    }

    /// Send a chat request and return its body once the first chunk arrived
    ///
    /// Failures before the first chunk are retried under the backoff
    /// policy. The returned stream is never retried: errors while reading
    /// it surface to the caller as they happen.
    ///
    /// # Errors
    ///
    /// Returns the last classified failure once retries are exhausted, or
    /// immediately for non-retryable statuses
    pub async fn send(&self, tenant: &Tenant, request: &KiroRequest, first_byte: Duration) -> Result<ByteStream, LlmError> {
        let body = Bytes::from(serde_json::to_vec(request).map_err(|e| LlmError::Internal(e.into()))?);
        let permit = self.acquire(tenant.id()).await?;
        let mut grant = tenant.valid_token().await?;
        let url = self
            .upstream
            .chat_endpoint(&grant.region)
            .map_err(|e| LlmError::Internal(anyhow::anyhow!("invalid chat endpoint: {e}")))?;

        let max_attempts = self.backoff.max_attempts();
        let mut attempts = 0;
        loop {
            attempts += 1;

            let headers = upstream_headers(&grant, attempts, max_attempts)?;
            let dispatch = self.http.post(url.clone()).headers(headers).body(body.clone()).send();

            let outcome = match tokio::time::timeout(first_byte, Self::first_chunk(dispatch)).await {
                Ok(outcome) => outcome,
                Err(_) => Attempt::Retry {
                    error: LlmError::Timeout(format!("no response within {first_byte:?}")),
                    hint: None,
                },
            };

            match outcome {
                Attempt::Streaming(body) => {
                    tracing::debug!(tenant = %tenant.id(), attempt = attempts, "upstream stream opened");
                    return Ok(hold_permit(body, permit));
                }
                Attempt::Fatal(error) => {
                    tracing::warn!(tenant = %tenant.id(), attempt = attempts, error = %error, "upstream rejected request");
                    return Err(error);
                }
                Attempt::Forbidden(message) => {
                    if !self.backoff.has_attempts_left(attempts) {
                        return Err(LlmError::Upstream {
                            status: StatusCode::FORBIDDEN.as_u16(),
                            message,
                        });
                    }
                    tracing::warn!(tenant = %tenant.id(), attempt = attempts, "upstream returned 403, refreshing token");
                    grant = tenant.force_refresh(&grant.token).await?;
                }
                Attempt::Retry { error, hint } => {
                    if !self.backoff.has_attempts_left(attempts) {
                        tracing::error!(tenant = %tenant.id(), attempts, error = %error, "upstream request failed");
                        return Err(error);
                    }

                    let delay = self.backoff.delay_with_hint(attempts - 1, hint);
                    tracing::warn!(
                        tenant = %tenant.id(),
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "upstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Classify a response and wait for its first body chunk
    async fn first_chunk(
        dispatch: impl Future<Output = Result<reqwest::Response, reqwest::Error>>,
    ) -> Attempt {
        let response = match dispatch.await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Retry {
                    error: LlmError::Transport(format!("upstream request failed: {e}")),
                    hint: None,
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let message = response.text().await.unwrap_or_default();

            return match status {
                StatusCode::FORBIDDEN => Attempt::Forbidden(message),
                StatusCode::TOO_MANY_REQUESTS => Attempt::Retry {
                    error: LlmError::RateLimited { retry_after },
                    hint: retry_after.map(Duration::from_secs),
                },
                status if BackoffPolicy::is_retryable_status(status) => Attempt::Retry {
                    error: LlmError::Transport(format!("upstream returned {status}: {message}")),
                    hint: None,
                },
                status => Attempt::Fatal(LlmError::Upstream {
                    status: status.as_u16(),
                    message,
                }),
            };
        }

        let mut body = response.bytes_stream();
        match body.next().await {
            Some(Ok(first)) => {
                let rest = body.map(|chunk| chunk.map_err(|e| LlmError::Transport(format!("upstream stream failed: {e}"))));
                Attempt::Streaming(stream::once(async move { Ok(first) }).chain(rest).boxed())
            }
            Some(Err(e)) => Attempt::Retry {
                error: LlmError::Transport(format!("upstream stream failed before first byte: {e}")),
                hint: None,
            },
            None => Attempt::Streaming(stream::empty().boxed()),
        }
    }

    /// Take one of the tenant's concurrency slots
    async fn acquire(&self, tenant: &TenantId) -> Result<OwnedSemaphorePermit, LlmError> {
        let semaphore = {
            let entry = self
                .limits
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.upstream.max_concurrent_per_tenant.max(1))));
            Arc::clone(entry.value())
        };

        if u64::try_from(self.limits.len()).unwrap_or(u64::MAX) > self.upstream.tenant_cache_capacity {
            // Only semaphores nobody holds a permit for
            self.limits.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        }

        semaphore
            .acquire_owned()
            .await
            .map_err(|e| LlmError::Internal(anyhow::anyhow!("tenant limiter closed: {e}")))
    }
}

/// Body that releases its tenant's concurrency slot when dropped
struct PermitStream {
    body: ByteStream,
    _permit: OwnedSemaphorePermit,
}

impl Stream for PermitStream {
    type Item = Result<Bytes, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.body.poll_next_unpin(cx)
    }
}

fn hold_permit(body: ByteStream, permit: OwnedSemaphorePermit) -> ByteStream {
    Box::pin(PermitStream { body, _permit: permit })
}

/// Headers every upstream call carries
pub(crate) fn upstream_headers(grant: &AccessGrant, attempt: u32, max_attempts: u32) -> Result<HeaderMap, LlmError> {
    let invalid = |e: http::header::InvalidHeaderValue| LlmError::Internal(anyhow::anyhow!("invalid header value: {e}"));
    let tag = format!("KiroGate-{}", &fingerprint()[..32]);

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", grant.token.expose_secret())).map_err(invalid)?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!(
            "aws-sdk-js/{SDK_VERSION} ua/2.1 os/{} lang/rust api/codewhispererstreaming#{SDK_VERSION} m/E {tag}",
            std::env::consts::OS
        ))
        .map_err(invalid)?,
    );
    headers.insert(
        "x-amz-user-agent",
        HeaderValue::from_str(&format!("aws-sdk-js/{SDK_VERSION} {tag}")).map_err(invalid)?,
    );
    headers.insert("x-amzn-codewhisperer-optout", HeaderValue::from_static("true"));
    headers.insert("x-amzn-kiro-agent-mode", HeaderValue::from_static("vibe"));
    headers.insert(
        "amz-sdk-invocation-id",
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).map_err(invalid)?,
    );
    headers.insert(
        "amz-sdk-request",
        HeaderValue::from_str(&format!("attempt={attempt}; max={max_attempts}")).map_err(invalid)?,
    );

    Ok(headers)
}
