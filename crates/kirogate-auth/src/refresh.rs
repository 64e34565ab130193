use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use kirogate_config::UpstreamConfig;
use kirogate_core::BackoffPolicy;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::credential::{RefreshedToken, TenantCredential, sha256_hex};
use crate::AuthError;

/// Lifetime assumed when the token endpoint omits `expiresIn`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Perform one token exchange for the given credential
    async fn refresh(&self, credential: &TenantCredential) -> Result<RefreshedToken, AuthError>;
}

/// Token endpoint response shared by the social and OIDC flows
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    profile_arn: Option<String>,
}

/// Refresher backed by the upstream's HTTP token endpoints
pub struct HttpRefresher {
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    backoff: BackoffPolicy,
}

impl HttpRefresher {
    /// Create a refresher for the configured endpoints
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(upstream: Arc<UpstreamConfig>, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(upstream.timeouts.connect_secs))
            .build()?;

        Ok(Self { http, upstream, backoff })
    }

    /// Build the endpoint and body for the credential's refresh flow
    fn exchange_request(
        &self,
        credential: &TenantCredential,
        refresh_token: &SecretString,
    ) -> Result<(url::Url, serde_json::Value), AuthError> {
        let invalid = |e: url::ParseError| AuthError::Unavailable(format!("invalid token endpoint: {e}"));

        match &credential.oidc {
            Some(client) => Ok((
                self.upstream.idc_refresh_endpoint(&credential.region).map_err(invalid)?,
                serde_json::json!({
                    "clientId": client.client_id,
                    "clientSecret": client.client_secret.expose_secret(),
                    "grantType": "refresh_token",
                    "refreshToken": refresh_token.expose_secret(),
                }),
            )),
            None => Ok((
                self.upstream.refresh_endpoint(&credential.region).map_err(invalid)?,
                serde_json::json!({ "refreshToken": refresh_token.expose_secret() }),
            )),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self, credential: &TenantCredential) -> Result<RefreshedToken, AuthError> {
        let refresh_token = credential.refresh_token.as_ref().ok_or(AuthError::MissingRefreshToken)?;
        let (url, body) = self.exchange_request(credential, refresh_token)?;
        let flow = if credential.oidc.is_some() { "idc" } else { "social" };

        let mut attempts = 0;
        loop {
            attempts += 1;

            let request = self
                .http
                .post(url.clone())
                .header(http::header::USER_AGENT, format!("KiroGate-{}", &fingerprint()[..16]))
                .json(&body);

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let parsed: RefreshResponse = response
                        .json()
                        .await
                        .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

                    tracing::info!(tenant = %credential.tenant_id, flow, "access token refreshed");

                    return Ok(RefreshedToken {
                        access_token: SecretString::from(parsed.access_token),
                        refresh_token: parsed.refresh_token.map(SecretString::from),
                        expires_in_secs: parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
                        profile_arn: parsed.profile_arn,
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let message = response.text().await.unwrap_or_default();

                    if !BackoffPolicy::is_retryable_status(status) {
                        tracing::warn!(tenant = %credential.tenant_id, flow, status = status.as_u16(), "refresh token rejected");
                        return Err(AuthError::Rejected {
                            status: status.as_u16(),
                            message,
                        });
                    }

                    format!("token endpoint returned {status}: {message}")
                }
                Err(e) => format!("token endpoint request failed: {e}"),
            };

            if !self.backoff.has_attempts_left(attempts) {
                tracing::error!(tenant = %credential.tenant_id, flow, attempts, error = %failure, "token refresh failed");
                return Err(AuthError::Unavailable(failure));
            }

            let delay = self.backoff.delay(attempts - 1);
            tracing::warn!(
                tenant = %credential.tenant_id,
                flow,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "token refresh failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Stable per-machine fingerprint sent in user agents
///
/// SHA-256 of `hostname-user`, computed once per process.
pub fn fingerprint() -> &'static str {
    static FINGERPRINT: OnceLock<String> = OnceLock::new();
    FINGERPRINT.get_or_init(|| {
        let host = hostname::get().map_or_else(|_| "unknown".into(), |h| h.to_string_lossy().into_owned());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".to_string());
        sha256_hex(&format!("{host}-{user}"))
    })
}
