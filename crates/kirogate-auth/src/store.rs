//! Per-tenant credential store with single-flight refresh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use jiff::Timestamp;
use kirogate_config::UpstreamConfig;
use kirogate_core::TenantSelector;
use mini_moka::sync::Cache;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};

use crate::credential::{AccessGrant, CredentialsFile, OidcClient, TenantCredential, TenantId};
use crate::refresh::TokenRefresher;
use crate::AuthError;

type RefreshOutcome = Result<Arc<TenantCredential>, AuthError>;
type RefreshFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Owns every tenant's credential and serializes their refreshes
///
/// The default tenant lives for the whole process. Caller-supplied
/// tenants live in a bounded cache and are rebuilt from their refresh
/// token if evicted.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    default: Arc<TenantSlot>,
    tenants: Cache<TenantId, Arc<TenantSlot>>,
    creating: Mutex<()>,
    region: String,
    refresher: Arc<dyn TokenRefresher>,
    margin: Duration,
}

/// Handle to one tenant, valid even if the tenant is evicted meanwhile
#[derive(Clone)]
pub struct Tenant {
    slot: Arc<TenantSlot>,
}

struct TenantSlot {
    id: TenantId,
    current: RwLock<Arc<TenantCredential>>,
    inflight: Mutex<Option<RefreshFlight>>,
    refresher: Arc<dyn TokenRefresher>,
    margin: Duration,
    persist_to: Option<PathBuf>,
}

impl CredentialStore {
    /// Build the store and its default tenant from configuration
    ///
    /// Values from `credentials_file` override the inline configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured credentials file cannot be read
    pub async fn from_config(config: &UpstreamConfig, refresher: Arc<dyn TokenRefresher>) -> Result<Self, AuthError> {
        let mut credential = TenantCredential {
            tenant_id: TenantId::default_tenant(),
            refresh_token: config
                .refresh_token
                .clone()
                .filter(|token| !token.expose_secret().is_empty()),
            access_token: None,
            expires_at: None,
            profile_arn: config.profile_arn.clone().filter(|arn| !arn.is_empty()),
            region: config.region.clone(),
            oidc: config
                .client_id
                .clone()
                .zip(config.client_secret.clone())
                .map(|(client_id, client_secret)| OidcClient {
                    client_id,
                    client_secret,
                }),
        };

        if let Some(path) = &config.credentials_file {
            let file = CredentialsFile::read(path).await?;
            merge_file(&mut credential, file);
            tracing::info!(path = %path.display(), "credentials loaded from file");
        }

        if credential.refresh_token.is_none() {
            tracing::warn!("no default refresh token configured, only multi-tenant requests will succeed");
        }

        let region = config.region.clone();
        let margin = config.refresh_margin();
        let default = Arc::new(TenantSlot::new(
            credential,
            Arc::clone(&refresher),
            margin,
            config.credentials_file.clone(),
        ));

        let tenants = Cache::builder()
            .max_capacity(config.tenant_cache_capacity)
            .time_to_idle(config.tenant_cache_idle())
            .build();

        Ok(Self {
            inner: Arc::new(StoreInner {
                default,
                tenants,
                creating: Mutex::new(()),
                region,
                refresher,
                margin,
            }),
        })
    }

    /// Resolve the tenant a request should use, creating it on first sight
    pub async fn tenant(&self, selector: &TenantSelector) -> Tenant {
        let refresh_token = match selector {
            TenantSelector::Default => {
                return Tenant {
                    slot: Arc::clone(&self.inner.default),
                };
            }
            TenantSelector::RefreshToken(token) => token,
        };

        let id = TenantId::from_refresh_token(refresh_token);
        if let Some(slot) = self.inner.tenants.get(&id) {
            return Tenant { slot };
        }

        // Serialize creation so concurrent first requests share one slot
        let _guard = self.inner.creating.lock().await;
        if let Some(slot) = self.inner.tenants.get(&id) {
            return Tenant { slot };
        }

        tracing::debug!(tenant = %id, "registering tenant");

        let credential = TenantCredential {
            tenant_id: id.clone(),
            refresh_token: Some(refresh_token.clone()),
            access_token: None,
            expires_at: None,
            profile_arn: self.inner.default.current.read().await.profile_arn.clone(),
            region: self.inner.region.clone(),
            oidc: None,
        };

        let slot = Arc::new(TenantSlot::new(
            credential,
            Arc::clone(&self.inner.refresher),
            self.inner.margin,
            None,
        ));
        self.inner.tenants.insert(id, Arc::clone(&slot));

        Tenant { slot }
    }

    /// Valid access token for the selected tenant, refreshing if needed
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if a required refresh fails
    pub async fn get_valid_token(&self, selector: &TenantSelector) -> Result<AccessGrant, AuthError> {
        self.tenant(selector).await.valid_token().await
    }
}

impl Tenant {
    pub fn id(&self) -> &TenantId {
        &self.slot.id
    }

    /// Current credential snapshot
    pub async fn snapshot(&self) -> Arc<TenantCredential> {
        Arc::clone(&*self.slot.current.read().await)
    }

    /// Access token valid for at least the refresh margin
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if a required refresh fails
    pub async fn valid_token(&self) -> Result<AccessGrant, AuthError> {
        let current = self.snapshot().await;

        if !current.needs_refresh(Timestamp::now(), self.slot.margin)
            && let Some(grant) = current.grant()
        {
            return Ok(grant);
        }

        let refreshed = Arc::clone(&self.slot).join_refresh(None).await?;
        refreshed.grant().ok_or(AuthError::MissingRefreshToken)
    }

    /// Refresh after the upstream rejected `stale`
    ///
    /// If another caller already replaced `stale`, its result is returned
    /// without a second exchange.
    ///
    /// # Errors
    ///
    /// Returns `AuthError` if the refresh fails
    pub async fn force_refresh(&self, stale: &SecretString) -> Result<AccessGrant, AuthError> {
        let refreshed = Arc::clone(&self.slot).join_refresh(Some(stale)).await?;
        refreshed.grant().ok_or(AuthError::MissingRefreshToken)
    }
}

impl TenantSlot {
    fn new(
        credential: TenantCredential,
        refresher: Arc<dyn TokenRefresher>,
        margin: Duration,
        persist_to: Option<PathBuf>,
    ) -> Self {
        Self {
            id: credential.tenant_id.clone(),
            current: RwLock::new(Arc::new(credential)),
            inflight: Mutex::new(None),
            refresher,
            margin,
            persist_to,
        }
    }

    /// Join the in-flight refresh or start one
    ///
    /// With `stale` set, a refresh only starts while that token is still
    /// current; otherwise only while the credential still needs one.
    async fn join_refresh(self: Arc<Self>, stale: Option<&SecretString>) -> RefreshOutcome {
        let flight = {
            let mut inflight = self.inflight.lock().await;

            if let Some(flight) = inflight.as_ref() {
                flight.clone()
            } else {
                let current = Arc::clone(&*self.current.read().await);
                let still_stale = match stale {
                    Some(stale) => current
                        .access_token
                        .as_ref()
                        .is_none_or(|token| token.expose_secret() == stale.expose_secret()),
                    None => current.needs_refresh(Timestamp::now(), self.margin),
                };

                if !still_stale {
                    return Ok(current);
                }

                let flight = Arc::clone(&self).run_refresh(current).boxed().shared();
                *inflight = Some(flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Perform the exchange and publish its result
    ///
    /// On failure the stored credential is left untouched.
    async fn run_refresh(self: Arc<Self>, current: Arc<TenantCredential>) -> RefreshOutcome {
        let outcome = match self.refresher.refresh(&current).await {
            Ok(token) => {
                let next = Arc::new(current.refreshed(token, Timestamp::now()));
                *self.current.write().await = Arc::clone(&next);

                if let Some(path) = &self.persist_to
                    && let Err(e) = CredentialsFile::write_back(path, &next).await
                {
                    tracing::warn!(tenant = %self.id, error = %e, "failed to persist refreshed credentials");
                }

                Ok(next)
            }
            Err(e) => {
                tracing::warn!(tenant = %self.id, error = %e, "credential refresh failed");
                Err(e)
            }
        };

        *self.inflight.lock().await = None;
        outcome
    }
}

fn merge_file(credential: &mut TenantCredential, file: CredentialsFile) {
    let expires_at = file.expiry();

    if let Some(token) = file.refresh_token {
        credential.refresh_token = Some(SecretString::from(token));
    }
    if let Some(token) = file.access_token {
        credential.access_token = Some(SecretString::from(token));
        credential.expires_at = expires_at;
    }
    if let Some(arn) = file.profile_arn {
        credential.profile_arn = Some(arn);
    }
    if let Some(region) = file.region {
        credential.region = region;
    }
    if let (Some(client_id), Some(secret)) = (file.client_id, file.client_secret) {
        credential.oidc = Some(OidcClient {
            client_id,
            client_secret: SecretString::from(secret),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::credential::RefreshedToken;

    /// Refresher that counts exchanges and hands out numbered tokens
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                delay: Duration::from_millis(50),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _credential: &TenantCredential) -> Result<RefreshedToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;

            if self.fail {
                return Err(AuthError::Rejected {
                    status: 400,
                    message: "invalid_grant".to_string(),
                });
            }

            Ok(RefreshedToken {
                access_token: SecretString::from(format!("access-{n}")),
                refresh_token: None,
                expires_in_secs: 3600,
                profile_arn: Some("arn:aws:codewhisperer:profile".to_string()),
            })
        }
    }

    async fn store(refresher: Arc<CountingRefresher>) -> CredentialStore {
        let config = UpstreamConfig {
            refresh_token: Some(SecretString::from("default-refresh")),
            ..UpstreamConfig::default()
        };
        CredentialStore::from_config(&config, refresher).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = CountingRefresher::new(false);
        let store = store(Arc::clone(&refresher)).await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_valid_token(&TenantSelector::Default).await })
            })
            .collect();

        for task in tasks {
            let grant = task.await.unwrap().unwrap();
            assert_eq!(grant.token.expose_secret(), "access-1");
        }

        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn fresh_token_is_reused() {
        let refresher = CountingRefresher::new(false);
        let store = store(Arc::clone(&refresher)).await;

        store.get_valid_token(&TenantSelector::Default).await.unwrap();
        store.get_valid_token(&TenantSelector::Default).await.unwrap();

        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_credential_untouched() {
        let refresher = CountingRefresher::new(true);
        let store = store(Arc::clone(&refresher)).await;
        let tenant = store.tenant(&TenantSelector::Default).await;

        let err = tenant.valid_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 400, .. }));

        let snapshot = tenant.snapshot().await;
        assert!(snapshot.access_token.is_none());
        assert_eq!(snapshot.refresh_token.as_ref().unwrap().expose_secret(), "default-refresh");

        // A later attempt is not short-circuited by the failure
        tenant.valid_token().await.unwrap_err();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn force_refresh_is_skipped_once_token_changed() {
        let refresher = CountingRefresher::new(false);
        let store = store(Arc::clone(&refresher)).await;
        let tenant = store.tenant(&TenantSelector::Default).await;

        let first = tenant.valid_token().await.unwrap();
        let second = tenant.force_refresh(&first.token).await.unwrap();
        assert_eq!(second.token.expose_secret(), "access-2");

        // The stale token was already replaced, nothing to do
        let third = tenant.force_refresh(&first.token).await.unwrap();
        assert_eq!(third.token.expose_secret(), "access-2");
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let refresher = CountingRefresher::new(false);
        let store = store(Arc::clone(&refresher)).await;

        let selector = TenantSelector::RefreshToken(SecretString::from("caller-refresh"));
        let a = store.tenant(&selector).await;
        let b = store.tenant(&selector).await;
        let default = store.tenant(&TenantSelector::Default).await;

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), default.id());

        a.valid_token().await.unwrap();
        b.valid_token().await.unwrap();
        assert_eq!(refresher.calls(), 1);

        default.valid_token().await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn credentials_file_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        tokio::fs::write(
            &path,
            r#"{"refreshToken":"from-file","accessToken":"cached","expiresAt":"2999-01-01T00:00:00Z","region":"eu-west-1"}"#,
        )
        .await
        .unwrap();

        let config = UpstreamConfig {
            refresh_token: Some(SecretString::from("from-config")),
            credentials_file: Some(path),
            ..UpstreamConfig::default()
        };
        let refresher = CountingRefresher::new(false);
        let store = CredentialStore::from_config(&config, Arc::clone(&refresher) as Arc<dyn TokenRefresher>)
            .await
            .unwrap();

        let grant = store.get_valid_token(&TenantSelector::Default).await.unwrap();
        assert_eq!(grant.token.expose_secret(), "cached");
        assert_eq!(grant.region, "eu-west-1");
        assert_eq!(refresher.calls(), 0);
    }
}
