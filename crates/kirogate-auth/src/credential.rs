use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::AuthError;

/// Seconds shaved off every upstream-reported lifetime
const EXPIRY_SKEW_SECS: i64 = 60;

/// Stable identifier for a tenant
///
/// The default tenant is `default`; caller-supplied tenants are keyed by
/// a SHA-256 prefix of their refresh token so the token never appears in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn default_tenant() -> Self {
        Self("default".to_string())
    }

    /// Derive the id for a caller-supplied refresh token
    pub fn from_refresh_token(token: &SecretString) -> Self {
        let digest = sha256_hex(token.expose_secret());
        Self(format!("tenant-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// OIDC client registration used by IDC refresh
#[derive(Debug, Clone)]
pub struct OidcClient {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// One tenant's upstream credential
///
/// Immutable once built: a refresh produces a new value that replaces
/// the old one wholesale.
#[derive(Debug, Clone)]
pub struct TenantCredential {
    pub tenant_id: TenantId,
    pub refresh_token: Option<SecretString>,
    pub access_token: Option<SecretString>,
    pub expires_at: Option<Timestamp>,
    pub profile_arn: Option<String>,
    pub region: String,
    /// Present when the tenant refreshes through SSO OIDC
    pub oidc: Option<OidcClient>,
}

impl TenantCredential {
    /// Whether the access token must be refreshed before use
    ///
    /// A missing token or unknown expiry always needs a refresh.
    pub fn needs_refresh(&self, now: Timestamp, margin: Duration) -> bool {
        let Some(expires_at) = self.expires_at else {
            return true;
        };

        if self.access_token.is_none() {
            return true;
        }

        let margin = SignedDuration::try_from(margin).unwrap_or(SignedDuration::MAX);
        now.checked_add(margin).ok().is_none_or(|threshold| expires_at <= threshold)
    }

    /// Produce the successor credential after a successful refresh
    #[must_use]
    pub fn refreshed(&self, token: RefreshedToken, now: Timestamp) -> Self {
        let lifetime = SignedDuration::from_secs(token.expires_in_secs.saturating_sub(EXPIRY_SKEW_SECS));

        Self {
            tenant_id: self.tenant_id.clone(),
            refresh_token: token.refresh_token.or_else(|| self.refresh_token.clone()),
            access_token: Some(token.access_token),
            expires_at: now.checked_add(lifetime).ok(),
            profile_arn: token.profile_arn.or_else(|| self.profile_arn.clone()),
            region: self.region.clone(),
            oidc: self.oidc.clone(),
        }
    }

    /// Token and routing context handed to the transport
    pub fn grant(&self) -> Option<AccessGrant> {
        self.access_token.as_ref().map(|token| AccessGrant {
            tenant_id: self.tenant_id.clone(),
            token: token.clone(),
            profile_arn: self.profile_arn.clone(),
            region: self.region.clone(),
        })
    }
}

/// A usable access token with the context needed to address the upstream
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub tenant_id: TenantId,
    pub token: SecretString,
    pub profile_arn: Option<String>,
    pub region: String,
}

/// Result of one token exchange
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Rotated refresh token, when the endpoint issues one
    pub refresh_token: Option<SecretString>,
    pub expires_in_secs: i64,
    pub profile_arn: Option<String>,
}

/// On-disk credentials written by the desktop client
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsFile {
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub profile_arn: Option<String>,
    pub region: Option<String>,
    pub expires_at: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl CredentialsFile {
    /// Read a credentials file, expanding a leading `~`
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CredentialsFile` if the file is unreadable or not JSON
    pub async fn read(path: &Path) -> Result<Self, AuthError> {
        let path = expand_home(path);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AuthError::CredentialsFile(format!("{}: {e}", path.display())))?;

        serde_json::from_str(&raw).map_err(|e| AuthError::CredentialsFile(format!("{}: {e}", path.display())))
    }

    /// Parsed `expiresAt`, ignoring values that are not RFC 3339
    pub fn expiry(&self) -> Option<Timestamp> {
        let raw = self.expires_at.as_deref()?;
        match raw.parse::<Timestamp>() {
            Ok(ts) => Some(ts),
            Err(e) => {
                tracing::warn!(value = raw, error = %e, "ignoring unparsable expiresAt");
                None
            }
        }
    }

    /// Merge a refreshed credential back into the file, keeping unknown keys
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CredentialsFile` if the file cannot be rewritten
    pub async fn write_back(path: &Path, credential: &TenantCredential) -> Result<(), AuthError> {
        let path = expand_home(path);
        let file_error = |e: &dyn fmt::Display| AuthError::CredentialsFile(format!("{}: {e}", path.display()));

        let mut document = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw)
                .map_err(|e| file_error(&e))?,
            Err(_) => serde_json::Map::new(),
        };

        if let Some(token) = &credential.access_token {
            document.insert("accessToken".into(), token.expose_secret().into());
        }
        if let Some(token) = &credential.refresh_token {
            document.insert("refreshToken".into(), token.expose_secret().into());
        }
        if let Some(expires_at) = credential.expires_at {
            document.insert("expiresAt".into(), expires_at.to_string().into());
        }
        if let Some(arn) = &credential.profile_arn {
            document.insert("profileArn".into(), arn.clone().into());
        }

        let body = serde_json::to_string_pretty(&document).map_err(|e| file_error(&e))?;
        tokio::fs::write(&path, body).await.map_err(|e| file_error(&e))
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Compute the SHA-256 hex digest of a string
pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        // Writing hex to a String is infallible
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
