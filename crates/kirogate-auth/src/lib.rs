#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod credential;
mod error;
mod refresh;
mod store;

pub use credential::{AccessGrant, CredentialsFile, OidcClient, RefreshedToken, TenantCredential, TenantId};
pub use error::AuthError;
pub use refresh::{HttpRefresher, TokenRefresher, fingerprint};
pub use store::{CredentialStore, Tenant};
