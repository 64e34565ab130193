/// Credential lifecycle errors
///
/// `Clone` so every caller awaiting one shared refresh observes the same
/// outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// No refresh token is available for the tenant
    #[error("no refresh token configured")]
    MissingRefreshToken,

    /// Token endpoint refused the refresh token (invalid, expired or revoked)
    #[error("refresh token rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code from the token endpoint
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Token endpoint unreachable or failing after the retry budget
    #[error("token refresh unavailable: {0}")]
    Unavailable(String),

    /// Token endpoint answered with an unusable body
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// Credentials file could not be read or parsed
    #[error("credentials file error: {0}")]
    CredentialsFile(String),
}
