use secrecy::SecretString;

/// Runtime context attached to every authenticated request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP request parts (method, URI, headers, extensions)
    pub parts: http::request::Parts,
    /// Whose upstream credentials serve this request
    pub tenant: TenantSelector,
}

impl RequestContext {
    /// Create a context for the default tenant without an HTTP request
    pub fn for_tenant(tenant: TenantSelector) -> Self {
        let (parts, ()) = http::Request::new(()).into_parts();
        Self { parts, tenant }
    }

    /// Access request headers
    pub fn headers(&self) -> &http::HeaderMap {
        &self.parts.headers
    }
}

/// Credential selection derived from the caller's bearer value
#[derive(Debug, Clone, Default)]
pub enum TenantSelector {
    /// Process-wide credentials from configuration
    #[default]
    Default,
    /// Caller-supplied refresh token (`<gateway key>:<refresh token>`)
    RefreshToken(SecretString),
}
