use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use kirogate_core::{RequestContext, TenantSelector};

/// Middleware that constructs a `RequestContext` from the incoming request
///
/// Picks up the tenant chosen by the auth middleware; requests that never
/// passed through it are served by the default tenant.
pub async fn request_context_middleware(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();

    let tenant = parts.extensions.get::<TenantSelector>().cloned().unwrap_or_default();
    let context = RequestContext {
        parts: parts.clone(),
        tenant,
    };

    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(context);

    next.run(request).await
}
