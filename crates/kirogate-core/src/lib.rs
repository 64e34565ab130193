//! Types shared by every kirogate crate

#![allow(clippy::must_use_candidate)]

mod backoff;
mod context;
mod error;

pub use backoff::BackoffPolicy;
pub use context::{RequestContext, TenantSelector};
pub use error::HttpError;
