//! REST transport for the LangLeague backend.
//!
//! This module provides `AuthenticatedTransport`, the HTTP client every other
//! part of the application talks through. It attaches the bearer credential
//! to outgoing requests and recovers from expired sessions by revalidating
//! once against the account endpoint, with concurrent failures sharing that
//! single call.

pub mod client;
pub mod error;
pub mod fallback;
pub mod request;
mod revalidation;

pub use client::{AuthenticatedTransport, TransportBuilder, UnauthenticatedHook};
pub use error::ApiError;
pub use fallback::{DevFallbackPolicy, EmptyOnUnreachable, NoFallback};
pub use request::{ApiRequest, ApiResponse, RequestContext};
