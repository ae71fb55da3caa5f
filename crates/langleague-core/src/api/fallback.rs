//! Development-only masking of an unreachable backend.

use std::fmt;

use reqwest::Method;
use tracing::debug;

use super::{ApiError, ApiRequest, ApiResponse};

/// Strategy consulted when a request fails before any response arrived.
pub trait DevFallbackPolicy: Send + Sync + fmt::Debug {
    /// Return a synthetic response to hand to the caller instead of `error`,
    /// or `None` to propagate it.
    fn recover(&self, request: &ApiRequest, error: &ApiError) -> Option<ApiResponse>;
}

/// Production policy: every error propagates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFallback;

impl DevFallbackPolicy for NoFallback {
    fn recover(&self, _request: &ApiRequest, _error: &ApiError) -> Option<ApiResponse> {
        None
    }
}

/// Answers connection failures with an empty list for reads and `null`
/// for everything else, so screens render without a backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyOnUnreachable;

impl DevFallbackPolicy for EmptyOnUnreachable {
    fn recover(&self, request: &ApiRequest, error: &ApiError) -> Option<ApiResponse> {
        if !error.is_unreachable() {
            return None;
        }
        let body = if request.method == Method::GET {
            serde_json::Value::Array(Vec::new())
        } else {
            serde_json::Value::Null
        };
        debug!(path = %request.path, method = %request.method, "Backend unreachable, returning empty fallback");
        Some(ApiResponse::synthetic(&body))
    }
}
