//! Core library for the LangLeague client.
//!
//! The centerpiece is [`api::AuthenticatedTransport`], an HTTP client that
//! injects the stored bearer token and transparently recovers from expired
//! sessions. [`auth::AccountClient`] builds the login and account flows on
//! top of it.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthenticatedTransport};
pub use config::TransportConfig;
