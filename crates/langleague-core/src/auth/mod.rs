//! Authentication module for credentials and the account session.
//!
//! This module provides:
//! - `CredentialStore`: key-value storage for the bearer token, backed by the
//!   OS keychain (`KeyringStore`) or memory (`MemoryStore`)
//! - `AccountClient`: login, logout, registration and account lookups
//! - `TokenClaims`: the decoded JWT payload with expiry and role helpers

pub mod credentials;
pub mod session;

pub use credentials::{CredentialStore, KeyringStore, MemoryStore};
pub use session::{AccountClient, Role, TokenClaims};
