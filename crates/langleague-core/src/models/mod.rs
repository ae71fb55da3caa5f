//! Wire models for the account endpoints.
//!
//! - `LoginRequest`, `JwtToken`: the `/api/authenticate` exchange
//! - `RegisterRequest`: self-registration payload
//! - `Account`: the current user as returned by `/api/account`

pub mod account;

pub use account::{Account, JwtToken, LoginRequest, RegisterRequest};
