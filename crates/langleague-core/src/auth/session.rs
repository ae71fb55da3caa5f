use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::{ApiError, ApiRequest, AuthenticatedTransport};
use crate::models::{Account, JwtToken, LoginRequest, RegisterRequest};

/// Login endpoint
const AUTHENTICATE_PATH: &str = "/api/authenticate";

/// Self-registration endpoint
const REGISTER_PATH: &str = "/api/register";

const ROLE_ADMIN: &str = "ROLE_ADMIN";
const ROLE_STAFF: &str = "ROLE_STAFF";

/// Highest-privilege role carried by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Staff,
    User,
}

/// Payload of the backend-issued JWT. The signature is not checked here;
/// the server remains the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    /// Space-separated authorities.
    #[serde(default)]
    pub auth: String,
    #[serde(rename = "userId", default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    pub exp: i64,
}

impl TokenClaims {
    pub fn decode(token: &str) -> Result<Self, ApiError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| ApiError::Credentials("token is not a JWT".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ApiError::Credentials(format!("token payload is not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Credentials(format!("token payload is not valid claims: {e}")))
    }

    /// Stable user identifier: the numeric id when the token carries one,
    /// otherwise the subject.
    pub fn user_key(&self) -> String {
        self.user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.sub.clone())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().map(|exp| Utc::now() > exp).unwrap_or(true)
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at()
            .map(|exp| exp - Utc::now())
            .unwrap_or_else(Duration::zero)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    pub fn authorities(&self) -> impl Iterator<Item = &str> {
        self.auth.split_whitespace()
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities().any(|a| a == authority)
    }

    pub fn role(&self) -> Role {
        if self.has_authority(ROLE_ADMIN) {
            Role::Admin
        } else if self.has_authority(ROLE_STAFF) {
            Role::Staff
        } else {
            Role::User
        }
    }
}

/// Account and session calls layered on the transport.
#[derive(Debug, Clone)]
pub struct AccountClient {
    transport: AuthenticatedTransport,
}

impl AccountClient {
    pub fn new(transport: AuthenticatedTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &AuthenticatedTransport {
        &self.transport
    }

    /// Exchange credentials for a token and store it. Any previous
    /// credential is cleared first.
    pub async fn login(&self, request: &LoginRequest) -> Result<TokenClaims, ApiError> {
        self.logout()?;

        let token: JwtToken = self
            .transport
            .post_json(AUTHENTICATE_PATH, request)
            .await?;
        let claims = TokenClaims::decode(&token.id_token)?;

        self.transport
            .credentials()
            .set(self.credential_key(), &token.id_token)
            .map_err(|e| ApiError::Credentials(e.to_string()))?;

        info!(user = %claims.sub, role = ?claims.role(), "Logged in");
        Ok(claims)
    }

    /// Client-side logout: the server keeps no session state for JWTs.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.transport
            .credentials()
            .remove(self.credential_key())
            .map_err(|e| ApiError::Credentials(e.to_string()))?;
        debug!("Credential cleared");
        Ok(())
    }

    /// Ask the server whether the current session is valid. The check goes
    /// to the account endpoint so the bearer token is sent; a `false`
    /// answer also clears the stored credential.
    pub async fn is_authenticated(&self) -> Result<bool, ApiError> {
        let path = self.transport.config().account_path.clone();
        match self.transport.send(ApiRequest::get(path).silent()).await {
            Ok(_) => Ok(true),
            Err(ApiError::Unauthorized) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn account(&self) -> Result<Account, ApiError> {
        let path = self.transport.config().account_path.clone();
        self.transport.get_json(&path).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ApiError> {
        self.transport.post(REGISTER_PATH, request).await?;
        info!(login = %request.login, "Registration submitted");
        Ok(())
    }

    /// Claims of the stored token, if any.
    pub fn current_claims(&self) -> Result<Option<TokenClaims>, ApiError> {
        let token = self
            .transport
            .credentials()
            .get(self.credential_key())
            .map_err(|e| ApiError::Credentials(e.to_string()))?;
        token.as_deref().map(TokenClaims::decode).transpose()
    }

    fn credential_key(&self) -> &str {
        &self.transport.config().credential_key
    }
}
