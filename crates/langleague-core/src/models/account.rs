use serde::{Deserialize, Serialize};

/// Credentials posted to `/api/authenticate`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub remember_me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_value: Option<String>,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            remember_me: false,
            captcha_id: None,
            captcha_value: None,
        }
    }

    pub fn remember_me(mut self, remember: bool) -> Self {
        self.remember_me = remember;
        self
    }

    pub fn captcha(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.captcha_id = Some(id.into());
        self.captcha_value = Some(value.into());
        self
    }
}

/// Body of a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtToken {
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub login: String,
    pub email: String,
    pub password: String,
    pub lang_key: String,
}

/// The signed-in user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    pub id: Option<i64>,
    pub login: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub image_url: Option<String>,
    pub activated: bool,
    pub lang_key: Option<String>,
    pub authorities: Vec<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

impl Account {
    /// Display name if set, otherwise "First Last", otherwise the login.
    pub fn name(&self) -> String {
        if let Some(ref name) = self.display_name {
            if !name.trim().is_empty() {
                return name.clone();
            }
        }
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if full.is_empty() {
            self.login.clone()
        } else {
            full
        }
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }
}
