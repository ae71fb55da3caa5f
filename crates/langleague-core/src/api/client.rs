//! Authenticated transport for the LangLeague REST API.
//!
//! Every request passes through two hooks: [`AuthenticatedTransport::authorize`]
//! attaches the bearer credential, and the response hook recovers from an
//! expired session by revalidating once and replaying the request. Concurrent
//! 401s share a single revalidation call.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::auth::{CredentialStore, KeyringStore};
use crate::config::TransportConfig;

use super::fallback::{DevFallbackPolicy, EmptyOnUnreachable, NoFallback};
use super::revalidation::{Revalidation, Ticket};
use super::{ApiError, ApiRequest, ApiResponse};

/// Invoked when the session is found to be invalid, after the stored
/// credential has been cleared. May fire more than once over a transport's
/// lifetime, once per failure episode.
pub type UnauthenticatedHook = Arc<dyn Fn() + Send + Sync>;

/// HTTP client with bearer injection and single-flight 401 recovery.
///
/// Clone is cheap and clones share the same revalidation state and
/// connection pool.
#[derive(Clone)]
pub struct AuthenticatedTransport {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: TransportConfig,
    credentials: Arc<dyn CredentialStore>,
    revalidation: Revalidation,
    on_unauthenticated: Option<UnauthenticatedHook>,
    fallback: Arc<dyn DevFallbackPolicy>,
}

impl fmt::Debug for AuthenticatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedTransport")
            .field("base_url", &self.inner.config.base_url)
            .field("revalidating", &self.inner.revalidation.is_in_flight())
            .field("fallback", &self.inner.fallback)
            .finish()
    }
}

pub struct TransportBuilder {
    config: TransportConfig,
    client: Option<Client>,
    credentials: Option<Arc<dyn CredentialStore>>,
    on_unauthenticated: Option<UnauthenticatedHook>,
    fallback: Option<Arc<dyn DevFallbackPolicy>>,
}

impl TransportBuilder {
    /// Credential store to read the bearer token from. Defaults to the OS
    /// keychain.
    pub fn credentials(self, store: impl CredentialStore + 'static) -> Self {
        self.shared_credentials(Arc::new(store))
    }

    pub fn shared_credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn on_unauthenticated(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_unauthenticated = Some(Arc::new(hook));
        self
    }

    /// Override the fallback otherwise chosen from `TransportConfig::dev_mode`.
    pub fn fallback(mut self, policy: impl DevFallbackPolicy + 'static) -> Self {
        self.fallback = Some(Arc::new(policy));
        self
    }

    /// Use a preconfigured reqwest client instead of building one from the
    /// config's timeout and cookie settings.
    pub fn http_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<AuthenticatedTransport, ApiError> {
        self.config.validate()?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.config.timeout)
                .cookie_store(self.config.forward_cookies)
                .build()
                .map_err(|e| ApiError::Config(format!("Failed to build HTTP client: {e}")))?,
        };

        let fallback: Arc<dyn DevFallbackPolicy> = match self.fallback {
            Some(policy) => policy,
            None if self.config.dev_mode => Arc::new(EmptyOnUnreachable),
            None => Arc::new(NoFallback),
        };

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(KeyringStore::default()));

        Ok(AuthenticatedTransport {
            inner: Arc::new(Inner {
                client,
                config: self.config,
                credentials,
                revalidation: Revalidation::new(),
                on_unauthenticated: self.on_unauthenticated,
                fallback,
            }),
        })
    }
}

impl AuthenticatedTransport {
    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder {
            config,
            client: None,
            credentials: None,
            on_unauthenticated: None,
            fallback: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.credentials
    }

    /// True while a revalidation call is outstanding.
    pub fn is_revalidating(&self) -> bool {
        self.inner.revalidation.is_in_flight()
    }

    // ===== Request hook =====

    /// Attach the stored bearer credential unless the path is token-exempt,
    /// and put the silent marker on the wire for silent requests.
    pub fn authorize(&self, request: &mut ApiRequest) {
        self.authorize_with(request, None);
    }

    fn authorize_with(&self, request: &mut ApiRequest, token: Option<&str>) {
        let config = &self.inner.config;

        if request.context.silent && !request.headers.contains_key(config.silent_header.as_str()) {
            if let Ok(name) = HeaderName::from_bytes(config.silent_header.as_bytes()) {
                request.headers.insert(name, HeaderValue::from_static("true"));
            }
        }

        if config.is_token_exempt(&request.path) {
            request.headers.remove(header::AUTHORIZATION);
            return;
        }

        let token = match token {
            Some(token) => Some(token.to_string()),
            None => self.stored_token(),
        };
        if let Some(token) = token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(value) => {
                    request.headers.insert(header::AUTHORIZATION, value);
                }
                Err(_) => warn!("Stored credential is not a valid header value, sending without it"),
            }
        }
    }

    fn stored_token(&self) -> Option<String> {
        match self.inner.credentials.get(&self.inner.config.credential_key) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read credential, sending request without it");
                None
            }
        }
    }

    // ===== Pipeline =====

    /// Send a request through both hooks.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        match self.dispatch(&request, None).await {
            Ok(response) => Ok(response),
            Err(error) if error.is_unauthorized() && !request.context.retried => {
                self.recover_unauthorized(request, error).await
            }
            Err(error) => self.surface(&request, error),
        }
    }

    async fn recover_unauthorized(
        &self,
        request: ApiRequest,
        error: ApiError,
    ) -> Result<ApiResponse, ApiError> {
        let config = &self.inner.config;

        if config.is_auth_check(&request.path) {
            warn!(path = %request.path, "Auth check rejected the session");
            self.invalidate_session();
            return Err(error);
        }

        if request.is_silent(&config.silent_header) {
            debug!(path = %request.path, "Silent request unauthorized, leaving session untouched");
            return Err(error);
        }

        let mut retry = request;
        retry.context.retried = true;

        match self.inner.revalidation.join() {
            Ticket::Waiter(rx) => match rx.await {
                Ok(Ok(token)) => self.replay(&retry, token.as_deref()).await,
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ApiError::RevalidationAborted),
            },
            Ticket::Leader(guard) => {
                debug!(path = %retry.path, "Revalidating session");
                match self.revalidate().await {
                    Ok(token) => {
                        let released = guard.resolve(token.clone());
                        debug!(released, "Session still valid, replaying requests");
                        self.replay(&retry, token.as_deref()).await
                    }
                    Err(e) => {
                        let rejected = guard.reject(&e);
                        warn!(rejected, error = %e, "Session revalidation failed");
                        self.invalidate_session();
                        Err(e)
                    }
                }
            }
        }
    }

    /// One "who am I" call. A bearer header on the answer replaces the
    /// stored credential.
    async fn revalidate(&self) -> Result<Option<String>, ApiError> {
        let probe = ApiRequest::get(self.inner.config.account_path.clone());
        let response = self.dispatch(&probe, None).await?;

        let token = bearer_from(&response.headers);
        if let Some(ref token) = token {
            if let Err(e) = self
                .inner
                .credentials
                .set(&self.inner.config.credential_key, token)
            {
                warn!(error = %e, "Failed to store refreshed credential");
            }
        }
        Ok(token)
    }

    async fn replay(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        match self.dispatch(request, token).await {
            Ok(response) => Ok(response),
            Err(error) => self.surface(request, error),
        }
    }

    /// Errors that get no recovery: log what is worth logging, give the
    /// fallback policy its chance, propagate the rest.
    fn surface(&self, request: &ApiRequest, error: ApiError) -> Result<ApiResponse, ApiError> {
        match &error {
            ApiError::AccessDenied(_) => {
                warn!(path = %request.path, method = %request.method, "Access denied (403)");
            }
            ApiError::Unauthorized if request.context.retried => {
                warn!(path = %request.path, "Still unauthorized after revalidation");
            }
            _ => {}
        }

        if let Some(response) = self.inner.fallback.recover(request, &error) {
            return Ok(response);
        }
        Err(error)
    }

    fn invalidate_session(&self) {
        if let Err(e) = self
            .inner
            .credentials
            .remove(&self.inner.config.credential_key)
        {
            warn!(error = %e, "Failed to clear credential");
        }
        if let Some(hook) = &self.inner.on_unauthenticated {
            hook();
        }
    }

    /// Run the request hook and send, backing off on 429.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        let config = &self.inner.config;

        let mut outgoing = request.clone();
        self.authorize_with(&mut outgoing, token);
        let url = config.url_for(&outgoing.path);

        let mut retries = 0;
        let mut backoff = config.initial_backoff;

        loop {
            let mut builder = self
                .inner
                .client
                .request(outgoing.method.clone(), &url)
                .headers(outgoing.headers.clone());
            if !outgoing.query.is_empty() {
                builder = builder.query(&outgoing.query);
            }
            if let Some(ref body) = outgoing.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > config.max_rate_limit_retries {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        path = %outgoing.path,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Ok(Some) for success, Ok(None) for rate limit (should retry), Err with
    /// the body for anything else.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<ApiResponse>, ApiError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to read response body: {e}")))?;

        if status.is_success() {
            Ok(Some(ApiResponse {
                status,
                headers,
                body: body.to_vec(),
                synthetic: false,
            }))
        } else {
            Err(ApiError::from_status(status, &String::from_utf8_lossy(&body)))
        }
    }

    // ===== Verbs =====

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::put(path).json(body)?).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.send(ApiRequest::delete(path)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get(path).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.post(path, body).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.put(path, body).await?.json()
    }

    pub async fn patch_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.patch(path, body).await?.json()
    }
}

fn bearer_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
