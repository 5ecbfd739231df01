use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use muniknow_models::{AuthCredentials, AuthType};

use crate::error::{ConnectorError, ConnectorResult};
use crate::rate_limiter::RateLimiter;

/// Bounds for the automatic 429 retry loop.
///
/// The server's Retry-After is honored, but never beyond these caps: a
/// misbehaving server that always answers 429 must not pin a sync forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_total_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_total_backoff: Duration::from_secs(60),
        }
    }
}

/// Exchanges a refresh token for fresh credentials. Implemented by the
/// OAuth2-based connectors (SharePoint, Google Drive); connectors without
/// refresh support simply don't install one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credentials: &AuthCredentials) -> ConnectorResult<AuthCredentials>;
}

/// Authenticated HTTP wrapper owned by one connector instance.
///
/// Applies the rate limiter before every call, attaches auth headers per the
/// configured [`AuthType`], retries once through the refresher on 401 and
/// honors Retry-After on 429 within the [`RetryPolicy`] bounds.
pub struct AuthorizedClient {
    http: Client,
    auth_type: AuthType,
    credentials: Mutex<AuthCredentials>,
    api_key_header: String,
    rate_limiter: RateLimiter,
    retry_policy: RetryPolicy,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl AuthorizedClient {
    pub fn new(auth_type: AuthType, credentials: AuthCredentials, rate_limit_rpm: u32) -> Self {
        Self {
            http: Client::new(),
            auth_type,
            credentials: Mutex::new(credentials),
            api_key_header: "X-Api-Key".to_string(),
            rate_limiter: RateLimiter::new(rate_limit_rpm),
            retry_policy: RetryPolicy::default(),
            refresher: None,
        }
    }

    /// Vendor-appropriate header name used for `AuthType::ApiKey`.
    pub fn with_api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Snapshot of the currently held credentials.
    pub async fn credentials(&self) -> AuthCredentials {
        self.credentials.lock().await.clone()
    }

    /// Atomically replace the owned credentials with a fresh value.
    pub async fn swap_credentials(&self, fresh: AuthCredentials) {
        *self.credentials.lock().await = fresh;
    }

    /// Run the refresher and swap in the new credentials.
    ///
    /// Serialized by the credentials mutex: two concurrent 401s cannot race
    /// each other into a lost-update where the second overwrites a fresher
    /// token with a stale one.
    pub async fn refresh_credentials(&self) -> ConnectorResult<Option<AuthCredentials>> {
        let Some(refresher) = &self.refresher else {
            return Ok(None);
        };
        let mut guard = self.credentials.lock().await;
        let fresh = refresher.refresh(&guard).await?;
        *guard = fresh.clone();
        Ok(Some(fresh))
    }

    /// Issue an authenticated request, rebuilding it through `build` on each
    /// retry attempt so refreshed credentials take effect.
    pub async fn send<F>(&self, build: F) -> ConnectorResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempts: u32 = 0;
        let mut total_backoff = Duration::ZERO;
        let mut refreshed = false;

        loop {
            attempts += 1;
            self.rate_limiter.wait_for_slot().await;

            let request = self.apply_auth(build(&self.http)).await?;
            let response = request.send().await?;
            let status = response.status().as_u16();

            match status {
                200..=299 => return Ok(response),
                401 => {
                    if !refreshed && self.refresher.is_some() {
                        debug!("got 401, attempting token refresh");
                        self.refresh_credentials().await?;
                        refreshed = true;
                        continue;
                    }
                    return Err(ConnectorError::AuthFailed { status });
                }
                429 => {
                    let wait = retry_after(&response).unwrap_or(Duration::from_secs(1));
                    if attempts >= self.retry_policy.max_attempts
                        || total_backoff + wait > self.retry_policy.max_total_backoff
                    {
                        return Err(ConnectorError::RequestFailed {
                            status,
                            message: "rate limited, retry budget exhausted".to_string(),
                        });
                    }
                    warn!(wait_secs = wait.as_secs(), "got 429, backing off");
                    total_backoff += wait;
                    tokio::time::sleep(wait).await;
                }
                _ => {
                    let message = response.text().await.unwrap_or_default();
                    return Err(ConnectorError::RequestFailed {
                        status,
                        message: truncate(&message, 512),
                    });
                }
            }
        }
    }

    async fn apply_auth(&self, builder: RequestBuilder) -> ConnectorResult<RequestBuilder> {
        let credentials = self.credentials.lock().await;
        let missing = credentials.missing_fields(self.auth_type);
        if !missing.is_empty() {
            return Err(ConnectorError::Configuration(format!(
                "auth_credentials missing required fields for {:?}: {}",
                self.auth_type,
                missing.join(", ")
            )));
        }

        let builder = match self.auth_type {
            AuthType::Bearer | AuthType::Oauth2 => {
                builder.bearer_auth(credentials.access_token.as_deref().unwrap_or_default())
            }
            AuthType::ApiKey => builder.header(
                self.api_key_header.as_str(),
                credentials.api_key.as_deref().unwrap_or_default(),
            ),
            AuthType::Basic => {
                let raw = format!(
                    "{}:{}",
                    credentials.username.as_deref().unwrap_or_default(),
                    credentials.password.as_deref().unwrap_or_default()
                );
                let value = format!("Basic {}", BASE64.encode(raw));
                builder.header(
                    AUTHORIZATION,
                    HeaderValue::from_str(&value).map_err(|e| {
                        ConnectorError::Configuration(format!("invalid basic credentials: {}", e))
                    })?,
                )
            }
            AuthType::Custom => {
                let mut builder = builder;
                if let Some(headers) = &credentials.custom_headers {
                    for (name, value) in headers {
                        builder = builder.header(name.as_str(), value.as_str());
                    }
                }
                builder
            }
        };
        Ok(builder)
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
