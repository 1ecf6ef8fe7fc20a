use credentials::CredentialProvider;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

/// Subtracted from `expires_in` so tokens are refreshed before they lapse.
const TOKEN_SAFETY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Credential(#[from] credentials::CredentialError),
    #[error("token endpoint request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    TokenStatus(u16),
    #[error("credential produced an invalid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// How outgoing requests carry credentials.
///
/// `authenticate_request` is additive: it may set `Authorization` but never
/// removes caller-supplied headers.
pub enum AuthMechanism {
    None,
    Basic(BasicAuth),
    Bearer(BearerAuth),
    OAuthClientCredentials(OAuthClientCredentials),
}

impl AuthMechanism {
    pub fn basic(provider: Arc<dyn CredentialProvider>, config_name: &str) -> Self {
        AuthMechanism::Basic(BasicAuth {
            provider,
            config_name: config_name.to_string(),
            username_key: "username".to_string(),
            password_key: "password".to_string(),
            cached: OnceCell::new(),
        })
    }

    pub fn basic_with_keys(
        provider: Arc<dyn CredentialProvider>,
        config_name: &str,
        username_key: &str,
        password_key: &str,
    ) -> Self {
        AuthMechanism::Basic(BasicAuth {
            provider,
            config_name: config_name.to_string(),
            username_key: username_key.to_string(),
            password_key: password_key.to_string(),
            cached: OnceCell::new(),
        })
    }

    pub fn bearer(provider: Arc<dyn CredentialProvider>, config_name: &str) -> Self {
        AuthMechanism::Bearer(BearerAuth {
            provider,
            config_name: config_name.to_string(),
            token_key: "token".to_string(),
            cached: OnceCell::new(),
        })
    }

    pub fn oauth_client_credentials(config: OAuthConfig) -> Self {
        AuthMechanism::OAuthClientCredentials(OAuthClientCredentials {
            config,
            http: reqwest::Client::new(),
            state: Mutex::new(None),
        })
    }

    pub async fn authenticate_request(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        match self {
            AuthMechanism::None => Ok(()),
            AuthMechanism::Basic(basic) => basic.apply(headers).await,
            AuthMechanism::Bearer(bearer) => bearer.apply(headers).await,
            AuthMechanism::OAuthClientCredentials(oauth) => oauth.apply(headers).await,
        }
    }
}

pub struct BasicAuth {
    provider: Arc<dyn CredentialProvider>,
    config_name: String,
    username_key: String,
    password_key: String,
    cached: OnceCell<(String, String)>,
}

impl BasicAuth {
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let (username, password) = self
            .cached
            .get_or_try_init(|| async {
                let username = self
                    .provider
                    .get_credential(&self.config_name, &self.username_key)
                    .await?;
                let password = self
                    .provider
                    .get_credential(&self.config_name, &self.password_key)
                    .await?;
                Ok::<_, AuthError>((username, password))
            })
            .await?;

        let encoded = base64::encode(format!("{username}:{password}"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}"))?,
        );
        Ok(())
    }
}

pub struct BearerAuth {
    provider: Arc<dyn CredentialProvider>,
    config_name: String,
    token_key: String,
    cached: OnceCell<String>,
}

impl BearerAuth {
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let token = self
            .cached
            .get_or_try_init(|| async {
                self.provider
                    .get_credential(&self.config_name, &self.token_key)
                    .await
                    .map_err(AuthError::from)
            })
            .await?;

        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub provider: Arc<dyn CredentialProvider>,
    pub config_name: String,
    pub grant_type: String,
}

impl OAuthConfig {
    pub fn new(
        token_url: &str,
        provider: Arc<dyn CredentialProvider>,
        config_name: &str,
    ) -> Self {
        Self {
            token_url: token_url.to_string(),
            provider,
            config_name: config_name.to_string(),
            grant_type: "client_credentials".to_string(),
        }
    }
}

/// RFC 6749 §4.4 client-credentials exchange with a cached token.
pub struct OAuthClientCredentials {
    config: OAuthConfig,
    http: reqwest::Client,
    state: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl OAuthClientCredentials {
    async fn apply(&self, headers: &mut HeaderMap) -> Result<(), AuthError> {
        let token = self.token().await?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        Ok(())
    }

    /// Returns the cached token, refreshing it when stale. The refresh runs
    /// under the state mutex, so concurrent callers coalesce onto one
    /// exchange and then observe the fresh token.
    async fn token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let consumer_key = self
            .config
            .provider
            .get_credential(&self.config.config_name, "consumer_key")
            .await?;
        let consumer_secret = self
            .config
            .provider
            .get_credential(&self.config.config_name, "consumer_secret")
            .await?;

        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&consumer_key, Some(&consumer_secret))
            .form(&[("grant_type", self.config.grant_type.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::TokenStatus(response.status().as_u16()));
        }
        let token: TokenResponse = response.json().await?;

        tracing::info!(
            config_name = %self.config.config_name,
            expires_in = token.expires_in,
            "obtained oauth access token"
        );

        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SAFETY_MARGIN);
        let access_token = token.access_token.clone();
        *state = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }
}
