use crate::{AuthError, AuthMechanism, RateLimiter};
use fetcher::ByteStream;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    #[error("invalid header value for '{0}'")]
    InvalidHeaderValue(String),
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub default_headers: BTreeMap<String, String>,
    pub rate_limit_rps: f64,
    pub max_retries: u32,
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("User-Agent".to_string(), "trawler/0.1".to_string());
        Self {
            timeout: Duration::from_secs(30),
            default_headers,
            rate_limit_rps: 10.0,
            max_retries: 3,
            max_redirects: 5,
        }
    }
}

/// Rate-limited, retrying, authenticated HTTP client.
///
/// Transport failures retry with `2^attempt` seconds of backoff; response
/// status codes are never retried here, that policy belongs to callers.
pub struct HttpManager {
    config: HttpConfig,
    auth: AuthMechanism,
    limiter: RateLimiter,
    client: reqwest::Client,
    client_no_redirect: reqwest::Client,
}

impl HttpManager {
    pub fn new(config: HttpConfig, auth: AuthMechanism) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;
        let client_no_redirect = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let limiter = RateLimiter::per_second(config.rate_limit_rps);
        Ok(Self {
            config,
            auth,
            limiter,
            client,
            client_no_redirect,
        })
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: Option<&BTreeMap<String, String>>,
        follow_redirects: bool,
    ) -> Result<HttpResponse, HttpError> {
        self.limiter.acquire().await;

        // Defaults, then caller headers, then authentication; later writers
        // win on conflicting names.
        let mut composed = header_map(&self.config.default_headers)?;
        if let Some(headers) = headers {
            for (name, value) in header_map(headers)? {
                if let Some(name) = name {
                    composed.insert(name, value);
                }
            }
        }
        self.auth.authenticate_request(&mut composed).await?;

        let client = if follow_redirects {
            &self.client
        } else {
            &self.client_no_redirect
        };

        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match client
                .request(method.clone(), url)
                .headers(composed.clone())
                .send()
                .await
            {
                Ok(response) => return Ok(HttpResponse { inner: response }),
                Err(err) => {
                    tracing::warn!(url, attempt, error = %err, "http request attempt failed");
                    last_error = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    }
                }
            }
        }
        Err(HttpError::Transport(last_error.expect("at least one attempt")))
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.request(Method::GET, url, None, true).await
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpError::InvalidHeaderName(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HttpError::InvalidHeaderValue(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// A response whose body is exposed as a one-shot byte stream.
pub struct HttpResponse {
    inner: reqwest::Response,
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.inner.status().as_u16()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    /// Consumes the response into its body stream.
    pub fn bytes_stream(self) -> ByteStream {
        Box::pin(
            self.inner
                .bytes_stream()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver;
    use futures::StreamExt;

    async fn body_of(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn streams_response_body() {
        let fixture = testserver::spawn_ok("text/plain", "hello").await;
        let manager = HttpManager::new(HttpConfig::default(), AuthMechanism::None).unwrap();

        let response = manager
            .get(&format!("http://{}/a", fixture.addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.content_type().as_deref(), Some("text/plain"));
        assert_eq!(body_of(response.bytes_stream()).await, b"hello");
    }

    #[tokio::test]
    async fn caller_headers_override_defaults() {
        let fixture = testserver::spawn_ok("text/plain", "ok").await;
        let mut config = HttpConfig::default();
        config
            .default_headers
            .insert("Accept".to_string(), "text/html".to_string());
        let manager = HttpManager::new(config, AuthMechanism::None).unwrap();

        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        manager
            .request(
                Method::GET,
                &format!("http://{}/h", fixture.addr),
                Some(&headers),
                true,
            )
            .await
            .unwrap();

        let request = fixture.requests().pop().unwrap();
        assert!(request.to_lowercase().contains("accept: application/json"));
        assert!(!request.to_lowercase().contains("accept: text/html"));
    }

    #[tokio::test]
    async fn rate_limit_spaces_requests() {
        let fixture = testserver::spawn_ok("text/plain", "ok").await;
        let mut config = HttpConfig::default();
        config.rate_limit_rps = 50.0;
        let manager = HttpManager::new(config, AuthMechanism::None).unwrap();

        let url = format!("http://{}/r", fixture.addr);
        let started = std::time::Instant::now();
        for _ in 0..3 {
            manager.get(&url).await.unwrap();
        }
        // Two mandatory gaps at 50 rps.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn transport_errors_surface_after_retries() {
        // Nothing listens on this port.
        let manager = HttpManager::new(
            HttpConfig {
                max_retries: 1,
                ..HttpConfig::default()
            },
            AuthMechanism::None,
        )
        .unwrap();
        let err = manager.get("http://127.0.0.1:9/unreachable").await;
        assert!(matches!(err, Err(HttpError::Transport(_))));
    }
}
