use anyhow::Context;
use fetcher::{
    BundleLoader, BundleRef, ByteStream, FetchRunContext, RequestMeta, ResourceMeta, StorageSink,
};
use futures::StreamExt;
use protocols::HttpManager;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Decides from `(url, status)` whether a response is worth keeping.
pub type ErrorHandler = Arc<dyn Fn(&str, u16) -> bool + Send + Sync>;

/// Copies selected top-level fields of a JSON response body into the
/// bundle's meta, so locators can read pagination state (cursor, totals)
/// from the `BundleRef`s they are handed.
#[derive(Debug, Clone)]
pub struct JsonProbe {
    pub fields: Vec<String>,
    pub max_bytes: usize,
}

impl JsonProbe {
    pub fn fields(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            max_bytes: 8 << 20,
        }
    }
}

/// GET loader for HTTP endpoints and APIs: one bundle per request, the
/// response body as its single primary resource.
pub struct HttpLoader {
    http: Arc<HttpManager>,
    follow_redirects: bool,
    error_handler: Option<ErrorHandler>,
    json_probe: Option<JsonProbe>,
}

impl HttpLoader {
    pub fn new(http: Arc<HttpManager>) -> Self {
        Self {
            http,
            follow_redirects: true,
            error_handler: None,
            json_probe: None,
        }
    }

    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    /// Responses this handler rejects are discarded without a bundle.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_json_probe(mut self, probe: JsonProbe) -> Self {
        self.json_probe = Some(probe);
        self
    }
}

#[async_trait::async_trait]
impl BundleLoader for HttpLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        sink: &dyn StorageSink,
        _ctx: &FetchRunContext,
    ) -> anyhow::Result<Vec<BundleRef>> {
        let response = self
            .http
            .request(
                reqwest::Method::GET,
                &request.url,
                Some(&request.headers),
                self.follow_redirects,
            )
            .await
            .with_context(|| format!("fetching {}", request.url))?;

        let status = response.status();
        let content_type = response.content_type();
        let content_length = response.content_length();

        if let Some(handler) = &self.error_handler {
            if !handler(&request.url, status) {
                tracing::warn!(url = %request.url, status, "response rejected by error handler");
                return Ok(Vec::new());
            }
        }

        let bundle = BundleRef::new(&request.url)
            .with_meta("status_code", json!(status))
            .with_meta("content_type", json!(content_type))
            .with_meta("content_length", json!(content_length));

        let (stream, probe_state) = match &self.json_probe {
            Some(probe) => {
                let state = Arc::new(Mutex::new(ProbeState::default()));
                (
                    tee_into(response.bytes_stream(), state.clone(), probe.max_bytes),
                    Some(state),
                )
            }
            None => (response.bytes_stream(), None),
        };

        let mut bundle_ctx = sink.open_bundle(bundle).await?;
        let resource = ResourceMeta::new(&request.url)
            .with_status(status)
            .with_content_type(content_type);

        if let Err(err) = bundle_ctx.write_resource(resource, stream).await {
            // Dropping the context abandons the bundle and its temp state.
            drop(bundle_ctx);
            return Err(err).with_context(|| format!("storing {}", request.url));
        }
        let mut finished = bundle_ctx
            .close()
            .await
            .with_context(|| format!("finalizing bundle for {}", request.url))?;

        if let (Some(probe), Some(state)) = (&self.json_probe, probe_state) {
            apply_probe(probe, &state.lock().unwrap(), &mut finished);
        }

        tracing::info!(url = %request.url, status, bid = %finished.bid, "loaded http bundle");
        Ok(vec![finished])
    }
}

#[derive(Default)]
struct ProbeState {
    buf: Vec<u8>,
    overflowed: bool,
}

/// Pass chunks through while copying up to `cap` bytes aside.
fn tee_into(stream: ByteStream, state: Arc<Mutex<ProbeState>>, cap: usize) -> ByteStream {
    Box::pin(stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            let mut state = state.lock().unwrap();
            if !state.overflowed {
                if state.buf.len() + bytes.len() <= cap {
                    state.buf.extend_from_slice(bytes);
                } else {
                    state.overflowed = true;
                    state.buf.clear();
                }
            }
        }
        chunk
    }))
}

fn apply_probe(probe: &JsonProbe, state: &ProbeState, bundle: &mut BundleRef) {
    if state.overflowed || state.buf.is_empty() {
        return;
    }
    let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&state.buf) else {
        return;
    };
    for field in &probe.fields {
        match doc.get(field) {
            Some(value) if !value.is_object() && !value.is_array() => {
                bundle.meta.insert(field.clone(), value.clone());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetcher::FetchRunContext;
    use protocols::{AuthMechanism, HttpConfig};
    use test_support::{FixtureResponse, FixtureServer, RecordingSink};

    fn loader_for() -> (Arc<HttpManager>, FetchRunContext) {
        let manager = HttpManager::new(
            HttpConfig {
                rate_limit_rps: 0.0,
                ..HttpConfig::default()
            },
            AuthMechanism::None,
        )
        .unwrap();
        (Arc::new(manager), FetchRunContext::new("test"))
    }

    #[tokio::test]
    async fn loads_one_bundle_with_primary_resource() {
        let server = FixtureServer::always(FixtureResponse::ok("text/plain", "hello")).await;
        let (http, ctx) = loader_for();
        let sink = RecordingSink::new();

        let refs = HttpLoader::new(http)
            .load(&RequestMeta::new(server.url("/a")), &sink, &ctx)
            .await
            .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].resources_count, 1);
        assert_eq!(refs[0].meta["status_code"], 200);

        let resources = sink.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].1, b"hello");
        assert_eq!(resources[0].0.status, Some(200));
    }

    #[tokio::test]
    async fn error_handler_discards_response() {
        let server = FixtureServer::always(FixtureResponse::status(404)).await;
        let (http, ctx) = loader_for();
        let sink = RecordingSink::new();

        let handler: ErrorHandler = Arc::new(|_url, status| status == 200);
        let refs = HttpLoader::new(http)
            .with_error_handler(handler)
            .load(&RequestMeta::new(server.url("/missing")), &sink, &ctx)
            .await
            .unwrap();

        assert!(refs.is_empty());
        assert!(sink.resources().is_empty());
        assert!(sink.closed_bundles().is_empty());
    }

    #[tokio::test]
    async fn json_probe_copies_scalar_fields() {
        let server = FixtureServer::always(FixtureResponse::ok_json(
            r#"{"curseurSuivant":"abc","total":1500,"nombre":1000,"items":[1,2,3]}"#,
        ))
        .await;
        let (http, ctx) = loader_for();
        let sink = RecordingSink::new();

        let refs = HttpLoader::new(http)
            .with_json_probe(JsonProbe::fields(&["curseurSuivant", "nombre", "items"]))
            .load(&RequestMeta::new(server.url("/page")), &sink, &ctx)
            .await
            .unwrap();

        let meta = &refs[0].meta;
        assert_eq!(meta["curseurSuivant"], "abc");
        assert_eq!(meta["nombre"], 1000);
        // Non-scalar fields stay out of bundle meta.
        assert!(!meta.contains_key("items"));
    }

    #[tokio::test]
    async fn transport_failure_is_an_error() {
        let (_, ctx) = loader_for();
        let http = Arc::new(
            HttpManager::new(
                HttpConfig {
                    max_retries: 1,
                    rate_limit_rps: 0.0,
                    ..HttpConfig::default()
                },
                AuthMechanism::None,
            )
            .unwrap(),
        );
        let sink = RecordingSink::new();

        let result = HttpLoader::new(http)
            .load(
                &RequestMeta::new("http://127.0.0.1:9/down"),
                &sink,
                &ctx,
            )
            .await;
        assert!(result.is_err());
        assert!(sink.resources().is_empty());
    }
}
