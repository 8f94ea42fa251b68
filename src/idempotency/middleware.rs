//! # Idempotency Middleware
//!
//! Tower layer that deduplicates mutating requests carrying an idempotency
//! key. For each such request it:
//!
//! 1. buffers the body and derives a fingerprint,
//! 2. takes the fingerprint lock in the store (409 when another request holds it),
//! 3. replays the cached response if one exists, marked with
//!    `X-Idempotency-Cached: true`,
//! 4. otherwise runs the inner service and tees its response body into the
//!    store, releasing the lock once the body is complete.
//!
//! Requests without the header, and GET/HEAD/DELETE/OPTIONS requests, pass
//! straight through.

use super::capture::{Capture, TeeBody};
use super::fingerprint::{Fingerprinter, Sha256Fingerprinter};
use super::stores::{CachedResponse, IdempotencyStore};
use super::IdempotencyConfig;
use crate::core::error::IdempotencyError;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Header added to replayed responses
pub const CACHED_HEADER: &str = "x-idempotency-cached";

/// Methods that go through the idempotency path
pub fn is_idempotency_method(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Read the idempotency key header.
///
/// A missing or empty header means the request is not idempotent. A value
/// that is not visible ASCII cannot be fingerprinted and is rejected.
fn idempotency_key(headers: &HeaderMap, header_name: &HeaderName) -> Result<Option<String>, IdempotencyError> {
    let Some(value) = headers.get(header_name) else {
        return Ok(None);
    };

    let key = value.to_str().map_err(|_| {
        IdempotencyError::invalid_request(format!("{} must contain visible ASCII only", header_name))
    })?;

    if key.is_empty() {
        Ok(None)
    } else {
        Ok(Some(key.to_string()))
    }
}

/// Shared state of the layer and every service it produces
struct Shared {
    store: Arc<dyn IdempotencyStore>,
    fingerprinter: Arc<dyn Fingerprinter>,
    header_name: HeaderName,
    ttl: Duration,
    max_body_size: usize,
}

/// Idempotency middleware layer
#[derive(Clone)]
pub struct IdempotencyLayer {
    store: Arc<dyn IdempotencyStore>,
    fingerprinter: Arc<dyn Fingerprinter>,
    header_name: HeaderName,
    ttl: Duration,
    max_body_size: usize,
}

impl IdempotencyLayer {
    /// Create a layer with default settings (`Idempotency-Key`, 24h TTL)
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            fingerprinter: Arc::new(Sha256Fingerprinter::new()),
            header_name: HeaderName::from_static("idempotency-key"),
            ttl: super::DEFAULT_TTL,
            max_body_size: super::DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Create a layer from configuration
    pub fn from_config(
        store: Arc<dyn IdempotencyStore>,
        config: &IdempotencyConfig,
    ) -> Result<Self, IdempotencyError> {
        let header_name = HeaderName::from_bytes(config.header_name.as_bytes()).map_err(|e| {
            IdempotencyError::config(format!("Invalid header name '{}': {}", config.header_name, e))
        })?;

        Ok(Self::new(store)
            .with_header(header_name)
            .with_ttl(config.ttl)
            .with_max_body_size(config.max_body_size))
    }

    /// Header carrying the idempotency key
    pub fn with_header(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    /// How long captured responses stay replayable
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the default SHA-256 fingerprinter
    pub fn with_fingerprinter<F>(mut self, fingerprinter: F) -> Self
    where
        F: Fingerprinter + 'static,
    {
        self.fingerprinter = Arc::new(fingerprinter);
        self
    }

    /// Largest request body that can be fingerprinted
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            shared: Arc::new(Shared {
                store: Arc::clone(&self.store),
                fingerprinter: Arc::clone(&self.fingerprinter),
                header_name: self.header_name.clone(),
                ttl: self.ttl,
                max_body_size: self.max_body_size,
            }),
        }
    }
}

/// Idempotency middleware service
#[derive(Clone)]
pub struct IdempotencyService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request> for IdempotencyService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let idempotency_key = if is_idempotency_method(request.method()) {
            idempotency_key(request.headers(), &self.shared.header_name)
        } else {
            Ok(None)
        };

        let idempotency_key = match idempotency_key {
            Ok(Some(key)) => key,
            Ok(None) => return Box::pin(self.inner.call(request)),
            Err(e) => {
                debug!(error = %e, "Rejecting idempotent request");
                return Box::pin(async move { Ok::<_, S::Error>(e.into_response()) });
            }
        };

        // Take the readied service and leave a fresh clone behind
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let shared = Arc::clone(&self.shared);

        Box::pin(async move { handle_idempotent(shared, inner, request, idempotency_key).await })
    }
}

async fn handle_idempotent<S>(
    shared: Arc<Shared>,
    mut inner: S,
    request: Request,
    idempotency_key: String,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
{
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, shared.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Could not buffer idempotent request body");
            return Ok(IdempotencyError::invalid_request(format!("unreadable request body: {}", e))
                .into_response());
        }
    };

    let fingerprint = match shared.fingerprinter.fingerprint(&parts, &body, &idempotency_key) {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            debug!(error = %e, "Could not fingerprint idempotent request");
            let e = match e {
                IdempotencyError::InvalidRequest { .. } => e,
                other => IdempotencyError::invalid_request(other.to_string()),
            };
            return Ok(e.into_response());
        }
    };

    let guard = match shared.store.lock(&fingerprint).await {
        Ok(guard) => guard,
        Err(IdempotencyError::RequestInProgress) => {
            debug!(key = %fingerprint, "Idempotent request already in progress");
            return Ok(IdempotencyError::RequestInProgress.into_response());
        }
        Err(e) => {
            warn!(
                key = %fingerprint,
                store = shared.store.name(),
                error = %e,
                "Failed to acquire idempotency lock"
            );
            return Ok(e.into_response());
        }
    };

    match shared.store.get(&fingerprint).await {
        Ok(Some(cached)) => {
            guard.release().await;
            debug!(key = %fingerprint, "Replaying cached idempotent response");
            return Ok(replay(cached));
        }
        Ok(None) => {
            debug!(key = %fingerprint, "No cached response, executing request");
        }
        Err(e) => {
            warn!(
                key = %fingerprint,
                store = shared.store.name(),
                error = %e,
                "Idempotency cache lookup failed, executing request"
            );
        }
    }

    let request = Request::from_parts(parts, Body::from(body));
    let response = match inner.call(request).await {
        Ok(response) => response,
        Err(e) => {
            guard.release().await;
            return Err(e);
        }
    };

    let (parts, body) = response.into_parts();
    let capture = Capture::new(
        Arc::clone(&shared.store),
        guard,
        shared.ttl,
        parts.status,
        parts.headers.clone(),
    );

    Ok(Response::from_parts(parts, Body::new(TeeBody::new(body, capture))))
}

/// Rebuild a cached response and mark it as replayed
fn replay(cached: CachedResponse) -> Response {
    let status = cached.status_code();
    let CachedResponse { headers, body, .. } = cached;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
        .headers_mut()
        .insert(CACHED_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::stores::{InMemoryStore, InMemoryStoreConfig, LockGuard};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn payment_router(calls: Arc<AtomicUsize>, layer: IdempotencyLayer) -> Router {
        Router::new()
            .route(
                "/api/payment",
                post(move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        (StatusCode::OK, "{\"ok\":true}")
                    }
                }),
            )
            .layer(layer)
    }

    fn payment_request(key: Option<&str>, body: &'static str) -> Request {
        let mut builder = Request::builder().method(Method::POST).uri("/api/payment");
        if let Some(key) = key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    /// Store whose every operation fails, to exercise error paths
    struct BrokenStore;

    #[async_trait]
    impl IdempotencyStore for BrokenStore {
        async fn get(&self, _key: &str) -> crate::core::error::IdempotencyResult<Option<CachedResponse>> {
            Err(IdempotencyError::store("unreachable"))
        }

        async fn set(
            &self,
            _key: &str,
            _response: &CachedResponse,
            _ttl: Duration,
        ) -> crate::core::error::IdempotencyResult<()> {
            Err(IdempotencyError::store("unreachable"))
        }

        async fn lock(&self, _key: &str) -> crate::core::error::IdempotencyResult<LockGuard> {
            Err(IdempotencyError::store("unreachable"))
        }

        async fn health_check(&self) -> crate::core::error::IdempotencyResult<bool> {
            Ok(false)
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_idempotency_methods() {
        assert!(is_idempotency_method(&Method::POST));
        assert!(is_idempotency_method(&Method::PUT));
        assert!(is_idempotency_method(&Method::PATCH));
        assert!(!is_idempotency_method(&Method::GET));
        assert!(!is_idempotency_method(&Method::DELETE));
        assert!(!is_idempotency_method(&Method::HEAD));
    }

    #[tokio::test]
    async fn test_replay_marks_response() {
        let cached = CachedResponse::new(StatusCode::ACCEPTED, Default::default(), "done".into());
        let response = replay(cached);

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get(CACHED_HEADER).unwrap(), "true");
    }

    #[tokio::test]
    async fn test_lock_backend_error_is_server_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = payment_router(calls.clone(), IdempotencyLayer::new(Arc::new(BrokenStore)));

        let response = app.oneshot(payment_request(Some("pay-1"), "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broken_store_still_passes_through_without_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = payment_router(calls.clone(), IdempotencyLayer::new(Arc::new(BrokenStore)));

        let response = app.oneshot(payment_request(None, "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_key_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = payment_router(calls.clone(), IdempotencyLayer::new(Arc::new(BrokenStore)));

        let response = app.oneshot(payment_request(Some(""), "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_ascii_key_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let app = payment_router(calls.clone(), IdempotencyLayer::new(store));

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/payment")
            .header("Idempotency-Key", HeaderValue::from_bytes(b"caf\xe9").unwrap())
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_idempotency_key_header() {
        let name = HeaderName::from_static("idempotency-key");
        let mut headers = HeaderMap::new();
        assert!(idempotency_key(&headers, &name).unwrap().is_none());

        headers.insert(&name, HeaderValue::from_static(""));
        assert!(idempotency_key(&headers, &name).unwrap().is_none());

        headers.insert(&name, HeaderValue::from_static("pay-1"));
        assert_eq!(idempotency_key(&headers, &name).unwrap().as_deref(), Some("pay-1"));

        headers.insert(&name, HeaderValue::from_bytes(b"caf\xe9").unwrap());
        assert!(matches!(
            idempotency_key(&headers, &name),
            Err(IdempotencyError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_raised_body_limit_accepts_large_bodies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let layer = IdempotencyLayer::new(store).with_max_body_size(8 * 1024 * 1024);
        let app = payment_router(calls.clone(), layer);

        let large = || {
            Request::builder()
                .method(Method::POST)
                .uri("/api/payment")
                .header("Idempotency-Key", "bulk-1")
                .body(Body::from(vec![b'x'; 3 * 1024 * 1024]))
                .unwrap()
        };

        let first = app.clone().oneshot(large()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        first.into_body().collect().await.unwrap();

        let second = app.oneshot(large()).await.unwrap();
        assert_eq!(second.headers().get(CACHED_HEADER).unwrap(), "true");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let layer = IdempotencyLayer::new(store).with_max_body_size(4);
        let app = payment_router(calls.clone(), layer);

        let response = app
            .oneshot(payment_request(Some("pay-1"), "{\"amount\":100}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fingerprinter_error_is_client_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let layer = IdempotencyLayer::new(store).with_fingerprinter(
            |_parts: &axum::http::request::Parts, _body: &[u8], _key: &str| {
                Err::<String, _>(IdempotencyError::store("digest unavailable"))
            },
        );
        let app = payment_router(calls.clone(), layer);

        let response = app.oneshot(payment_request(Some("pay-1"), "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_header_name_in_config() {
        let store = Arc::new(InMemoryStore::new(InMemoryStoreConfig::default()));
        let config = IdempotencyConfig {
            header_name: "bad header".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            IdempotencyLayer::from_config(store, &config),
            Err(IdempotencyError::Configuration { .. })
        ));
    }
}
