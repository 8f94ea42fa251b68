//! # Response Capture
//!
//! [`TeeBody`] wraps the body produced by the wrapped service. Every frame is
//! handed to the caller as soon as the inner body yields it, and data frames
//! are copied into a buffer on the way. Once the body reaches its end the
//! captured response is written to the store and the fingerprint lock is
//! released; if the body fails or is dropped early, only the lock is released.

use super::stores::{CachedResponse, IdempotencyStore, LockGuard};
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

/// Everything needed to persist a response once its body is complete
pub(crate) struct Capture {
    store: Arc<dyn IdempotencyStore>,
    key: String,
    ttl: Duration,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    guard: LockGuard,
}

impl Capture {
    pub(crate) fn new(
        store: Arc<dyn IdempotencyStore>,
        guard: LockGuard,
        ttl: Duration,
        status: StatusCode,
        headers: HeaderMap,
    ) -> Self {
        Self {
            store,
            key: guard.key().to_string(),
            ttl,
            status,
            headers,
            body: BytesMut::new(),
            guard,
        }
    }

    /// Persist the captured response, then release the lock.
    ///
    /// Runs detached: the caller already has every byte, so store failures
    /// are only logged.
    fn finish(self) {
        let Capture {
            store,
            key,
            ttl,
            status,
            headers,
            body,
            guard,
        } = self;
        let response = CachedResponse::new(status, headers, body.freeze());

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.set(&key, &response, ttl).await {
                        Ok(()) => debug!(key = %key, store = store.name(), "Cached idempotent response"),
                        Err(e) => warn!(
                            key = %key,
                            store = store.name(),
                            error = %e,
                            "Failed to cache idempotent response"
                        ),
                    }
                    guard.release().await;
                });
            }
            Err(_) => {
                warn!(key = %key, "No tokio runtime available, idempotent response not cached");
                drop(guard);
            }
        }
    }
}

/// Body decorator that forwards frames and keeps a copy of the data
pub struct TeeBody {
    inner: Body,
    capture: Option<Capture>,
}

impl TeeBody {
    pub(crate) fn new(inner: Body, capture: Capture) -> Self {
        Self {
            inner,
            capture: Some(capture),
        }
    }

    /// Whether the response is still waiting to be persisted
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(capture), Some(data)) = (this.capture.as_mut(), frame.data_ref()) {
                    capture.body.extend_from_slice(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(capture) = this.capture.take() {
                    warn!(key = %capture.key, error = %e, "Response body failed, not caching");
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(capture) = this.capture.take() {
                    capture.finish();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };

        // Servers skip polling bodies that report end of stream up front
        if self.inner.is_end_stream() {
            capture.finish();
        } else {
            debug!(key = %capture.key, "Response body dropped before completion, not caching");
        }
    }
}
