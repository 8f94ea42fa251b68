//! # Request Fingerprinting
//!
//! Derives the store key for an idempotent request. The key combines the
//! caller's idempotency key with a digest of method, path and body, so a key
//! reused for a different payload is treated as a different operation.

use crate::core::error::IdempotencyResult;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

/// Strategy turning a buffered request into a store key
pub trait Fingerprinter: Send + Sync {
    /// Build the key for `parts` + `body` under the caller's `idempotency_key`
    fn fingerprint(&self, parts: &Parts, body: &[u8], idempotency_key: &str) -> IdempotencyResult<String>;
}

/// Any matching closure can serve as a fingerprinter
impl<F> Fingerprinter for F
where
    F: Fn(&Parts, &[u8], &str) -> IdempotencyResult<String> + Send + Sync,
{
    fn fingerprint(&self, parts: &Parts, body: &[u8], idempotency_key: &str) -> IdempotencyResult<String> {
        self(parts, body, idempotency_key)
    }
}

/// Default fingerprinter: `{idempotency_key}:{hex(sha256(len(method) | method | len(path) | path | body))}`
///
/// Lengths are 8-byte big-endian, so no two (method, path, body) splits of
/// the same bytes hash alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Sha256Fingerprinter {
    pub fn new() -> Self {
        Self
    }

    /// Hex encoded digest of the request content
    pub fn content_digest(method: &str, path: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update((method.len() as u64).to_be_bytes());
        hasher.update(method.as_bytes());
        hasher.update((path.len() as u64).to_be_bytes());
        hasher.update(path.as_bytes());
        hasher.update(body);
        hex::encode(hasher.finalize())
    }
}

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, parts: &Parts, body: &[u8], idempotency_key: &str) -> IdempotencyResult<String> {
        let digest = Self::content_digest(parts.method.as_str(), parts.uri.path(), body);
        Ok(format!("{}:{}", idempotency_key, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::IdempotencyError;
    use axum::http::{Method, Request};

    fn parts(method: Method, uri: &str) -> Parts {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fingerprinter = Sha256Fingerprinter::new();
        let request = parts(Method::POST, "/api/payment");

        let first = fingerprinter.fingerprint(&request, b"{\"amount\":100}", "pay-1").unwrap();
        let second = fingerprinter.fingerprint(&request, b"{\"amount\":100}", "pay-1").unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("pay-1:"));
        // 256-bit digest, hex encoded
        assert_eq!(first.len(), "pay-1:".len() + 64);
    }

    #[test]
    fn test_known_digest() {
        let mut input = Vec::new();
        input.extend_from_slice(&4u64.to_be_bytes());
        input.extend_from_slice(b"POST");
        input.extend_from_slice(&1u64.to_be_bytes());
        input.extend_from_slice(b"/");
        let expected = hex::encode(Sha256::digest(&input));
        assert_eq!(Sha256Fingerprinter::content_digest("POST", "/", b""), expected);
    }

    #[test]
    fn test_different_body_gives_different_key() {
        let fingerprinter = Sha256Fingerprinter::new();
        let request = parts(Method::POST, "/api/payment");

        let first = fingerprinter.fingerprint(&request, b"{\"amount\":100}", "pay-1").unwrap();
        let second = fingerprinter.fingerprint(&request, b"{\"amount\":200}", "pay-1").unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_method_and_path_are_part_of_key() {
        let fingerprinter = Sha256Fingerprinter::new();

        let post = fingerprinter.fingerprint(&parts(Method::POST, "/a"), b"{}", "k").unwrap();
        let put = fingerprinter.fingerprint(&parts(Method::PUT, "/a"), b"{}", "k").unwrap();
        let other_path = fingerprinter.fingerprint(&parts(Method::POST, "/b"), b"{}", "k").unwrap();

        assert_ne!(post, put);
        assert_ne!(post, other_path);
    }

    #[test]
    fn test_path_and_body_boundary_is_kept() {
        let fingerprinter = Sha256Fingerprinter::new();

        let long_path = fingerprinter.fingerprint(&parts(Method::POST, "/ab"), b"c", "k").unwrap();
        let long_body = fingerprinter.fingerprint(&parts(Method::POST, "/a"), b"bc", "k").unwrap();

        assert_ne!(long_path, long_body);
        assert_ne!(
            Sha256Fingerprinter::content_digest("POS", "T/a", b""),
            Sha256Fingerprinter::content_digest("POST", "/a", b"")
        );
    }

    #[test]
    fn test_query_string_is_ignored() {
        let fingerprinter = Sha256Fingerprinter::new();

        let plain = fingerprinter.fingerprint(&parts(Method::POST, "/a"), b"{}", "k").unwrap();
        let with_query = fingerprinter.fingerprint(&parts(Method::POST, "/a?x=1"), b"{}", "k").unwrap();

        assert_eq!(plain, with_query);
    }

    #[test]
    fn test_closure_fingerprinter() {
        let fingerprinter = |parts: &Parts, _body: &[u8], key: &str| -> IdempotencyResult<String> {
            if key.len() > 8 {
                return Err(IdempotencyError::invalid_request("key too long"));
            }
            Ok(format!("{}:{}", parts.method, key))
        };
        let request = parts(Method::PATCH, "/a");

        assert_eq!(fingerprinter.fingerprint(&request, b"", "short").unwrap(), "PATCH:short");
        assert!(fingerprinter.fingerprint(&request, b"", "much-too-long").is_err());
    }
}
