//! Expiring signed URL handles
//!
//! The Rust stand-in for cloud presigned URLs: the signer mints PUT/GET
//! URLs against the server's own object routes, carrying an expiry and a
//! keyed SHA-256 signature in the query string. The routes verify the
//! signature before touching the blob backend, so no credentials are
//! distributed to callers or agents.

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

/// Signature verification failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SignedUrlError {
    #[error("signature mismatch")]
    BadSignature,

    #[error("signed url expired")]
    Expired,

    #[error("malformed signed url: {0}")]
    Malformed(String),
}

/// Mints and verifies signed object URLs.
#[derive(Debug, Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    /// Public base URL of the object routes, without a trailing slash.
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            secret: secret.into(),
            base_url,
        }
    }

    /// Signed URL allowing one method on one key until `ttl` from now.
    fn presign(&self, method: &str, key: &str, ttl: Duration) -> String {
        let expires = (Utc::now() + ttl).timestamp();
        let sig = self.signature(method, key, expires);
        format!(
            "{}/objects/{}?expires={}&sig={}",
            self.base_url, key, expires, sig
        )
    }

    pub fn presign_put(&self, key: &str, ttl: Duration) -> String {
        self.presign("PUT", key, ttl)
    }

    pub fn presign_get(&self, key: &str, ttl: Duration) -> String {
        self.presign("GET", key, ttl)
    }

    /// Verify the query parameters presented to an object route.
    pub fn verify(
        &self,
        method: &str,
        key: &str,
        expires: i64,
        sig: &str,
    ) -> Result<(), SignedUrlError> {
        if self.signature(method, key, expires) != sig {
            return Err(SignedUrlError::BadSignature);
        }
        if Utc::now().timestamp() > expires {
            return Err(SignedUrlError::Expired);
        }
        Ok(())
    }

    fn signature(&self, method: &str, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(b"\n");
        hasher.update(method.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(&self.secret);
        format!("{:x}", hasher.finalize())
    }
}

/// Parse `expires` and `sig` out of a signed URL's query string.
pub fn parse_signed_query(query: &str) -> Result<(i64, String), SignedUrlError> {
    let mut expires = None;
    let mut sig = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("expires", v)) => {
                expires = Some(v.parse::<i64>().map_err(|_| {
                    SignedUrlError::Malformed(format!("bad expires value: {}", v))
                })?);
            }
            Some(("sig", v)) => sig = Some(v.to_string()),
            _ => {}
        }
    }
    match (expires, sig) {
        (Some(expires), Some(sig)) => Ok((expires, sig)),
        _ => Err(SignedUrlError::Malformed(
            "missing expires or sig parameter".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new(b"test-secret".to_vec(), "http://edge.local:8080/")
    }

    #[test]
    fn test_presign_shape() {
        let url = signer().presign_put("responses/r1/body", Duration::minutes(30));
        assert!(url.starts_with("http://edge.local:8080/objects/responses/r1/body?expires="));
        assert!(url.contains("&sig="));
    }

    #[test]
    fn test_round_trip_verification() {
        let signer = signer();
        let url = signer.presign_get("requests/r1/body", Duration::minutes(30));
        let query = url.split_once('?').unwrap().1;
        let (expires, sig) = parse_signed_query(query).unwrap();

        assert!(signer.verify("GET", "requests/r1/body", expires, &sig).is_ok());
    }

    #[test]
    fn test_method_is_bound_into_signature() {
        let signer = signer();
        let url = signer.presign_put("requests/r1/body", Duration::minutes(30));
        let query = url.split_once('?').unwrap().1;
        let (expires, sig) = parse_signed_query(query).unwrap();

        assert_eq!(
            signer.verify("GET", "requests/r1/body", expires, &sig),
            Err(SignedUrlError::BadSignature)
        );
    }

    #[test]
    fn test_key_tampering_is_rejected() {
        let signer = signer();
        let url = signer.presign_get("requests/r1/body", Duration::minutes(30));
        let query = url.split_once('?').unwrap().1;
        let (expires, sig) = parse_signed_query(query).unwrap();

        assert_eq!(
            signer.verify("GET", "requests/r2/body", expires, &sig),
            Err(SignedUrlError::BadSignature)
        );
    }

    #[test]
    fn test_expired_url() {
        let signer = signer();
        let url = signer.presign_get("requests/r1/body", Duration::seconds(-10));
        let query = url.split_once('?').unwrap().1;
        let (expires, sig) = parse_signed_query(query).unwrap();

        assert_eq!(
            signer.verify("GET", "requests/r1/body", expires, &sig),
            Err(SignedUrlError::Expired)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_signed_query("expires=abc&sig=x").is_err());
        assert!(parse_signed_query("sig=x").is_err());
        assert!(parse_signed_query("").is_err());
    }

    #[test]
    fn test_different_secrets_do_not_cross_verify() {
        let a = UrlSigner::new(b"secret-a".to_vec(), "http://x");
        let b = UrlSigner::new(b"secret-b".to_vec(), "http://x");
        let url = a.presign_get("k", Duration::minutes(5));
        let query = url.split_once('?').unwrap().1;
        let (expires, sig) = parse_signed_query(query).unwrap();

        assert_eq!(b.verify("GET", "k", expires, &sig), Err(SignedUrlError::BadSignature));
    }
}
