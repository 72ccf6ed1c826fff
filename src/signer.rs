//! Request signing for the TAMS API
//!
//! Every outbound call is signed with the account's RSA key using
//! PKCS#1 v1.5 / SHA-256 over a newline-joined canonical string:
//!
//! ```text
//! METHOD \n PATH \n TIMESTAMP \n NONCE \n BODY_MD5_HEX
//! ```
//!
//! The remote side rebuilds this string byte for byte, so the field order
//! and the exact body bytes must match what goes on the wire. A mismatch is
//! not a parse error, it is a silent 401.

use crate::error::SigningError;
use base64::Engine as _;
use md5::{Digest, Md5};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer as _};
use rsa::RsaPrivateKey;
use std::fmt;
use std::path::Path;

/// Scheme tag placed in front of the `Authorization` header parameters.
pub const AUTH_SCHEME: &str = "TAMS-SHA256-RSA";

/// Account identity plus its private key. Write-once; only [`Signer`] reads it.
pub struct Credential {
    app_id: String,
    private_key: RsaPrivateKey,
}

impl Credential {
    pub fn new(app_id: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        Self {
            app_id: app_id.into(),
            private_key,
        }
    }

    /// Parse a PEM key, accepting both PKCS#8 (`BEGIN PRIVATE KEY`) and
    /// PKCS#1 (`BEGIN RSA PRIVATE KEY`) encodings.
    pub fn from_pem(app_id: impl Into<String>, pem: &str) -> Result<Self, SigningError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SigningError::InvalidKey(format!("unreadable PEM: {}", e)))?;
        Ok(Self::new(app_id, private_key))
    }

    pub fn from_pem_file(app_id: impl Into<String>, path: &Path) -> Result<Self, SigningError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            SigningError::InvalidKey(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_pem(app_id, &pem)
    }

    /// Decode a base64-wrapped PEM, as shipped in `TAMS_PRIVATE_KEY_BASE64`.
    pub fn from_base64_pem(app_id: impl Into<String>, encoded: &str) -> Result<Self, SigningError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SigningError::InvalidKey(format!("invalid base64: {}", e)))?;
        let pem = String::from_utf8(raw)
            .map_err(|e| SigningError::InvalidKey(format!("PEM is not UTF-8: {}", e)))?;
        Self::from_pem(app_id, &pem)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("app_id", &self.app_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One signed outbound call. Built per request, consumed by the transport.
#[derive(Clone)]
pub struct SignedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: Vec<u8>,
}

impl SignedRequest {
    pub fn signature_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.signature)
    }
}

impl fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("body_len", &self.body.len())
            .field("timestamp", &self.timestamp)
            .field("nonce", &self.nonce)
            .field("signature", &"***")
            .finish()
    }
}

/// Build the exact byte string that gets signed.
pub fn canonicalize(
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Result<Vec<u8>, SigningError> {
    let method = method.trim().to_ascii_uppercase();
    if method.is_empty() {
        return Err(SigningError::Canonicalization("empty HTTP method".into()));
    }
    for (name, value) in [("method", method.as_str()), ("path", path), ("nonce", nonce)] {
        if value.contains('\n') || value.contains('\r') {
            return Err(SigningError::Canonicalization(format!(
                "{} contains a line break",
                name
            )));
        }
    }
    if nonce.is_empty() {
        return Err(SigningError::Canonicalization("empty nonce".into()));
    }

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    let body_md5 = if body.is_empty() {
        String::new()
    } else {
        format!("{:x}", Md5::digest(body))
    };

    Ok(format!("{}\n{}\n{}\n{}\n{}", method, path, timestamp, nonce, body_md5).into_bytes())
}

/// Holds the signing key. Stateless per call, so one instance is shared
/// across every job behind an `Arc`.
pub struct Signer {
    app_id: String,
    key: SigningKey<Sha256>,
}

impl Signer {
    /// Validate the credential and prove it can sign before accepting it.
    pub fn new(credential: Credential) -> Result<Self, SigningError> {
        credential
            .private_key
            .validate()
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;

        let signer = Self {
            app_id: credential.app_id,
            key: SigningKey::<Sha256>::new(credential.private_key),
        };
        signer.sign("GET", "/", b"", 0, "init-check")?;

        tracing::debug!("Signer initialized for app {}", signer.app_id);
        Ok(signer)
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Deterministic signature over the canonical request string.
    pub fn sign(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: i64,
        nonce: &str,
    ) -> Result<Vec<u8>, SigningError> {
        let data = canonicalize(method, path, timestamp, nonce, body)?;
        let signature = self
            .key
            .try_sign(&data)
            .map_err(|e| SigningError::Signature(e.to_string()))?;
        Ok(signature.to_vec())
    }

    /// Sign with a fresh timestamp and nonce.
    pub fn sign_request(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<SignedRequest, SigningError> {
        let timestamp = chrono::Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let signature = self.sign(method, path, body, timestamp, &nonce)?;

        Ok(SignedRequest {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            body: body.to_vec(),
            timestamp,
            nonce,
            signature,
        })
    }

    /// Render the `Authorization` header for a signed request.
    pub fn authorization(&self, request: &SignedRequest) -> String {
        format!(
            "{} app_id={},nonce_str={},timestamp={},signature={}",
            AUTH_SCHEME,
            self.app_id,
            request.nonce,
            request.timestamp,
            request.signature_base64()
        )
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::OnceLock;

    /// One throwaway key per test binary; generation dominates test time.
    pub fn test_key() -> RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("generate test key")
        })
        .clone()
    }

    pub fn test_signer() -> Signer {
        Signer::new(Credential::new("app_test", test_key())).expect("valid test key")
    }
}
