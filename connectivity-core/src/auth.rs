//! HMAC request signing for authenticated venue calls

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConnectivityError, ConnectivityResult};
use crate::nonce::NonceGenerator;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "API-Key";
pub const API_NONCE_HEADER: &str = "API-Nonce";
pub const API_SIGNATURE_HEADER: &str = "API-Signature";

/// API key pair. The secret never appears in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn expose_secret(&self) -> &str {
        &self.api_secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[redacted]")
            .finish()
    }
}

/// Authentication headers for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub nonce: u64,
    pub signature: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, String); 3] {
        [
            (API_KEY_HEADER, self.api_key.clone()),
            (API_NONCE_HEADER, self.nonce.to_string()),
            (API_SIGNATURE_HEADER, self.signature.clone()),
        ]
    }
}

/// Signs requests with HMAC-SHA256, drawing nonces per API key
pub struct RequestSigner {
    credentials: Credentials,
    nonces: Arc<NonceGenerator>,
}

impl RequestSigner {
    pub fn new(credentials: Credentials, nonces: Arc<NonceGenerator>) -> Self {
        Self {
            credentials,
            nonces,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    /// Lowercase hex HMAC-SHA256 of `message`
    pub fn sign(&self, message: &str) -> ConnectivityResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.expose_secret().as_bytes())
            .map_err(|e| ConnectivityError::Protocol(format!("invalid signing key: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign `nonce + method + path + body` with the next nonce for this key
    pub fn sign_request(&self, method: &str, path: &str, body: &str) -> ConnectivityResult<SignedHeaders> {
        let nonce = self.nonces.next(&self.credentials.api_key);
        let payload = format!("{}{}{}{}", nonce, method.to_uppercase(), path, body);
        Ok(SignedHeaders {
            api_key: self.credentials.api_key.clone(),
            nonce,
            signature: self.sign(&payload)?,
        })
    }
}
