//! Hybrid RSA / AES-GCM session handling.
//!
//! Each request carries its own session: a fresh AES-128 key wrapped with
//! the endpoint's RSA public key (OAEP, SHA-256) plus an IV. The response is
//! sealed with the same key under the bitwise complement of the request IV.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{aead, CryptoError, SESSION_KEY_LEN};

/// The wire envelope posted by the messaging platform. All three fields are
/// base64 strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted_aes_key: String,
    pub encrypted_flow_data: String,
    pub initial_vector: String,
}

/// Per-request key material. Lives for a single request/response pair and
/// is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FlowSession {
    key: [u8; SESSION_KEY_LEN],
    iv: Vec<u8>,
}

impl FlowSession {
    /// The IV the request was encrypted with.
    pub fn request_iv(&self) -> &[u8] {
        &self.iv
    }

    /// The IV used for the response: every bit of the request IV inverted.
    pub fn response_iv(&self) -> Vec<u8> {
        flip_iv(&self.iv)
    }

    /// Seals `payload` as JSON for the response and returns it base64-encoded.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Serialization` if `payload` cannot be encoded.
    pub fn seal_response<T: Serialize>(&self, payload: &T) -> Result<String, CryptoError> {
        let body = serde_json::to_vec(payload)?;
        let sealed = aead::seal(&self.key, &self.response_iv(), &body)?;
        Ok(BASE64.encode(sealed))
    }
}

impl std::fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSession")
            .field("key", &"<redacted>")
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// A decrypted request body with the session needed to answer it.
#[derive(Debug)]
pub struct OpenedRequest {
    pub plaintext: Vec<u8>,
    pub session: FlowSession,
}

/// Holds the endpoint's RSA private key and opens incoming envelopes.
pub struct CryptoChannel {
    private_key: RsaPrivateKey,
}

impl CryptoChannel {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// Parses a PEM private key, PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
    /// (`BEGIN RSA PRIVATE KEY`).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPrivateKey` if neither encoding parses.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|pkcs8_err| {
                RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                    CryptoError::InvalidPrivateKey(format!(
                        "not PKCS#8 ({pkcs8_err}) nor PKCS#1 ({pkcs1_err})"
                    ))
                })
            })?;
        Ok(Self::new(key))
    }

    /// Unwraps the session key and decrypts the flow data.
    ///
    /// # Errors
    ///
    /// Every failure is reported as `CryptoError::Authentication`: malformed
    /// base64, an RSA unwrap failure, a session key that is not 16 bytes, an
    /// unsupported IV length or a tag mismatch.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<OpenedRequest, CryptoError> {
        let wrapped_key = decode_field("encrypted_aes_key", &envelope.encrypted_aes_key)?;
        let ciphertext = decode_field("encrypted_flow_data", &envelope.encrypted_flow_data)?;
        let iv = decode_field("initial_vector", &envelope.initial_vector)?;

        let mut unwrapped = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
            .map_err(|e| CryptoError::auth(format!("session key unwrap failed: {e}")))?;

        if unwrapped.len() != SESSION_KEY_LEN {
            let len = unwrapped.len();
            unwrapped.zeroize();
            return Err(CryptoError::auth(format!(
                "session key is {len} bytes, expected {SESSION_KEY_LEN}"
            )));
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&unwrapped);
        unwrapped.zeroize();

        let session = FlowSession { key, iv };
        let plaintext = aead::open(&session.key, &session.iv, &ciphertext)?;

        tracing::debug!(
            iv_len = session.iv.len(),
            plaintext_len = plaintext.len(),
            "flow envelope opened"
        );

        Ok(OpenedRequest { plaintext, session })
    }
}

impl std::fmt::Debug for CryptoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoChannel").finish_non_exhaustive()
    }
}

/// Inverts every bit of `iv`.
pub fn flip_iv(iv: &[u8]) -> Vec<u8> {
    iv.iter().map(|b| !b).collect()
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value.trim())
        .map_err(|e| CryptoError::auth(format!("{name} is not valid base64: {e}")))
}
