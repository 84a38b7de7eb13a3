//! Error types for the crypto channel.

/// Errors that can occur while opening or sealing flow payloads.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The envelope could not be authenticated: bad base64, a wrapped key
    /// that does not unwrap to 16 bytes, a short ciphertext or a tag
    /// mismatch. The session is untrusted.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The configured private key could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The response payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CryptoError {
    pub(crate) fn auth(reason: impl Into<String>) -> Self {
        Self::Authentication(reason.into())
    }
}
