//! Envelope crypto for the flow data-exchange endpoint.
//!
//! Requests arrive as an RSA-OAEP wrapped AES-128 key, AES-GCM ciphertext
//! with the 16-byte tag appended, and an IV. Responses are sealed with the
//! same key under the inverted IV.

pub mod aead;
mod channel;
mod error;

pub use channel::{flip_iv, CryptoChannel, EncryptedEnvelope, FlowSession, OpenedRequest};
pub use error::CryptoError;

/// Length of the unwrapped AES session key.
pub const SESSION_KEY_LEN: usize = 16;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;
