//! AES-128-GCM sealing with the tag appended to the ciphertext.
//!
//! The messaging platform sends 16-byte IVs; standard 12-byte nonces are
//! accepted as well. GCM derives the counter block from non-96-bit IVs via
//! GHASH, so both lengths are plain `AesGcm` instantiations.

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce, Tag};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;

use crate::{CryptoError, SESSION_KEY_LEN, TAG_LEN};

type Aes128Gcm96 = AesGcm<Aes128, U12>;
type Aes128Gcm128 = AesGcm<Aes128, U16>;

/// Encrypts `plaintext` and returns `ciphertext || tag`.
///
/// # Errors
///
/// Returns `CryptoError::Authentication` for a key that is not 16 bytes or
/// an IV that is neither 12 nor 16 bytes.
pub fn seal(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    match iv.len() {
        12 => seal_with::<Aes128Gcm96>(key, iv, plaintext),
        16 => seal_with::<Aes128Gcm128>(key, iv, plaintext),
        n => Err(CryptoError::auth(format!("unsupported IV length {n}"))),
    }
}

/// Splits `data` into body and trailing 16-byte tag and decrypts the body,
/// verifying the tag.
///
/// # Errors
///
/// Returns `CryptoError::Authentication` on a tag mismatch, a short input,
/// a key that is not 16 bytes or an unsupported IV length.
pub fn open(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    if data.len() < TAG_LEN {
        return Err(CryptoError::auth(format!(
            "ciphertext is {} bytes, shorter than the {TAG_LEN}-byte tag",
            data.len()
        )));
    }
    let (body, tag) = data.split_at(data.len() - TAG_LEN);
    match iv.len() {
        12 => open_with::<Aes128Gcm96>(key, iv, body, tag),
        16 => open_with::<Aes128Gcm128>(key, iv, body, tag),
        n => Err(CryptoError::auth(format!("unsupported IV length {n}"))),
    }
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != SESSION_KEY_LEN {
        return Err(CryptoError::auth(format!(
            "session key is {} bytes, expected {SESSION_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}

fn seal_with<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::auth("invalid session key"))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<C>::from_slice(iv), b"", &mut buffer)
        .map_err(|_| CryptoError::auth("encryption failed"))?;
    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

fn open_with<C>(key: &[u8], iv: &[u8], body: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    C: AeadInPlace + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::auth("invalid session key"))?;
    let mut buffer = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::<C>::from_slice(iv),
            b"",
            &mut buffer,
            Tag::<C>::from_slice(tag),
        )
        .map_err(|_| CryptoError::auth("tag mismatch"))?;
    Ok(buffer)
}
