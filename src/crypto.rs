//! cryptographic primitives for deadswitch
//!
//! - aes-256-gcm for authenticated encryption (detached tag)
//! - hmac-sha256 for share and envelope authentication
//! - os randomness via `rand`

use aes_gcm::{
    aead::{Aead, KeyInit as AeadKeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// required aead key length
pub const KEY_LEN: usize = 32;

/// aead nonce length
pub const IV_LEN: usize = 12;

/// aead authentication tag length
pub const TAG_LEN: usize = 16;

/// an aead ciphertext with detached nonce and tag
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AeadCiphertext {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
}

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_LEN {
        return Err(Error::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    AeadKeyInit::new_from_slice(key).map_err(|e| Error::EncryptionFailed(e.to_string()))
}

/// encrypt plaintext under a 32-byte key with a fresh random nonce
pub fn encrypt(plaintext: &[u8], key: &[u8], aad: Option<&[u8]>) -> Result<AeadCiphertext> {
    let cipher = cipher_for(key)?;
    let iv: [u8; IV_LEN] = random_bytes();

    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or(&[]),
    };
    let mut combined = cipher
        .encrypt(Nonce::from_slice(&iv), payload)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

    // aes-gcm appends the tag; detach it
    if combined.len() < TAG_LEN {
        return Err(Error::EncryptionFailed("ciphertext shorter than tag".into()));
    }
    let tag_bytes = combined.split_off(combined.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(AeadCiphertext {
        ciphertext: combined,
        iv,
        tag,
    })
}

/// decrypt an aead ciphertext
///
/// any tamper to ciphertext, iv, tag, or aad fails with
/// [`Error::DecryptionFailed`]. always an error, never a sentinel value,
/// so callers cannot be used as a tamper oracle.
pub fn decrypt(ct: &AeadCiphertext, key: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
    let cipher = cipher_for(key).map_err(|e| match e {
        Error::InvalidKeyLength { .. } => e,
        _ => Error::DecryptionFailed,
    })?;

    let mut combined = Vec::with_capacity(ct.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&ct.ciphertext);
    combined.extend_from_slice(&ct.tag);

    let payload = Payload {
        msg: &combined,
        aad: aad.unwrap_or(&[]),
    };
    cipher
        .decrypt(Nonce::from_slice(&ct.iv), payload)
        .map_err(|_| Error::DecryptionFailed)
}

/// compute hmac-sha256 over concatenated parts
pub fn mac(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let mut h: HmacSha256 = KeyInit::new_from_slice(key).expect("hmac accepts any key length");
    for d in data {
        Mac::update(&mut h, d);
    }
    h.finalize().into_bytes().into()
}
