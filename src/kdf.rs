//! key derivation hierarchy
//!
//! password → pbkdf2 master key → hkdf domain-separated subkeys.
//!
//! every key a switch ever uses descends from one slow root:
//!
//! ```text
//!   pbkdf2(password, salt, 600k)
//!            │
//!            ▼ hkdf "switch|<id>|v1"
//!       switch key
//!       │    │    │    │     │
//!       ▼    ▼    ▼    ▼     ▼
//!     encr  auth  btc nostr fragment|0..n
//! ```
//!
//! the switch id is baked into the domain string before any purpose
//! derivation, so compromising one switch's keys reveals nothing about
//! another switch even under an identical password and salt.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::random_bytes;
use crate::{Error, Result};

/// pbkdf2 iteration count for the master key
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// salt length in bytes; generated once per switch and persisted
pub const SALT_LEN: usize = 16;

/// hierarchy format version
pub const HIERARCHY_VERSION: u8 = 1;

/// non-secret derivation parameters, kept alongside the keys
#[derive(Clone, Debug)]
pub struct HierarchyMetadata {
    pub switch_id: String,
    pub version: u8,
    pub iterations: u32,
}

/// the full key hierarchy for one switch
///
/// owned exclusively by one create/release call and zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyHierarchy {
    pub encryption_key: [u8; 32],
    pub auth_key: [u8; 32],
    pub bitcoin_key: [u8; 32],
    pub nostr_key: [u8; 32],
    pub fragment_keys: Vec<[u8; 32]>,
    #[zeroize(skip)]
    pub metadata: HierarchyMetadata,
}

/// generate a fresh per-switch salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    random_bytes()
}

fn expand(hk: &Hkdf<Sha256>, info: &str) -> Result<[u8; 32]> {
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| Error::KdfFailed(e.to_string()))?;
    Ok(okm)
}

impl KeyHierarchy {
    /// derive the hierarchy for a switch
    ///
    /// deterministic: identical `(password, salt, switch_id)` always
    /// reproduces the identical hierarchy.
    pub fn derive(
        password: &str,
        salt: &[u8],
        switch_id: &str,
        fragment_count: usize,
    ) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::Validation("password must not be empty".into()));
        }
        if salt.is_empty() {
            return Err(Error::Validation("salt must not be empty".into()));
        }
        if switch_id.is_empty() {
            return Err(Error::Validation("switch id must not be empty".into()));
        }

        let mut master = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut *master);

        let root = Hkdf::<Sha256>::new(None, &*master);
        let switch_key = Zeroizing::new(expand(&root, &format!("switch|{switch_id}|v1"))?);

        let hk = Hkdf::<Sha256>::new(None, &*switch_key);
        let mut fragment_keys = Vec::with_capacity(fragment_count);
        for index in 0..fragment_count {
            fragment_keys.push(expand(&hk, &format!("fragment|{index}"))?);
        }

        Ok(Self {
            encryption_key: expand(&hk, "encryption")?,
            auth_key: expand(&hk, "auth")?,
            bitcoin_key: expand(&hk, "bitcoin")?,
            nostr_key: expand(&hk, "nostr")?,
            fragment_keys,
            metadata: HierarchyMetadata {
                switch_id: switch_id.to_string(),
                version: HIERARCHY_VERSION,
                iterations: PBKDF2_ITERATIONS,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pbkdf2 at 600k iterations dominates test time, so tests share
    // derivations where possible

    #[test]
    fn test_deterministic_and_isolated() {
        let salt = [7u8; SALT_LEN];

        let a = KeyHierarchy::derive("correct horse", &salt, "switch-1", 3).unwrap();
        let b = KeyHierarchy::derive("correct horse", &salt, "switch-1", 3).unwrap();
        let c = KeyHierarchy::derive("correct horse", &salt, "switch-2", 3).unwrap();

        // reproducible for identical inputs
        assert_eq!(a.encryption_key, b.encryption_key);
        assert_eq!(a.auth_key, b.auth_key);
        assert_eq!(a.bitcoin_key, b.bitcoin_key);
        assert_eq!(a.nostr_key, b.nostr_key);
        assert_eq!(a.fragment_keys, b.fragment_keys);

        // different switch id diverges everywhere, same password and salt
        assert_ne!(a.encryption_key, c.encryption_key);
        assert_ne!(a.auth_key, c.auth_key);
        assert_ne!(a.fragment_keys[0], c.fragment_keys[0]);
    }

    #[test]
    fn test_purpose_keys_distinct() {
        let salt = [1u8; SALT_LEN];
        let h = KeyHierarchy::derive("pw", &salt, "s", 2).unwrap();

        assert_ne!(h.encryption_key, h.auth_key);
        assert_ne!(h.encryption_key, h.bitcoin_key);
        assert_ne!(h.encryption_key, h.nostr_key);
        assert_ne!(h.fragment_keys[0], h.fragment_keys[1]);
        assert_ne!(h.fragment_keys[0], h.encryption_key);
    }

    #[test]
    fn test_rejects_empty_inputs() {
        let salt = [1u8; SALT_LEN];
        assert!(KeyHierarchy::derive("", &salt, "s", 1).is_err());
        assert!(KeyHierarchy::derive("pw", &[], "s", 1).is_err());
        assert!(KeyHierarchy::derive("pw", &salt, "", 1).is_err());
    }

    #[test]
    fn test_metadata() {
        let h = KeyHierarchy::derive("pw", &[2u8; SALT_LEN], "meta", 5).unwrap();
        assert_eq!(h.metadata.switch_id, "meta");
        assert_eq!(h.metadata.version, HIERARCHY_VERSION);
        assert_eq!(h.metadata.iterations, PBKDF2_ITERATIONS);
        assert_eq!(h.fragment_keys.len(), 5);
    }
}
