//! fragment integrity envelope
//!
//! self-contained serialization wrapping one encrypted share for storage
//! on relays the system does not control. the `integrity` field is a
//! sha-256 over every other field in canonical order, so any single-field
//! mutation is detectable without any key material.

use base64::Engine;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto::{AeadCiphertext, IV_LEN, TAG_LEN};
use crate::{Error, Result};

/// current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// the only algorithm this format carries
pub const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";

const FIELDS: [&str; 9] = [
    "version",
    "ciphertext",
    "iv",
    "authTag",
    "salt",
    "iterations",
    "algorithm",
    "timestamp",
    "integrity",
];

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// metadata carried alongside the ciphertext so a recipient holding only
/// the password can re-derive the hierarchy
#[derive(Clone, Debug)]
pub struct EnvelopeMeta {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub timestamp: u64,
}

/// a sealed fragment envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentEnvelope {
    pub version: u8,
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub auth_tag: [u8; TAG_LEN],
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub algorithm: String,
    pub timestamp: u64,
    pub integrity: String,
}

impl FragmentEnvelope {
    /// assemble an envelope around an encrypted share and stamp it with
    /// its integrity hash
    pub fn seal(encrypted: &AeadCiphertext, meta: &EnvelopeMeta) -> Self {
        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            ciphertext: encrypted.ciphertext.clone(),
            iv: encrypted.iv,
            auth_tag: encrypted.tag,
            salt: meta.salt.clone(),
            iterations: meta.iterations,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            timestamp: meta.timestamp,
            integrity: String::new(),
        };
        envelope.integrity = envelope.compute_integrity();
        envelope
    }

    /// canonical serialization of every field except `integrity`,
    /// in fixed field order
    fn canonical(&self) -> Vec<u8> {
        let e = b64();
        format!(
            "version:{}|ciphertext:{}|iv:{}|authTag:{}|salt:{}|iterations:{}|algorithm:{}|timestamp:{}",
            self.version,
            e.encode(&self.ciphertext),
            e.encode(self.iv),
            e.encode(self.auth_tag),
            e.encode(&self.salt),
            self.iterations,
            self.algorithm,
            self.timestamp,
        )
        .into_bytes()
    }

    fn compute_integrity(&self) -> String {
        hex::encode(Sha256::digest(self.canonical()))
    }

    /// verify the integrity hash and format version
    pub fn verify(&self) -> Result<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        if self.algorithm != ENVELOPE_ALGORITHM {
            return Err(Error::MalformedEnvelope(format!(
                "unknown algorithm {}",
                self.algorithm
            )));
        }
        let expected = self.compute_integrity();
        if expected.as_bytes().ct_eq(self.integrity.as_bytes()).into() {
            Ok(())
        } else {
            Err(Error::IntegrityVerificationFailed)
        }
    }

    /// the aead ciphertext this envelope wraps
    pub fn aead(&self) -> AeadCiphertext {
        AeadCiphertext {
            ciphertext: self.ciphertext.clone(),
            iv: self.iv,
            tag: self.auth_tag,
        }
    }

    /// serialize to the json wire form (binary fields base64)
    pub fn to_json(&self) -> String {
        let e = b64();
        json!({
            "version": self.version,
            "ciphertext": e.encode(&self.ciphertext),
            "iv": e.encode(self.iv),
            "authTag": e.encode(self.auth_tag),
            "salt": e.encode(&self.salt),
            "iterations": self.iterations,
            "algorithm": self.algorithm,
            "timestamp": self.timestamp,
            "integrity": self.integrity,
        })
        .to_string()
    }

    /// parse from the json wire form
    ///
    /// the schema is validated exhaustively: every field is required and
    /// unknown fields are structural errors, not warnings. the integrity
    /// hash is NOT checked here; call [`verify`](Self::verify).
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedEnvelope("not a json object".into()))?;

        for key in obj.keys() {
            if !FIELDS.contains(&key.as_str()) {
                return Err(Error::MalformedEnvelope(format!("unknown field {key}")));
            }
        }

        let version = req_u64(obj, "version")?;
        if version > u8::MAX as u64 {
            return Err(Error::MalformedEnvelope("version out of range".into()));
        }

        let iv_bytes = req_b64(obj, "iv")?;
        let iv: [u8; IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| Error::MalformedEnvelope("iv must be 12 bytes".into()))?;
        let tag_bytes = req_b64(obj, "authTag")?;
        let auth_tag: [u8; TAG_LEN] = tag_bytes
            .try_into()
            .map_err(|_| Error::MalformedEnvelope("authTag must be 16 bytes".into()))?;

        let iterations = req_u64(obj, "iterations")?;
        if iterations > u32::MAX as u64 {
            return Err(Error::MalformedEnvelope("iterations out of range".into()));
        }

        Ok(Self {
            version: version as u8,
            ciphertext: req_b64(obj, "ciphertext")?,
            iv,
            auth_tag,
            salt: req_b64(obj, "salt")?,
            iterations: iterations as u32,
            algorithm: req_str(obj, "algorithm")?,
            timestamp: req_u64(obj, "timestamp")?,
            integrity: req_str(obj, "integrity")?,
        })
    }
}

fn req<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value> {
    obj.get(field).ok_or(Error::MissingField(field))
}

fn req_str(obj: &Map<String, Value>, field: &'static str) -> Result<String> {
    req(obj, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedEnvelope(format!("{field} must be a string")))
}

fn req_u64(obj: &Map<String, Value>, field: &'static str) -> Result<u64> {
    req(obj, field)?
        .as_u64()
        .ok_or_else(|| Error::MalformedEnvelope(format!("{field} must be an integer")))
}

fn req_b64(obj: &Map<String, Value>, field: &'static str) -> Result<Vec<u8>> {
    let s = req_str(obj, field)?;
    b64()
        .decode(s.as_bytes())
        .map_err(|_| Error::MalformedEnvelope(format!("{field} is not valid base64")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt, random_bytes};

    fn sample() -> FragmentEnvelope {
        let key = random_bytes::<32>();
        let ct = encrypt(b"share bytes", &key, None).unwrap();
        FragmentEnvelope::seal(
            &ct,
            &EnvelopeMeta {
                salt: vec![1, 2, 3, 4],
                iterations: 600_000,
                timestamp: 1_700_000_000,
            },
        )
    }

    #[test]
    fn test_seal_verifies() {
        let env = sample();
        env.verify().unwrap();
    }

    #[test]
    fn test_json_roundtrip() {
        let env = sample();
        let parsed = FragmentEnvelope::from_json(&env.to_json()).unwrap();
        assert_eq!(env, parsed);
        parsed.verify().unwrap();
    }

    #[test]
    fn test_every_field_mutation_detected() {
        let base = sample();

        let mut e = base.clone();
        e.ciphertext[0] ^= 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));

        let mut e = base.clone();
        e.iv[0] ^= 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));

        let mut e = base.clone();
        e.auth_tag[0] ^= 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));

        let mut e = base.clone();
        e.salt[0] ^= 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));

        let mut e = base.clone();
        e.iterations += 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));

        let mut e = base.clone();
        e.timestamp += 1;
        assert!(matches!(e.verify(), Err(Error::IntegrityVerificationFailed)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut e = sample();
        e.version = 9;
        assert!(matches!(e.verify(), Err(Error::UnsupportedVersion(9))));
    }

    #[test]
    fn test_missing_field() {
        let env = sample();
        let mut value: Value = serde_json::from_str(&env.to_json()).unwrap();
        value.as_object_mut().unwrap().remove("iv");
        let err = FragmentEnvelope::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, Error::MissingField("iv")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let env = sample();
        let mut value: Value = serde_json::from_str(&env.to_json()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("extra".into(), json!("nope"));
        assert!(matches!(
            FragmentEnvelope::from_json(&value.to_string()),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_tampered_wire_integrity() {
        let env = sample();
        let mut value: Value = serde_json::from_str(&env.to_json()).unwrap();
        let iv = b64().encode([9u8; IV_LEN]);
        value.as_object_mut().unwrap().insert("iv".into(), json!(iv));
        let parsed = FragmentEnvelope::from_json(&value.to_string()).unwrap();
        assert!(matches!(
            parsed.verify(),
            Err(Error::IntegrityVerificationFailed)
        ));
    }
}
