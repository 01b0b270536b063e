//! authenticated secret sharing using shamir's scheme over GF(256)
//!
//! arbitrary t-of-n thresholds. every share carries an hmac-sha256 tag
//! binding `(share ‖ index)` to the switch's auth key, so a relay cannot
//! silently corrupt a share or reassign its index.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::mac;
use crate::{Error, Result};

/// a single unauthenticated share
///
/// share material is key-equivalent in aggregate, so shares wipe
/// themselves on drop wherever they end up.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    /// share index (1-indexed, must be non-zero)
    pub index: u8,
    /// share data (same length as secret)
    pub data: Vec<u8>,
}

/// a share plus its hmac-sha256 authentication tag
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AuthenticatedShare {
    pub index: u8,
    #[serde(with = "hex_bytes")]
    pub share: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub hmac: Vec<u8>,
}

/// GF(256) multiplication using AES polynomial (x^8 + x^4 + x^3 + x + 1)
fn gf256_mul(a: u8, b: u8) -> u8 {
    let mut result = 0u8;
    let mut a = a;
    let mut b = b;

    while b != 0 {
        if b & 1 != 0 {
            result ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b; // AES polynomial
        }
        b >>= 1;
    }
    result
}

/// GF(256) multiplicative inverse via a^254
fn gf256_inv(a: u8) -> u8 {
    if a == 0 {
        return 0; // 0 has no inverse
    }
    let mut result = a;
    for _ in 0..6 {
        result = gf256_mul(result, result);
        result = gf256_mul(result, a);
    }
    gf256_mul(result, result)
}

/// GF(256) division
fn gf256_div(a: u8, b: u8) -> u8 {
    gf256_mul(a, gf256_inv(b))
}

/// evaluate polynomial at point x
fn poly_eval(coeffs: &[u8], x: u8) -> u8 {
    let mut result = 0u8;
    let mut x_power = 1u8;

    for &coeff in coeffs {
        result ^= gf256_mul(coeff, x_power);
        x_power = gf256_mul(x_power, x);
    }
    result
}

/// lagrange interpolation at x=0 to recover the constant term
fn lagrange_interpolate(points: &[(u8, u8)]) -> u8 {
    let mut result = 0u8;

    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;

        for (j, &(xj, _)) in points.iter().enumerate() {
            if i != j {
                num = gf256_mul(num, xj); // (0 - xj) = xj in GF(256)
                den = gf256_mul(den, xi ^ xj); // (xi - xj)
            }
        }

        result ^= gf256_mul(yi, gf256_div(num, den));
    }

    result
}

fn check_params(secret_len: usize, n: usize, t: usize) -> Result<()> {
    if t == 0 || t > n || n > 255 {
        return Err(Error::InvalidThreshold {
            shares: n,
            threshold: t,
        });
    }
    if secret_len == 0 {
        return Err(Error::Validation("secret must not be empty".into()));
    }
    Ok(())
}

/// split a secret into n shares, any t of which reconstruct it
///
/// the secret is the constant term of a fresh degree-(t-1) polynomial
/// per byte; fewer than t shares carry no information about it.
pub fn split(secret: &[u8], n: usize, t: usize) -> Result<Vec<Share>> {
    check_params(secret.len(), n, t)?;

    let mut rng = rand::thread_rng();
    let mut shares: Vec<Share> = (1..=n as u8)
        .map(|index| Share {
            index,
            data: vec![0u8; secret.len()],
        })
        .collect();

    let mut coeffs = Zeroizing::new(vec![0u8; t]);
    for (byte_idx, &secret_byte) in secret.iter().enumerate() {
        coeffs[0] = secret_byte;
        if t > 1 {
            rng.fill_bytes(&mut coeffs[1..]);
        }
        for share in shares.iter_mut() {
            share.data[byte_idx] = poly_eval(&coeffs, share.index);
        }
    }

    Ok(shares)
}

/// reconstruct a secret from at least t shares
pub fn combine(shares: &[Share], t: usize) -> Result<Vec<u8>> {
    if shares.len() < t {
        return Err(Error::InsufficientShares {
            required: t,
            got: shares.len(),
        });
    }

    let used: Vec<&Share> = shares.iter().take(t).collect();
    let len = used[0].data.len();
    for s in &used {
        if s.index == 0 {
            return Err(Error::Validation("share index must be non-zero".into()));
        }
        if s.data.len() != len {
            return Err(Error::Validation("shares have mismatched lengths".into()));
        }
        if used.iter().filter(|o| o.index == s.index).count() > 1 {
            return Err(Error::Validation("duplicate share index".into()));
        }
    }

    let mut secret = vec![0u8; len];
    for (byte_idx, out) in secret.iter_mut().enumerate() {
        let points: Vec<(u8, u8)> = used.iter().map(|s| (s.index, s.data[byte_idx])).collect();
        *out = lagrange_interpolate(&points);
    }

    Ok(secret)
}

/// compute the hmac tag binding a share to its index
fn share_tag(auth_key: &[u8], data: &[u8], index: u8) -> [u8; 32] {
    mac(auth_key, &[data, &[index]])
}

/// split a secret and authenticate each share under the given auth key
pub fn split_and_authenticate(
    secret: &[u8],
    n: usize,
    t: usize,
    auth_key: &[u8; 32],
) -> Result<Vec<AuthenticatedShare>> {
    let shares = split(secret, n, t)?;
    Ok(shares
        .into_iter()
        .map(|s| {
            let hmac = share_tag(auth_key, &s.data, s.index).to_vec();
            AuthenticatedShare {
                index: s.index,
                share: s.data.clone(),
                hmac,
            }
        })
        .collect())
}

/// verify a single authenticated share (constant-time tag comparison)
pub fn verify_share(share: &AuthenticatedShare, auth_key: &[u8; 32]) -> Result<()> {
    let expected = share_tag(auth_key, &share.share, share.index);
    if expected.ct_eq(share.hmac.as_slice()).into() {
        Ok(())
    } else {
        Err(Error::HmacVerificationFailed)
    }
}

/// verify every share's hmac, then reconstruct
///
/// the first tag mismatch aborts the whole reconstruction. no partial
/// interpolation ever happens with unverified shares.
pub fn combine_authenticated(
    shares: &[AuthenticatedShare],
    auth_key: &[u8; 32],
    t: usize,
) -> Result<Vec<u8>> {
    if shares.len() < t {
        return Err(Error::InsufficientShares {
            required: t,
            got: shares.len(),
        });
    }

    for share in shares {
        verify_share(share, auth_key)?;
    }

    let plain: Vec<Share> = shares
        .iter()
        .map(|s| Share {
            index: s.index,
            data: s.share.clone(),
        })
        .collect();
    combine(&plain, t)
}

/// hex serialization helper for serde
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
