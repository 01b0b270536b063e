//! error types for deadswitch

use thiserror::Error;

use crate::timelock::WarningLevel;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // === crypto errors ===
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    // === secret sharing errors ===
    #[error("invalid threshold: {threshold} of {shares}")]
    InvalidThreshold { shares: usize, threshold: usize },

    #[error("not enough shares: need {required}, got {got}")]
    InsufficientShares { required: usize, got: usize },

    #[error("share hmac verification failed")]
    HmacVerificationFailed,

    // === envelope errors ===
    #[error("envelope integrity verification failed")]
    IntegrityVerificationFailed,

    #[error("envelope missing required field: {0}")]
    MissingField(&'static str),

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    // === relay errors ===
    #[error("invalid relay url {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("no usable relays after validation")]
    NoUsableRelays,

    #[error("publish quorum not reached: {acks} acks, need {required}")]
    QuorumNotReached { acks: usize, required: usize },

    #[error("all relays failed")]
    AllRelaysFailed,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid relay event: {0}")]
    InvalidEvent(String),

    // === timelock errors ===
    #[error("timelock {locktime} is in the past")]
    PastTimelock { locktime: u64 },

    #[error("timelock {locktime} must be at least 24 hours in the future")]
    TimelockTooSoon { locktime: u64 },

    #[error("timelock {locktime} exceeds the 32-bit consensus limit")]
    ConsensusLimitExceeded { locktime: u64 },

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("check-in rejected ({level:?}): {reason}")]
    CheckInUnsafe { level: WarningLevel, reason: String },

    // === monitor errors ===
    #[error("transaction {txid} was dropped from the mempool")]
    TxDropped { txid: String },

    #[error("monitoring of {txid} timed out")]
    MonitorTimeout { txid: String },

    #[error("monitor stopped before reaching a terminal state")]
    MonitorStopped,

    // === general ===
    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// whether a failed operation may succeed on retry.
    ///
    /// only transport-level failures qualify. validation and
    /// cryptographic failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::AllRelaysFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(Error::AllRelaysFailed.is_retryable());
        assert!(!Error::DecryptionFailed.is_retryable());
        assert!(!Error::HmacVerificationFailed.is_retryable());
        assert!(!Error::InsufficientShares { required: 3, got: 1 }.is_retryable());
        assert!(!Error::PastTimelock { locktime: 100 }.is_retryable());
    }
}
