//! bitcoin CLTV timelock subsystem
//!
//! builds `<locktime> OP_CLTV OP_DROP <pubkey> OP_CHECKSIG` scripts and
//! their P2WSH addresses, validates locktimes against consensus rules,
//! estimates unlock times under median-time-past semantics, and enforces
//! the check-in safety margin that keeps the application trigger from
//! racing the chain trigger.

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CLTV, OP_DROP};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// consensus boundary: below this a locktime is a block height,
/// at or above it a unix timestamp
pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

/// ceiling of the 32-bit locktime field (~year 2106)
pub const MAX_LOCKTIME: u64 = 0x7FFF_FFFF;

/// minimum lead time for a new timelock
pub const MIN_LEAD_SECS: u64 = 24 * 3600;

/// height equivalent of the minimum lead time (~24h of blocks)
pub const MIN_LEAD_BLOCKS: u32 = 144;

/// check-ins inside this many blocks of the timelock are rejected
pub const SAFETY_MARGIN_BLOCKS: u32 = 24;

/// timestamp-locktime equivalent of the block safety margin (~4 hours)
pub const SAFETY_MARGIN_SECS: u64 = SAFETY_MARGIN_BLOCKS as u64 * AVG_BLOCK_SECS;

/// average block interval used for estimates
pub const AVG_BLOCK_SECS: u64 = 600;

/// median-time-past consensus uncertainty window for timestamp locktimes
pub const MTP_WINDOW_SECS: u64 = 2 * 3600;

/// tolerated divergence between application expiry and chain estimate
pub const DESYNC_TOLERANCE_SECS: u64 = 3600;

/// a view of the chain used for validation and estimation
#[derive(Clone, Copy, Debug)]
pub struct ChainView {
    /// current tip height
    pub tip_height: u32,
    /// current wall-clock unix time in seconds
    pub now: u64,
}

/// check-in safety verdict severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WarningLevel {
    None,
    Medium,
    High,
    Critical,
}

/// result of the check-in race analysis
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckInSafety {
    pub is_safe: bool,
    pub warning_level: WarningLevel,
    pub reason: String,
    pub recommendation: String,
}

/// estimated unlock window for a locktime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockEstimate {
    /// earliest plausible unlock (unix seconds)
    pub earliest: u64,
    /// midpoint estimate
    pub expected: u64,
    /// latest plausible unlock
    pub latest: u64,
}

/// an immutable timelock commitment: script, address, and parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelockCommitment {
    pub locktime: u64,
    pub script: ScriptBuf,
    pub address: String,
    pub network: Network,
}

/// derive the secp256k1 public key for a 32-byte secret
pub fn pubkey_from_secret(secret: &[u8; 32]) -> Result<PublicKey> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret).map_err(|e| Error::InvalidPubkey(e.to_string()))?;
    Ok(PublicKey::new(sk.public_key(&secp)))
}

/// build the CLTV script: `<locktime> OP_CLTV OP_DROP <pubkey> OP_CHECKSIG`
pub fn create_timelock_script(locktime: u64, pubkey: &PublicKey) -> Result<ScriptBuf> {
    if locktime > MAX_LOCKTIME {
        return Err(Error::ConsensusLimitExceeded { locktime });
    }
    Ok(Builder::new()
        .push_lock_time(LockTime::from_consensus(locktime as u32))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(pubkey)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// deterministic network-specific P2WSH address for a timelock script
pub fn create_timelock_address(script: &ScriptBuf, network: Network) -> Address {
    Address::p2wsh(script, network)
}

/// whether a locktime value is interpreted as a unix timestamp
pub fn is_timestamp(locktime: u64) -> bool {
    locktime >= LOCKTIME_THRESHOLD
}

/// validate a locktime for a new commitment
///
/// rejects past locktimes, locktimes less than 24 hours out, and values
/// above the 32-bit consensus ceiling.
pub fn validate_timelock(locktime: u64, chain: &ChainView) -> Result<()> {
    if locktime > MAX_LOCKTIME {
        return Err(Error::ConsensusLimitExceeded { locktime });
    }
    if is_timestamp(locktime) {
        if locktime <= chain.now {
            return Err(Error::PastTimelock { locktime });
        }
        if locktime < chain.now + MIN_LEAD_SECS {
            return Err(Error::TimelockTooSoon { locktime });
        }
    } else {
        let height = locktime as u32;
        if height <= chain.tip_height {
            return Err(Error::PastTimelock { locktime });
        }
        if height < chain.tip_height + MIN_LEAD_BLOCKS {
            return Err(Error::TimelockTooSoon { locktime });
        }
    }
    Ok(())
}

/// estimate when a locktime becomes spendable
///
/// timestamp locktimes unlock once median-time-past passes them, which
/// trails wall-clock time by up to ~2 hours; height locktimes are
/// projected from the tip at the average block interval.
pub fn estimate_unlock_time(locktime: u64, chain: &ChainView) -> UnlockEstimate {
    if is_timestamp(locktime) {
        UnlockEstimate {
            earliest: locktime,
            expected: locktime + MTP_WINDOW_SECS / 2,
            latest: locktime + MTP_WINDOW_SECS,
        }
    } else {
        let remaining = (locktime as u32).saturating_sub(chain.tip_height) as u64;
        UnlockEstimate {
            earliest: chain.now + remaining * (AVG_BLOCK_SECS * 4 / 5),
            expected: chain.now + remaining * AVG_BLOCK_SECS,
            latest: chain.now + remaining * (AVG_BLOCK_SECS * 6 / 5),
        }
    }
}

/// decide whether a check-in is safe relative to a height timelock
///
/// a check-in that lands after the chain has already made the timelock
/// spendable cannot undo the release; anything inside the safety margin
/// is rejected. a material divergence between the application's own
/// expiry estimate and the chain-derived estimate is flagged separately.
pub fn is_check_in_safe(
    timelock_height: u32,
    current_height: u32,
    app_expiry: Option<u64>,
    now: u64,
) -> CheckInSafety {
    if current_height >= timelock_height {
        return CheckInSafety {
            is_safe: false,
            warning_level: WarningLevel::Critical,
            reason: format!(
                "timelock at height {timelock_height} is already spendable (tip {current_height})"
            ),
            recommendation: "treat the switch as released; do not rely on check-ins".into(),
        };
    }

    let blocks_remaining = timelock_height - current_height;
    if blocks_remaining <= SAFETY_MARGIN_BLOCKS {
        return CheckInSafety {
            is_safe: false,
            warning_level: WarningLevel::High,
            reason: format!(
                "only {blocks_remaining} blocks until the timelock, inside the {SAFETY_MARGIN_BLOCKS}-block safety margin"
            ),
            recommendation: "create a new switch with a later timelock instead of checking in"
                .into(),
        };
    }

    if let Some(expiry) = app_expiry {
        let chain_estimate = now + blocks_remaining as u64 * AVG_BLOCK_SECS;
        let divergence = chain_estimate.abs_diff(expiry);
        if divergence > DESYNC_TOLERANCE_SECS {
            return CheckInSafety {
                is_safe: true,
                warning_level: WarningLevel::Medium,
                reason: format!(
                    "application expiry diverges from the chain estimate by {divergence}s"
                ),
                recommendation:
                    "re-align the application expiry with the bitcoin-derived unlock estimate"
                        .into(),
            };
        }
    }

    CheckInSafety {
        is_safe: true,
        warning_level: WarningLevel::None,
        reason: format!("{blocks_remaining} blocks of margin remain"),
        recommendation: "safe to check in".into(),
    }
}

/// decide whether a check-in is safe relative to a timestamp timelock
///
/// same verdict ladder as the height variant, measured in seconds:
/// Critical once the locktime has passed, High inside the ~4 hour
/// margin, Medium when the application expiry diverges from the
/// MTP-adjusted unlock estimate.
pub fn is_check_in_safe_at_time(locktime: u64, now: u64, app_expiry: Option<u64>) -> CheckInSafety {
    if now >= locktime {
        return CheckInSafety {
            is_safe: false,
            warning_level: WarningLevel::Critical,
            reason: format!("timelock at {locktime} has already passed (now {now})"),
            recommendation: "treat the switch as released; do not rely on check-ins".into(),
        };
    }

    let secs_remaining = locktime - now;
    if secs_remaining <= SAFETY_MARGIN_SECS {
        return CheckInSafety {
            is_safe: false,
            warning_level: WarningLevel::High,
            reason: format!(
                "only {secs_remaining}s until the timelock, inside the {SAFETY_MARGIN_SECS}s safety margin"
            ),
            recommendation: "create a new switch with a later timelock instead of checking in"
                .into(),
        };
    }

    if let Some(expiry) = app_expiry {
        let chain_estimate = locktime + MTP_WINDOW_SECS / 2;
        let divergence = chain_estimate.abs_diff(expiry);
        if divergence > DESYNC_TOLERANCE_SECS {
            return CheckInSafety {
                is_safe: true,
                warning_level: WarningLevel::Medium,
                reason: format!(
                    "application expiry diverges from the chain estimate by {divergence}s"
                ),
                recommendation:
                    "re-align the application expiry with the bitcoin-derived unlock estimate"
                        .into(),
            };
        }
    }

    CheckInSafety {
        is_safe: true,
        warning_level: WarningLevel::None,
        reason: format!("{secs_remaining}s of margin remain"),
        recommendation: "safe to check in".into(),
    }
}

impl TimelockCommitment {
    /// validate the locktime and build the script and address
    pub fn new(
        locktime: u64,
        pubkey: &PublicKey,
        network: Network,
        chain: &ChainView,
    ) -> Result<Self> {
        validate_timelock(locktime, chain)?;
        let script = create_timelock_script(locktime, pubkey)?;
        let address = create_timelock_address(&script, network);
        Ok(Self {
            locktime,
            script,
            address: address.to_string(),
            network,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::Instruction;

    const NOW: u64 = 1_700_000_000;

    fn chain() -> ChainView {
        ChainView {
            tip_height: 800_000,
            now: NOW,
        }
    }

    fn test_pubkey() -> PublicKey {
        pubkey_from_secret(&[0x42u8; 32]).unwrap()
    }

    #[test]
    fn test_script_shape() {
        let locktime = NOW + 25 * 3600;
        let script = create_timelock_script(locktime, &test_pubkey()).unwrap();

        let instructions: Vec<Instruction> = script
            .instructions()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(instructions.len(), 5);
        assert!(matches!(instructions[1], Instruction::Op(op) if op == OP_CLTV));
        assert!(matches!(instructions[2], Instruction::Op(op) if op == OP_DROP));
        assert!(matches!(instructions[4], Instruction::Op(op) if op == OP_CHECKSIG));
    }

    #[test]
    fn test_address_deterministic_and_network_specific() {
        let script = create_timelock_script(NOW + 48 * 3600, &test_pubkey()).unwrap();
        let a = create_timelock_address(&script, Network::Testnet);
        let b = create_timelock_address(&script, Network::Testnet);
        let mainnet = create_timelock_address(&script, Network::Bitcoin);
        assert_eq!(a, b);
        assert_ne!(a.to_string(), mainnet.to_string());
        assert!(a.to_string().starts_with("tb1"));
        assert!(mainnet.to_string().starts_with("bc1"));
    }

    #[test]
    fn test_validate_timestamp_locktimes() {
        let c = chain();
        assert!(matches!(
            validate_timelock(NOW - 100, &c),
            Err(Error::PastTimelock { .. })
        ));
        assert!(matches!(
            validate_timelock(NOW + 23 * 3600, &c),
            Err(Error::TimelockTooSoon { .. })
        ));
        validate_timelock(NOW + 25 * 3600, &c).unwrap();
        assert!(matches!(
            validate_timelock(MAX_LOCKTIME + 1, &c),
            Err(Error::ConsensusLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_validate_height_locktimes() {
        let c = chain();
        assert!(matches!(
            validate_timelock(799_000, &c),
            Err(Error::PastTimelock { .. })
        ));
        assert!(matches!(
            validate_timelock(800_100, &c),
            Err(Error::TimelockTooSoon { .. })
        ));
        validate_timelock(800_200, &c).unwrap();
    }

    #[test]
    fn test_unlock_estimate_timestamp() {
        let locktime = NOW + 100_000;
        let est = estimate_unlock_time(locktime, &chain());
        assert_eq!(est.earliest, locktime);
        assert_eq!(est.latest, locktime + MTP_WINDOW_SECS);
        assert_eq!(est.expected, locktime + MTP_WINDOW_SECS / 2);
    }

    #[test]
    fn test_unlock_estimate_height() {
        let c = chain();
        let est = estimate_unlock_time(c.tip_height as u64 + 100, &c);
        assert_eq!(est.expected, c.now + 100 * AVG_BLOCK_SECS);
        assert!(est.earliest < est.expected);
        assert!(est.latest > est.expected);
    }

    #[test]
    fn test_check_in_inside_margin() {
        let safety = is_check_in_safe(1000, 990, None, NOW);
        assert!(!safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::High);
    }

    #[test]
    fn test_check_in_already_spendable() {
        let safety = is_check_in_safe(1000, 1000, None, NOW);
        assert!(!safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::Critical);
    }

    #[test]
    fn test_check_in_desync_flagged() {
        // 1000 blocks out, app expiry claims unlock in only one hour
        let safety = is_check_in_safe(801_000, 800_000, Some(NOW + 3600), NOW);
        assert!(safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::Medium);
    }

    #[test]
    fn test_check_in_safe() {
        let expiry = NOW + 1000 * AVG_BLOCK_SECS;
        let safety = is_check_in_safe(801_000, 800_000, Some(expiry), NOW);
        assert!(safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::None);
    }

    #[test]
    fn test_check_in_timestamp_already_passed() {
        let safety = is_check_in_safe_at_time(NOW - 3600, NOW, None);
        assert!(!safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::Critical);
    }

    #[test]
    fn test_check_in_timestamp_inside_margin() {
        let safety = is_check_in_safe_at_time(NOW + 2 * 3600, NOW, None);
        assert!(!safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::High);
    }

    #[test]
    fn test_check_in_timestamp_desync_flagged() {
        let locktime = NOW + 48 * 3600;
        let safety = is_check_in_safe_at_time(locktime, NOW, Some(NOW + 3600));
        assert!(safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::Medium);
    }

    #[test]
    fn test_check_in_timestamp_safe() {
        let locktime = NOW + 48 * 3600;
        let safety = is_check_in_safe_at_time(locktime, NOW, Some(locktime + MTP_WINDOW_SECS / 2));
        assert!(safety.is_safe);
        assert_eq!(safety.warning_level, WarningLevel::None);
    }

    #[test]
    fn test_commitment() {
        let commitment = TimelockCommitment::new(
            NOW + 48 * 3600,
            &test_pubkey(),
            Network::Testnet,
            &chain(),
        )
        .unwrap();
        assert!(commitment.address.starts_with("tb1"));
        assert!(!commitment.script.is_empty());
    }
}
