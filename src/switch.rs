//! switch lifecycle orchestration
//!
//! ties the subsystems together: derive the key hierarchy, encrypt the
//! message, split and authenticate the encryption key, seal each share
//! into an envelope, publish to the relay pool, and optionally anchor
//! the deadline in a bitcoin timelock. release runs the pipeline in
//! reverse, discarding anything corrupt along the way.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{decrypt, encrypt, random_bytes, AeadCiphertext};
use crate::envelope::{EnvelopeMeta, FragmentEnvelope};
use crate::kdf::{generate_salt, KeyHierarchy, PBKDF2_ITERATIONS, SALT_LEN};
use crate::relay::{
    FragmentEvent, PublishReceipt, RelayConfig, RelayIdentity, RelayPool, RelayTransport,
};
use crate::shamir::{combine_authenticated, split_and_authenticate, verify_share, AuthenticatedShare};
use crate::timelock::{
    is_check_in_safe, is_check_in_safe_at_time, is_timestamp, pubkey_from_secret, ChainView,
    TimelockCommitment,
};
use crate::{Error, Result};

use bitcoin::Network;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// switch creation parameters
#[derive(Clone, Debug)]
pub struct SwitchConfig {
    /// total share count (n)
    pub shares: usize,
    /// reconstruction threshold (t)
    pub threshold: usize,
    /// check-in interval; missing one trigger-arms the switch
    pub check_in_hours: u64,
    /// relay allowlist
    pub relay_urls: Vec<String>,
    pub relay: RelayConfig,
    pub network: Network,
    /// optional bitcoin locktime anchoring the deadline on-chain
    pub timelock: Option<u64>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            shares: 5,
            threshold: 3,
            check_in_hours: 72,
            relay_urls: Vec::new(),
            relay: RelayConfig::default(),
            network: Network::Testnet,
            timelock: None,
        }
    }
}

impl SwitchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threshold < 2 || self.threshold > self.shares || self.shares > 255 {
            return Err(Error::InvalidThreshold {
                shares: self.shares,
                threshold: self.threshold,
            });
        }
        if self.check_in_hours == 0 {
            return Err(Error::Validation("check-in interval must be non-zero".into()));
        }
        if self.relay_urls.is_empty() {
            return Err(Error::Validation("at least one relay url is required".into()));
        }
        Ok(())
    }
}

/// switch lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchStatus {
    Armed,
    Triggered,
    Cancelled,
}

/// the persistent switch record
///
/// contains no key material; everything here is safe to store locally.
/// the password plus this record is sufficient to release.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Switch {
    pub id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub check_in_hours: u64,
    pub status: SwitchStatus,
    pub salt: [u8; SALT_LEN],
    pub shares: usize,
    pub threshold: usize,
    pub relay_urls: Vec<String>,
    /// relay author key fragments are published under
    pub author: String,
    pub encrypted_message: AeadCiphertext,
    pub commitment: Option<TimelockCommitment>,
}

/// outcome of a switch creation
#[derive(Debug)]
pub struct CreateResult {
    pub switch: Switch,
    pub receipt: PublishReceipt,
}

/// outcome of a release
#[derive(Debug)]
pub struct ReleaseResult {
    pub plaintext: Vec<u8>,
    pub shares_used: usize,
    pub shares_discarded: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// client driving the full switch lifecycle over one relay transport
pub struct SwitchClient<T: RelayTransport> {
    pool: RelayPool<T>,
    config: SwitchConfig,
}

impl<T: RelayTransport> SwitchClient<T> {
    pub fn new(transport: T, config: SwitchConfig) -> Result<Self> {
        config.validate()?;
        let pool = RelayPool::new(&config.relay_urls, transport, config.relay.clone())?;
        Ok(Self { pool, config })
    }

    /// create and arm a switch
    ///
    /// the encryption key is split t-of-n, each share encrypted under
    /// its own fragment key and published redundantly. the message
    /// ciphertext stays in the returned record; relays only ever see
    /// encrypted shares.
    pub async fn create(
        &mut self,
        password: &str,
        message: &[u8],
        chain: Option<&ChainView>,
    ) -> Result<CreateResult> {
        if message.is_empty() {
            return Err(Error::Validation("message must not be empty".into()));
        }

        let id = hex::encode(random_bytes::<16>());
        let salt = generate_salt();
        let hierarchy = KeyHierarchy::derive(password, &salt, &id, self.config.shares)?;

        let encrypted_message =
            encrypt(message, &hierarchy.encryption_key, Some(id.as_bytes()))?;

        let auth_shares = split_and_authenticate(
            &hierarchy.encryption_key,
            self.config.shares,
            self.config.threshold,
            &hierarchy.auth_key,
        )?;

        let identity = RelayIdentity::from_seed(&hierarchy.nostr_key);
        let now = unix_now();
        let mut events = Vec::with_capacity(auth_shares.len());
        for share in &auth_shares {
            let fragment_key = &hierarchy.fragment_keys[share.index as usize - 1];
            let share_json = Zeroizing::new(
                serde_json::to_vec(share).map_err(|e| Error::Serialization(e.to_string()))?,
            );
            let sealed = FragmentEnvelope::seal(
                &encrypt(&share_json, fragment_key, Some(id.as_bytes()))?,
                &EnvelopeMeta {
                    salt: salt.to_vec(),
                    iterations: PBKDF2_ITERATIONS,
                    timestamp: now,
                },
            );
            events.push(FragmentEvent::fragment(&identity, share.index, &sealed));
        }

        let receipt = self.pool.publish(&events).await?;

        let commitment = match (self.config.timelock, chain) {
            (Some(locktime), Some(chain)) => {
                let pubkey = pubkey_from_secret(&hierarchy.bitcoin_key)?;
                Some(TimelockCommitment::new(
                    locktime,
                    &pubkey,
                    self.config.network,
                    chain,
                )?)
            }
            (Some(_), None) => {
                return Err(Error::Validation(
                    "a chain view is required to commit a timelock".into(),
                ))
            }
            _ => None,
        };

        info!(
            switch = %id,
            shares = self.config.shares,
            threshold = self.config.threshold,
            acks = receipt.acks,
            "switch armed"
        );

        Ok(CreateResult {
            switch: Switch {
                id,
                created_at: now,
                expires_at: now + self.config.check_in_hours * 3600,
                check_in_hours: self.config.check_in_hours,
                status: SwitchStatus::Armed,
                salt,
                shares: self.config.shares,
                threshold: self.config.threshold,
                relay_urls: self.config.relay_urls.clone(),
                author: identity.public_hex(),
                encrypted_message,
                commitment,
            },
            receipt,
        })
    }

    /// retrieve fragments and reconstruct the message
    ///
    /// corrupt envelopes, undecryptable fragments, and shares with bad
    /// hmacs are discarded individually; release succeeds as long as a
    /// threshold of intact shares survives.
    pub async fn release(&mut self, switch: &mut Switch, password: &str) -> Result<ReleaseResult> {
        let hierarchy =
            KeyHierarchy::derive(password, &switch.salt, &switch.id, switch.shares)?;
        let identity = RelayIdentity::from_seed(&hierarchy.nostr_key);

        let events = self.pool.retrieve(&identity.public_hex()).await?;
        let mut discarded = 0usize;
        let mut collected: HashMap<u8, AuthenticatedShare> = HashMap::new();

        for event in &events {
            let (index, envelope) = match event.fragment_payload() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(event = %event.id, error = %e, "discarding malformed fragment");
                    discarded += 1;
                    continue;
                }
            };
            if let Err(e) = envelope.verify() {
                warn!(index, error = %e, "discarding fragment with bad integrity");
                discarded += 1;
                continue;
            }
            let Some(fragment_key) = index
                .checked_sub(1)
                .and_then(|i| hierarchy.fragment_keys.get(i as usize))
            else {
                warn!(index, "discarding fragment with out-of-range index");
                discarded += 1;
                continue;
            };
            let share_json = match decrypt(
                &envelope.aead(),
                fragment_key,
                Some(switch.id.as_bytes()),
            ) {
                Ok(bytes) => Zeroizing::new(bytes),
                Err(e) => {
                    warn!(index, error = %e, "discarding undecryptable fragment");
                    discarded += 1;
                    continue;
                }
            };
            let share: AuthenticatedShare = match serde_json::from_slice(&share_json) {
                Ok(share) => share,
                Err(e) => {
                    warn!(index, error = %e, "discarding unparseable share");
                    discarded += 1;
                    continue;
                }
            };
            if let Err(e) = verify_share(&share, &hierarchy.auth_key) {
                warn!(index, error = %e, "discarding share with bad hmac");
                discarded += 1;
                continue;
            }
            collected.entry(share.index).or_insert(share);
        }

        if collected.len() < switch.threshold {
            return Err(Error::InsufficientShares {
                required: switch.threshold,
                got: collected.len(),
            });
        }

        let shares: Vec<AuthenticatedShare> = collected.into_values().collect();
        let recovered = Zeroizing::new(combine_authenticated(
            &shares,
            &hierarchy.auth_key,
            switch.threshold,
        )?);

        let plaintext = decrypt(
            &switch.encrypted_message,
            &recovered,
            Some(switch.id.as_bytes()),
        )?;

        switch.status = SwitchStatus::Triggered;
        info!(
            switch = %switch.id,
            used = shares.len(),
            discarded,
            "switch released"
        );

        Ok(ReleaseResult {
            plaintext,
            shares_used: shares.len(),
            shares_discarded: discarded,
        })
    }

    /// extend the deadline by one check-in interval
    ///
    /// when a timelock anchors the deadline, a check-in inside the chain
    /// safety margin is rejected: extending the application expiry
    /// cannot undo an already-spendable script.
    pub fn check_in(&self, switch: &mut Switch, chain: Option<&ChainView>) -> Result<u64> {
        if switch.status != SwitchStatus::Armed {
            return Err(Error::Validation(format!(
                "cannot check in on a {:?} switch",
                switch.status
            )));
        }

        if let (Some(commitment), Some(chain)) = (&switch.commitment, chain) {
            let safety = if is_timestamp(commitment.locktime) {
                is_check_in_safe_at_time(commitment.locktime, chain.now, Some(switch.expires_at))
            } else {
                is_check_in_safe(
                    commitment.locktime as u32,
                    chain.tip_height,
                    Some(switch.expires_at),
                    chain.now,
                )
            };
            if !safety.is_safe {
                return Err(Error::CheckInUnsafe {
                    level: safety.warning_level,
                    reason: safety.reason,
                });
            }
            if safety.warning_level > crate::timelock::WarningLevel::None {
                warn!(switch = %switch.id, reason = %safety.reason, "check-in warning");
            }
        }

        let new_expiry = unix_now() + switch.check_in_hours * 3600;
        switch.expires_at = new_expiry;
        info!(switch = %switch.id, expires_at = new_expiry, "checked in");
        Ok(new_expiry)
    }

    /// permanently disarm a switch
    pub fn cancel(&self, switch: &mut Switch) -> Result<()> {
        if switch.status != SwitchStatus::Armed {
            return Err(Error::Validation(format!(
                "cannot cancel a {:?} switch",
                switch.status
            )));
        }
        switch.status = SwitchStatus::Cancelled;
        info!(switch = %switch.id, "switch cancelled");
        Ok(())
    }

    /// pool redundancy report for status displays
    pub async fn relay_health(&mut self) -> crate::relay::RedundancyReport {
        self.pool.check_health().await;
        self.pool.redundancy_report()
    }
}
