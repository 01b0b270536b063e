//! # deadswitch
//!
//! a dead man's switch: an encrypted message that releases automatically
//! when its owner stops checking in, with fragments stored redundantly
//! on relays the system does not trust and an optional bitcoin timelock
//! anchoring the deadline on-chain.
//!
//! ## architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ password + salt  │
//! └────────┬─────────┘
//!          │ pbkdf2 600k → hkdf "switch|<id>|v1"
//!          ▼
//!   ┌─────────────┐
//!   │ key hierarchy│  encr / auth / btc / nostr / fragment|0..n
//!   └─────┬────────┘
//!         │ aes-256-gcm(message)
//!         │ shamir t-of-n split of the encryption key
//!    ┌────┴────┬─────────┐
//!    ▼         ▼         ▼
//! ┌──────┐ ┌──────┐ ┌──────┐
//! │share │ │share │ │share │   each hmac-tagged, encrypted under
//! │  1   │ │  2   │ │  n   │   its own fragment key, sealed in a
//! └──┬───┘ └──┬───┘ └──┬───┘   tamper-evident envelope
//!    │        │        │
//!    ▼        ▼        ▼
//!  ┌────────────────────────┐
//!  │  relay pool (quorum)   │  signed events, fan-out publish,
//!  └───────────┬────────────┘  merged retrieve
//!              │
//!              ▼
//!  ┌────────────────────────┐
//!  │ bitcoin CLTV timelock  │  optional on-chain deadline anchor
//!  └────────────────────────┘
//! ```
//!
//! ## security properties
//!
//! - relays only ever see encrypted, integrity-wrapped shares
//! - fewer than t shares reveal nothing about the encryption key
//! - every share carries an hmac binding data and index; corrupt or
//!   reassigned shares are rejected before any interpolation
//! - one switch's keys reveal nothing about another switch, even under
//!   an identical password and salt
//! - check-ins inside the chain safety margin are rejected so the
//!   application deadline cannot silently race the timelock
//!
//! ## usage
//!
//! ```rust,ignore
//! use deadswitch::{SwitchClient, SwitchConfig, HttpRelayTransport};
//!
//! let transport = HttpRelayTransport::new(std::time::Duration::from_secs(10))?;
//! let mut client = SwitchClient::new(transport, config)?;
//!
//! // arm: encrypt, split, publish
//! let created = client.create("password", b"the message", None).await?;
//!
//! // every check_in_hours, or the switch releases
//! client.check_in(&mut switch, None)?;
//!
//! // after the deadline: retrieve, reconstruct, decrypt
//! let released = client.release(&mut switch, "password").await?;
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod monitor;
pub mod relay;
pub mod retry;
pub mod shamir;
pub mod switch;
pub mod timelock;

pub use error::{Error, Result};

pub use crypto::AeadCiphertext;
pub use envelope::FragmentEnvelope;
pub use kdf::KeyHierarchy;
pub use monitor::{MonitorConfig, MultiMonitor, TransactionMonitor, TxStatus};
pub use relay::{
    FragmentEvent, HttpRelayTransport, MemoryRelayTransport, RelayConfig, RelayIdentity,
    RelayPool, RelayTransport,
};
pub use shamir::AuthenticatedShare;
pub use switch::{CreateResult, ReleaseResult, Switch, SwitchClient, SwitchConfig, SwitchStatus};
pub use timelock::{ChainView, TimelockCommitment, WarningLevel};
