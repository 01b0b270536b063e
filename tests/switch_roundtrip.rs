//! end-to-end switch lifecycle over the in-memory relay transport

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use deadswitch::retry::RetryPolicy;
use deadswitch::switch::SwitchStatus;
use deadswitch::{
    ChainView, Error, MemoryRelayTransport, RelayConfig, SwitchClient, SwitchConfig,
};

const PASSWORD: &str = "correct horse battery staple";
const MESSAGE: &[u8] = b"if you are reading this, publish everything in the safe";

fn relay_urls(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("https://relay{i}.example.com"))
        .collect()
}

fn config(relays: usize) -> SwitchConfig {
    SwitchConfig {
        shares: 3,
        threshold: 2,
        check_in_hours: 24,
        relay_urls: relay_urls(relays),
        relay: RelayConfig {
            min_relays: 3,
            retry: RetryPolicy::none(),
            ..RelayConfig::default()
        },
        ..SwitchConfig::default()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn create_check_in_release_roundtrip() {
    let transport = Arc::new(MemoryRelayTransport::new());
    let chain = ChainView {
        tip_height: 800_000,
        now: unix_now(),
    };

    let mut cfg = config(3);
    cfg.timelock = Some(chain.now + 48 * 3600);
    let mut client = SwitchClient::new(transport.clone(), cfg).unwrap();

    let created = client
        .create(PASSWORD, MESSAGE, Some(&chain))
        .await
        .unwrap();
    let mut switch = created.switch;

    assert_eq!(switch.status, SwitchStatus::Armed);
    assert_eq!(created.receipt.acks, 3);
    // one event per share on every relay
    assert_eq!(transport.stored("https://relay0.example.com/"), 3);
    let commitment = switch.commitment.as_ref().unwrap();
    assert!(commitment.address.starts_with("tb1"));

    // deadline extends by one interval
    let old_expiry = switch.expires_at;
    let new_expiry = client.check_in(&mut switch, Some(&chain)).unwrap();
    assert!(new_expiry >= old_expiry);

    // wrong password derives a different author and finds nothing
    let result = client.release(&mut switch.clone(), "wrong password").await;
    assert!(matches!(result, Err(Error::InsufficientShares { .. })));

    let released = client.release(&mut switch, PASSWORD).await.unwrap();
    assert_eq!(released.plaintext, MESSAGE);
    assert!(released.shares_used >= 2);
    assert_eq!(released.shares_discarded, 0);
    assert_eq!(switch.status, SwitchStatus::Triggered);
}

#[tokio::test]
async fn release_survives_corrupt_fragment_and_relay_outage() {
    let transport = Arc::new(MemoryRelayTransport::new());
    let mut client = SwitchClient::new(transport.clone(), config(4)).unwrap();

    let created = client.create(PASSWORD, MESSAGE, None).await.unwrap();
    let mut switch = created.switch;

    // one fragment corrupted on every relay, one relay offline
    let ids = transport.event_ids();
    assert_eq!(ids.len(), 3);
    transport.tamper_content(&ids[0], r#"{"type":"fragment","index":9,"data":""}"#);
    transport.set_down("https://relay3.example.com/", true);

    let released = client.release(&mut switch, PASSWORD).await.unwrap();
    assert_eq!(released.plaintext, MESSAGE);
    assert_eq!(released.shares_used, 2);
}

#[tokio::test]
async fn release_fails_below_threshold() {
    let transport = Arc::new(MemoryRelayTransport::new());
    let mut client = SwitchClient::new(transport.clone(), config(3)).unwrap();

    let created = client.create(PASSWORD, MESSAGE, None).await.unwrap();
    let mut switch = created.switch;

    // two of three fragments destroyed everywhere leaves only one share
    let ids = transport.event_ids();
    transport.tamper_content(&ids[0], "garbage");
    transport.tamper_content(&ids[1], "garbage");

    let result = client.release(&mut switch, PASSWORD).await;
    assert!(matches!(
        result,
        Err(Error::InsufficientShares { required: 2, got: 1 })
    ));
    // the record stays armed; a later retry with intact relays may succeed
    assert_eq!(switch.status, SwitchStatus::Armed);
}
