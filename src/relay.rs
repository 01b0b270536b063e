//! distributed relay client
//!
//! fragments live on independently operated relays the system does not
//! trust. the pool validates relay urls (SSRF defense), health-checks
//! every endpoint before use, fans publishes out in parallel and accepts
//! a quorum of acks, and merges retrievals across whatever subset of
//! relays answers.
//!
//! events are authored by an ephemeral per-switch ed25519 identity so a
//! recipient can find all fragments of one switch by author key alone.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::envelope::FragmentEnvelope;
use crate::retry::{retry, RetryPolicy};
use crate::{Error, Result};

/// recommended minimum relay pool size
pub const MIN_RELAY_COUNT: usize = 7;

/// event kind used for fragment storage
pub const FRAGMENT_EVENT_KIND: u32 = 30078;

/// relay pool configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// pool sizes below this log a warning
    pub min_relays: usize,
    /// publish ack quorum; defaults to a majority of healthy relays
    pub publish_quorum: Option<usize>,
    /// relays failing this many consecutive health checks are filtered
    pub max_consecutive_failures: u32,
    /// per-request timeout
    pub request_timeout: Duration,
    /// retry policy for individual relay requests
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_relays: MIN_RELAY_COUNT,
            publish_quorum: None,
            max_consecutive_failures: 3,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// validate a relay url for scheme and SSRF safety
///
/// only secure transports are accepted; loopback, private-range, and
/// internal-suffix hosts are rejected so a hostile allowlist entry
/// cannot point the client at infrastructure behind it.
pub fn validate_relay_url(raw: &str) -> Result<Url> {
    let invalid = |reason: &str| Error::InvalidRelayUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|_| invalid("unparseable"))?;

    match url.scheme() {
        "https" | "wss" => {}
        _ => return Err(invalid("insecure scheme")),
    }

    match url.host() {
        None => return Err(invalid("missing host")),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain.ends_with(".internal")
            {
                return Err(invalid("internal hostname"));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
            {
                return Err(invalid("non-public ipv4 address"));
            }
        }
        Some(Host::Ipv6(ip)) => {
            let segments = ip.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            if ip.is_loopback() || ip.is_unspecified() || unique_local || link_local {
                return Err(invalid("non-public ipv6 address"));
            }
        }
    }

    Ok(url)
}

/// ephemeral per-switch relay identity
pub struct RelayIdentity {
    signing: SigningKey,
}

impl RelayIdentity {
    /// deterministic identity from a 32-byte seed (the hierarchy's
    /// nostr key), so one switch always authors under the same key
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// hex-encoded public author key
    pub fn public_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }
}

/// a signed relay event carrying one fragment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentEvent {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub kind: u32,
    pub content: String,
    pub sig: String,
}

fn event_digest(author: &str, created_at: u64, kind: u32, content: &str) -> [u8; 32] {
    let canonical = json!([0, author, created_at, kind, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FragmentEvent {
    /// build and sign a fragment event wrapping a sealed envelope
    pub fn fragment(
        identity: &RelayIdentity,
        index: u8,
        envelope: &FragmentEnvelope,
    ) -> Self {
        let data = base64::engine::general_purpose::STANDARD.encode(envelope.to_json());
        let content = json!({
            "type": "fragment",
            "index": index,
            "data": data,
        })
        .to_string();

        let author = identity.public_hex();
        let created_at = unix_now();
        let digest = event_digest(&author, created_at, FRAGMENT_EVENT_KIND, &content);
        let sig = identity.signing.sign(&digest);

        Self {
            id: hex::encode(digest),
            author,
            created_at,
            kind: FRAGMENT_EVENT_KIND,
            content,
            sig: hex::encode(sig.to_bytes()),
        }
    }

    /// verify the event id and signature
    pub fn verify(&self) -> Result<()> {
        let digest = event_digest(&self.author, self.created_at, self.kind, &self.content);
        if hex::encode(digest) != self.id {
            return Err(Error::InvalidEvent("id does not match content".into()));
        }

        let author_bytes: [u8; 32] = hex::decode(&self.author)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidEvent("bad author key".into()))?;
        let verifying = VerifyingKey::from_bytes(&author_bytes)
            .map_err(|_| Error::InvalidEvent("bad author key".into()))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.sig)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::InvalidEvent("bad signature encoding".into()))?;
        verifying
            .verify(&digest, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| Error::InvalidEvent("signature verification failed".into()))
    }

    /// extract the fragment index and envelope from the content
    pub fn fragment_payload(&self) -> Result<(u8, FragmentEnvelope)> {
        let value: Value = serde_json::from_str(&self.content)
            .map_err(|e| Error::InvalidEvent(format!("content is not json: {e}")))?;

        if value.get("type").and_then(Value::as_str) != Some("fragment") {
            return Err(Error::InvalidEvent("not a fragment event".into()));
        }
        let index = value
            .get("index")
            .and_then(Value::as_u64)
            .filter(|&i| i <= u8::MAX as u64)
            .ok_or_else(|| Error::InvalidEvent("missing fragment index".into()))?;
        let data = value
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidEvent("missing fragment data".into()))?;

        let envelope_json = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| Error::InvalidEvent("fragment data is not base64".into()))?;
        let envelope_json = String::from_utf8(envelope_json)
            .map_err(|_| Error::InvalidEvent("fragment data is not utf-8".into()))?;

        Ok((index as u8, FragmentEnvelope::from_json(&envelope_json)?))
    }
}

/// query filter for retrieval
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFilter {
    pub author: String,
    pub kind: u32,
    pub limit: usize,
}

/// transport seam between the pool and the wire
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish_event(&self, relay: &Url, event: &FragmentEvent) -> Result<()>;
    async fn fetch_events(&self, relay: &Url, filter: &EventFilter) -> Result<Vec<FragmentEvent>>;
    async fn ping(&self, relay: &Url) -> Result<Duration>;
}

#[async_trait]
impl<T: RelayTransport> RelayTransport for std::sync::Arc<T> {
    async fn publish_event(&self, relay: &Url, event: &FragmentEvent) -> Result<()> {
        (**self).publish_event(relay, event).await
    }

    async fn fetch_events(&self, relay: &Url, filter: &EventFilter) -> Result<Vec<FragmentEvent>> {
        (**self).fetch_events(relay, filter).await
    }

    async fn ping(&self, relay: &Url) -> Result<Duration> {
        (**self).ping(relay).await
    }
}

/// http/json transport over reqwest
pub struct HttpRelayTransport {
    client: reqwest::Client,
}

impl HttpRelayTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client })
    }

    /// relay base url for http calls; wss urls are queried over https
    fn http_base(relay: &Url) -> String {
        let mut base = relay.to_string();
        if let Some(rest) = base.strip_prefix("wss://") {
            base = format!("https://{rest}");
        }
        base.trim_end_matches('/').to_string()
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn publish_event(&self, relay: &Url, event: &FragmentEvent) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/event", Self::http_base(relay)))
            .json(event)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "relay {} returned {}",
                relay,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn fetch_events(&self, relay: &Url, filter: &EventFilter) -> Result<Vec<FragmentEvent>> {
        let resp = self
            .client
            .get(format!(
                "{}/events?author={}&kind={}&limit={}",
                Self::http_base(relay),
                filter.author,
                filter.kind,
                filter.limit
            ))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "relay {} returned {}",
                relay,
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| Error::Network(e.to_string()))
    }

    async fn ping(&self, relay: &Url) -> Result<Duration> {
        let started = Instant::now();
        self.client
            .get(format!("{}/health", Self::http_base(relay)))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(started.elapsed())
    }
}

/// in-memory transport for tests and offline operation
#[derive(Default)]
pub struct MemoryRelayTransport {
    events: Mutex<HashMap<String, Vec<FragmentEvent>>>,
    down: Mutex<HashSet<String>>,
}

impl MemoryRelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// mark a relay as unreachable
    pub fn set_down(&self, relay: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(relay.to_string());
        } else {
            set.remove(relay);
        }
    }

    /// number of events stored on one relay
    pub fn stored(&self, relay: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .get(relay)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// all distinct event ids across every relay, sorted
    pub fn event_ids(&self) -> Vec<String> {
        let mut ids: HashSet<String> = HashSet::new();
        for events in self.events.lock().unwrap().values() {
            for event in events {
                ids.insert(event.id.clone());
            }
        }
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        ids
    }

    /// corrupt the content of every copy of an event on all relays,
    /// leaving signatures untouched
    pub fn tamper_content(&self, event_id: &str, new_content: &str) {
        for events in self.events.lock().unwrap().values_mut() {
            for event in events.iter_mut() {
                if event.id == event_id {
                    event.content = new_content.to_string();
                }
            }
        }
    }

    fn check_up(&self, relay: &Url) -> Result<()> {
        if self.down.lock().unwrap().contains(relay.as_str()) {
            return Err(Error::Network(format!("{relay} unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelayTransport {
    async fn publish_event(&self, relay: &Url, event: &FragmentEvent) -> Result<()> {
        self.check_up(relay)?;
        let mut store = self.events.lock().unwrap();
        let events = store.entry(relay.to_string()).or_default();
        if !events.iter().any(|e| e.id == event.id) {
            events.push(event.clone());
        }
        Ok(())
    }

    async fn fetch_events(&self, relay: &Url, filter: &EventFilter) -> Result<Vec<FragmentEvent>> {
        self.check_up(relay)?;
        let store = self.events.lock().unwrap();
        Ok(store
            .get(relay.as_str())
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.author == filter.author && e.kind == filter.kind)
                    .take(filter.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ping(&self, relay: &Url) -> Result<Duration> {
        self.check_up(relay)?;
        Ok(Duration::from_millis(1))
    }
}

/// per-relay health record
#[derive(Clone, Debug, Default)]
pub struct RelayHealth {
    pub reachable: bool,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct RelayState {
    url: Url,
    health: RelayHealth,
}

/// aggregate health classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// one relay's line in the redundancy report
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayCheck {
    pub url: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
}

/// redundancy health report across the pool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedundancyReport {
    pub status: HealthStatus,
    pub healthy_relays: usize,
    pub total_relays: usize,
    pub checks: Vec<RelayCheck>,
}

/// receipt for a quorum publish
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub acks: usize,
    pub attempted: usize,
    pub quorum: usize,
}

/// a pool of untrusted relays behind one transport
pub struct RelayPool<T: RelayTransport> {
    relays: Vec<RelayState>,
    transport: T,
    config: RelayConfig,
}

impl<T: RelayTransport> RelayPool<T> {
    /// build a pool from an allowlist of urls
    ///
    /// invalid urls are dropped, not fatal, unless nothing survives.
    pub fn new(urls: &[String], transport: T, config: RelayConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut relays = Vec::new();
        for raw in urls {
            match validate_relay_url(raw) {
                Ok(url) => {
                    if seen.insert(url.to_string()) {
                        relays.push(RelayState {
                            url,
                            health: RelayHealth::default(),
                        });
                    }
                }
                Err(e) => warn!(url = %raw, error = %e, "dropping invalid relay url"),
            }
        }

        if relays.is_empty() {
            return Err(Error::NoUsableRelays);
        }
        if relays.len() < config.min_relays {
            warn!(
                relays = relays.len(),
                min = config.min_relays,
                "relay pool below recommended redundancy"
            );
        }

        Ok(Self {
            relays,
            transport,
            config,
        })
    }

    /// number of configured relays
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// probe every relay concurrently and update health records
    pub async fn check_health(&mut self) {
        let pings = join_all(
            self.relays
                .iter()
                .map(|r| self.transport.ping(&r.url)),
        )
        .await;

        for (relay, result) in self.relays.iter_mut().zip(pings) {
            match result {
                Ok(latency) => {
                    relay.health.reachable = true;
                    relay.health.latency = Some(latency);
                    relay.health.consecutive_failures = 0;
                    debug!(url = %relay.url, ?latency, "relay healthy");
                }
                Err(e) => {
                    relay.health.reachable = false;
                    relay.health.latency = None;
                    relay.health.consecutive_failures += 1;
                    warn!(url = %relay.url, error = %e, "relay health check failed");
                }
            }
        }
    }

    fn healthy(&self) -> Vec<&Url> {
        self.relays
            .iter()
            .filter(|r| {
                r.health.reachable
                    && r.health.consecutive_failures <= self.config.max_consecutive_failures
            })
            .map(|r| &r.url)
            .collect()
    }

    fn quorum_for(&self, healthy: usize) -> usize {
        self.config
            .publish_quorum
            .unwrap_or(healthy / 2 + 1)
            .max(1)
    }

    /// redundancy health report from the latest health probe
    pub fn redundancy_report(&self) -> RedundancyReport {
        let healthy = self.healthy().len();
        let total = self.relays.len();
        let quorum = self.quorum_for(total);

        let status = if healthy < quorum {
            HealthStatus::Critical
        } else if healthy < self.config.min_relays {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        RedundancyReport {
            status,
            healthy_relays: healthy,
            total_relays: total,
            checks: self
                .relays
                .iter()
                .map(|r| RelayCheck {
                    url: r.url.to_string(),
                    reachable: r.health.reachable,
                    latency_ms: r.health.latency.map(|l| l.as_millis() as u64),
                    consecutive_failures: r.health.consecutive_failures,
                })
                .collect(),
        }
    }

    /// fan a set of events out to all healthy relays in parallel
    ///
    /// succeeds once a quorum of relays has acknowledged every event;
    /// individual relay failures are tolerated.
    pub async fn publish(&mut self, events: &[FragmentEvent]) -> Result<PublishReceipt> {
        self.check_health().await;
        let healthy = self.healthy();
        if healthy.is_empty() {
            return Err(Error::NoUsableRelays);
        }
        let quorum = self.quorum_for(healthy.len());

        let transport = &self.transport;
        let retry_policy = &self.config.retry;
        let results = join_all(healthy.iter().map(|url| async move {
            retry(retry_policy, || async move {
                for event in events {
                    transport.publish_event(url, event).await?;
                }
                Ok(())
            })
            .await
        }))
        .await;

        let acks = results.iter().filter(|r| r.is_ok()).count();
        for (url, result) in healthy.iter().zip(&results) {
            if let Err(e) = result {
                warn!(url = %url, error = %e, "relay rejected publish");
            }
        }

        if acks < quorum {
            return Err(Error::QuorumNotReached {
                acks,
                required: quorum,
            });
        }

        info!(acks, attempted = healthy.len(), quorum, "fragments published");
        Ok(PublishReceipt {
            acks,
            attempted: healthy.len(),
            quorum,
        })
    }

    /// query all healthy relays for an author's fragment events,
    /// merging and deduplicating whatever arrives
    pub async fn retrieve(&mut self, author: &str) -> Result<Vec<FragmentEvent>> {
        self.check_health().await;
        let healthy = self.healthy();
        if healthy.is_empty() {
            return Err(Error::NoUsableRelays);
        }

        let filter = EventFilter {
            author: author.to_string(),
            kind: FRAGMENT_EVENT_KIND,
            limit: 512,
        };

        let transport = &self.transport;
        let retry_policy = &self.config.retry;
        let filter = &filter;
        let results = join_all(healthy.iter().map(|url| async move {
            retry(retry_policy, || async move {
                transport.fetch_events(url, filter).await
            })
            .await
        }))
        .await;

        let mut merged: HashMap<String, FragmentEvent> = HashMap::new();
        let mut any_ok = false;
        for (url, result) in healthy.iter().zip(results) {
            match result {
                Ok(events) => {
                    any_ok = true;
                    for event in events {
                        if event.author != author {
                            warn!(url = %url, "relay returned foreign-author event");
                            continue;
                        }
                        if let Err(e) = event.verify() {
                            warn!(url = %url, error = %e, "dropping unverifiable event");
                            continue;
                        }
                        merged.entry(event.id.clone()).or_insert(event);
                    }
                }
                Err(e) => warn!(url = %url, error = %e, "relay query failed"),
            }
        }

        if !any_ok {
            return Err(Error::AllRelaysFailed);
        }

        let mut events: Vec<FragmentEvent> = merged.into_values().collect();
        events.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        debug!(count = events.len(), "merged relay events");
        Ok(events)
    }
}
