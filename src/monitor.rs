//! transaction confirmation monitor
//!
//! an explicit finite-state machine with a pure transition function,
//! driven by a tokio polling task. callers get snapshots over a `watch`
//! channel and transition events over an `mpsc` channel instead of
//! registering ambient listeners.
//!
//! ```text
//! PENDING ──► CONFIRMING ──► CONFIRMED (terminal)
//!    │             │
//!    ├─────────────┴──► DROPPED (terminal, not-found persisted)
//!    │
//!    ▼ fetch failure                 any non-terminal
//!  ERROR ──► PENDING (recovered)   ──────► TIMEOUT (terminal)
//! ```

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// transaction monitoring status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Confirming,
    Confirmed,
    Dropped,
    Timeout,
    Error,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Dropped | TxStatus::Timeout)
    }
}

/// one poll's view of a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// transaction is known to the network
    Found { confirmations: u32 },
    /// transaction is not known to the network
    NotFound,
    /// the status source itself failed
    FetchFailed(String),
}

/// monitor tuning knobs
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// confirmations required before CONFIRMED
    pub confirmation_target: u32,
    /// consecutive not-found polls before DROPPED
    pub dropped_threshold: u32,
    /// hard ceiling on the monitoring window
    pub max_monitor_time: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            confirmation_target: 6,
            dropped_threshold: 10,
            max_monitor_time: Duration::from_secs(24 * 3600),
        }
    }
}

/// a recorded status transition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: TxStatus,
    pub to: TxStatus,
    pub at_ms: u64,
    pub reason: String,
}

/// full monitor state snapshot
#[derive(Clone, Debug)]
pub struct MonitorState {
    pub txid: String,
    pub status: TxStatus,
    pub confirmations: u32,
    pub not_found_streak: u32,
    pub started_at_ms: u64,
    /// append-only transition log
    pub history: Vec<StatusChange>,
}

/// pure transition decision
///
/// `not_found_streak` already includes the current observation. returns
/// the next status and a reason, or `None` when the state holds.
pub fn step(
    status: TxStatus,
    obs: &Observation,
    not_found_streak: u32,
    elapsed: Duration,
    config: &MonitorConfig,
) -> Option<(TxStatus, String)> {
    if status.is_terminal() {
        return None;
    }
    if elapsed >= config.max_monitor_time {
        return Some((TxStatus::Timeout, "monitoring window elapsed".into()));
    }

    match obs {
        Observation::FetchFailed(reason) => {
            if status == TxStatus::Error {
                None
            } else {
                Some((TxStatus::Error, format!("status fetch failed: {reason}")))
            }
        }
        Observation::Found { confirmations } => {
            if status == TxStatus::Error {
                return Some((TxStatus::Pending, "status source recovered".into()));
            }
            if *confirmations >= config.confirmation_target {
                Some((
                    TxStatus::Confirmed,
                    format!("{confirmations} confirmations reached"),
                ))
            } else if status == TxStatus::Pending && *confirmations > 0 {
                // a 0-conf mempool sighting is still PENDING
                Some((
                    TxStatus::Confirming,
                    format!("seen with {confirmations} confirmations"),
                ))
            } else {
                None
            }
        }
        Observation::NotFound => {
            if status == TxStatus::Error {
                return Some((TxStatus::Pending, "status source recovered".into()));
            }
            if not_found_streak >= config.dropped_threshold {
                Some((
                    TxStatus::Dropped,
                    format!("not found for {not_found_streak} consecutive polls"),
                ))
            } else {
                None
            }
        }
    }
}

impl MonitorState {
    pub fn new(txid: &str, now_ms: u64) -> Self {
        Self {
            txid: txid.to_string(),
            status: TxStatus::Pending,
            confirmations: 0,
            not_found_streak: 0,
            started_at_ms: now_ms,
            history: Vec::new(),
        }
    }

    /// apply one observation; returns the transition target if any
    pub fn observe(
        &mut self,
        obs: Observation,
        now_ms: u64,
        config: &MonitorConfig,
    ) -> Option<TxStatus> {
        match &obs {
            Observation::Found { confirmations } => {
                self.confirmations = *confirmations;
                self.not_found_streak = 0;
            }
            Observation::NotFound => self.not_found_streak += 1,
            Observation::FetchFailed(_) => {}
        }

        let elapsed = Duration::from_millis(now_ms.saturating_sub(self.started_at_ms));
        let (to, reason) = step(self.status, &obs, self.not_found_streak, elapsed, config)?;

        self.history.push(StatusChange {
            from: self.status,
            to,
            at_ms: now_ms,
            reason,
        });
        self.status = to;
        Some(to)
    }
}

/// source of transaction status observations
#[async_trait]
pub trait TxStatusSource: Send + Sync + 'static {
    async fn fetch(&self, txid: &str) -> Result<Observation>;
}

/// esplora-compatible http status source
#[derive(Clone)]
pub struct EsploraStatusSource {
    base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u32>,
}

impl EsploraStatusSource {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn tip_height(&self) -> Result<u32> {
        let resp = self
            .client
            .get(format!("{}/blocks/tip/height", self.base))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let text = resp.text().await.map_err(|e| Error::Network(e.to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| Error::Network("bad tip height response".into()))
    }
}

#[async_trait]
impl TxStatusSource for EsploraStatusSource {
    async fn fetch(&self, txid: &str) -> Result<Observation> {
        let resp = self
            .client
            .get(format!("{}/tx/{}/status", self.base, txid))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Observation::NotFound);
        }
        if !resp.status().is_success() {
            return Err(Error::Network(format!("status query returned {}", resp.status())));
        }

        let status: EsploraTxStatus =
            resp.json().await.map_err(|e| Error::Network(e.to_string()))?;
        if !status.confirmed {
            return Ok(Observation::Found { confirmations: 0 });
        }
        let height = status
            .block_height
            .ok_or_else(|| Error::Network("confirmed tx without height".into()))?;
        let tip = self.tip_height().await?;
        Ok(Observation::Found {
            confirmations: tip.saturating_sub(height) + 1,
        })
    }
}

/// a transition event forwarded to aggregators
#[derive(Clone, Debug)]
pub struct MonitorEvent {
    pub txid: String,
    pub status: TxStatus,
    pub at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// a polling monitor for one transaction
pub struct TransactionMonitor {
    txid: String,
    state_rx: watch::Receiver<MonitorState>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TransactionMonitor {
    /// start polling `source` for `txid`
    pub fn spawn<S: TxStatusSource>(
        txid: &str,
        source: S,
        config: MonitorConfig,
        events: Option<mpsc::UnboundedSender<MonitorEvent>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(MonitorState::new(txid, now_ms()));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task_txid = txid.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!(txid = %task_txid, "monitor stopped");
                            break;
                        }
                        continue;
                    }
                }

                let obs = match source.fetch(&task_txid).await {
                    Ok(obs) => obs,
                    Err(e) => Observation::FetchFailed(e.to_string()),
                };

                let mut state = state_tx.borrow().clone();
                let transition = state.observe(obs, now_ms(), &config);
                let terminal = state.status.is_terminal();

                if let Some(to) = transition {
                    info!(txid = %task_txid, status = ?to, "transaction status changed");
                    if let Some(tx) = &events {
                        let _ = tx.send(MonitorEvent {
                            txid: task_txid.clone(),
                            status: to,
                            at_ms: now_ms(),
                        });
                    }
                }
                if state_tx.send(state).is_err() {
                    break; // nobody is watching anymore
                }
                if terminal {
                    break;
                }
            }
        });

        Self {
            txid: txid.to_string(),
            state_rx,
            stop_tx,
            handle,
        }
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    /// latest state snapshot
    pub fn state(&self) -> MonitorState {
        self.state_rx.borrow().clone()
    }

    /// whether the poll loop is still live
    pub fn is_monitoring(&self) -> bool {
        !self.state_rx.borrow().status.is_terminal() && !*self.stop_tx.borrow()
    }

    /// stop polling and freeze state; no transitions occur afterwards
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// resolve on CONFIRMED; error on DROPPED, TIMEOUT, or cancellation
    pub async fn wait_for_confirmation(&self) -> Result<MonitorState> {
        let mut rx = self.state_rx.clone();
        loop {
            let state = rx.borrow().clone();
            match state.status {
                TxStatus::Confirmed => return Ok(state),
                TxStatus::Dropped => {
                    return Err(Error::TxDropped {
                        txid: self.txid.clone(),
                    })
                }
                TxStatus::Timeout => {
                    return Err(Error::MonitorTimeout {
                        txid: self.txid.clone(),
                    })
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::MonitorStopped);
            }
        }
    }
}

impl Drop for TransactionMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// tracks many transactions concurrently, deduplicating by txid and
/// aggregating transition events onto one channel
pub struct MultiMonitor<S: TxStatusSource + Clone> {
    source: S,
    config: MonitorConfig,
    monitors: HashMap<String, TransactionMonitor>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl<S: TxStatusSource + Clone> MultiMonitor<S> {
    pub fn new(source: S, config: MonitorConfig) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                source,
                config,
                monitors: HashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// start tracking a transaction; tracking an already-tracked txid
    /// is a no-op
    pub fn track(&mut self, txid: &str) {
        if self.monitors.contains_key(txid) {
            warn!(txid, "already tracking transaction");
            return;
        }
        let monitor = TransactionMonitor::spawn(
            txid,
            self.source.clone(),
            self.config.clone(),
            Some(self.events_tx.clone()),
        );
        self.monitors.insert(txid.to_string(), monitor);
    }

    pub fn is_tracking(&self, txid: &str) -> bool {
        self.monitors.contains_key(txid)
    }

    /// snapshot of every tracked transaction
    pub fn statuses(&self) -> HashMap<String, MonitorState> {
        self.monitors
            .iter()
            .map(|(txid, m)| (txid.clone(), m.state()))
            .collect()
    }

    /// stop every monitor
    pub fn stop_all(&self) {
        for monitor in self.monitors.values() {
            monitor.stop();
        }
    }

    pub fn monitor(&self, txid: &str) -> Option<&TransactionMonitor> {
        self.monitors.get(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// replays a fixed script of observations, then repeats the last
    #[derive(Clone)]
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Observation>>>,
        last: Arc<Mutex<Observation>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Observation>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                last: Arc::new(Mutex::new(Observation::NotFound)),
            }
        }
    }

    #[async_trait]
    impl TxStatusSource for ScriptedSource {
        async fn fetch(&self, _txid: &str) -> Result<Observation> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(obs) => {
                    *self.last.lock().unwrap() = obs.clone();
                    Ok(obs)
                }
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            confirmation_target: 1,
            dropped_threshold: 3,
            max_monitor_time: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_step_pending_to_confirming_to_confirmed() {
        let config = MonitorConfig {
            confirmation_target: 2,
            ..fast_config()
        };
        let elapsed = Duration::from_secs(1);

        // an unconfirmed mempool sighting does not leave PENDING
        let next = step(
            TxStatus::Pending,
            &Observation::Found { confirmations: 0 },
            0,
            elapsed,
            &config,
        );
        assert!(next.is_none());

        let next = step(
            TxStatus::Pending,
            &Observation::Found { confirmations: 1 },
            0,
            elapsed,
            &config,
        );
        assert_eq!(next.unwrap().0, TxStatus::Confirming);

        let next = step(
            TxStatus::Confirming,
            &Observation::Found { confirmations: 1 },
            0,
            elapsed,
            &config,
        );
        assert!(next.is_none());

        let next = step(
            TxStatus::Confirming,
            &Observation::Found { confirmations: 2 },
            0,
            elapsed,
            &config,
        );
        assert_eq!(next.unwrap().0, TxStatus::Confirmed);
    }

    #[test]
    fn test_step_dropped_after_persistent_not_found() {
        let config = fast_config();
        let elapsed = Duration::from_secs(1);

        assert!(step(TxStatus::Pending, &Observation::NotFound, 2, elapsed, &config).is_none());
        let next = step(TxStatus::Pending, &Observation::NotFound, 3, elapsed, &config);
        assert_eq!(next.unwrap().0, TxStatus::Dropped);
    }

    #[test]
    fn test_step_error_recovery() {
        let config = fast_config();
        let elapsed = Duration::from_secs(1);

        let next = step(
            TxStatus::Confirming,
            &Observation::FetchFailed("boom".into()),
            0,
            elapsed,
            &config,
        );
        assert_eq!(next.unwrap().0, TxStatus::Error);

        let next = step(
            TxStatus::Error,
            &Observation::Found { confirmations: 0 },
            0,
            elapsed,
            &config,
        );
        assert_eq!(next.unwrap().0, TxStatus::Pending);
    }

    #[test]
    fn test_step_timeout_beats_everything_nonterminal() {
        let config = fast_config();
        let next = step(
            TxStatus::Confirming,
            &Observation::Found { confirmations: 0 },
            0,
            Duration::from_secs(61),
            &config,
        );
        assert_eq!(next.unwrap().0, TxStatus::Timeout);

        // terminal states never move
        assert!(step(
            TxStatus::Confirmed,
            &Observation::NotFound,
            99,
            Duration::from_secs(999),
            &config
        )
        .is_none());
    }

    #[test]
    fn test_history_is_append_only() {
        let config = MonitorConfig {
            confirmation_target: 2,
            ..fast_config()
        };
        let mut state = MonitorState::new("tx1", 0);

        state.observe(Observation::Found { confirmations: 1 }, 10, &config);
        state.observe(Observation::Found { confirmations: 2 }, 20, &config);

        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].from, TxStatus::Pending);
        assert_eq!(state.history[0].to, TxStatus::Confirming);
        assert_eq!(state.history[1].to, TxStatus::Confirmed);
        assert_eq!(state.history[1].at_ms, 20);
    }

    #[tokio::test]
    async fn test_monitor_confirms_and_emits_once() {
        let source = ScriptedSource::new(vec![
            Observation::Found { confirmations: 0 },
            Observation::Found { confirmations: 0 },
            Observation::Found { confirmations: 1 },
        ]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let monitor = TransactionMonitor::spawn("txabc", source, fast_config(), Some(events_tx));

        let state = monitor.wait_for_confirmation().await.unwrap();
        assert_eq!(state.status, TxStatus::Confirmed);
        assert_eq!(state.confirmations, 1);
        assert!(!monitor.is_monitoring());

        let mut confirmed = 0;
        while let Ok(event) = events_rx.try_recv() {
            if event.status == TxStatus::Confirmed {
                confirmed += 1;
            }
        }
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn test_monitor_dropped() {
        let source = ScriptedSource::new(vec![Observation::NotFound]);
        let monitor = TransactionMonitor::spawn("txgone", source, fast_config(), None);

        let result = monitor.wait_for_confirmation().await;
        assert!(matches!(result, Err(Error::TxDropped { .. })));
        assert_eq!(monitor.state().status, TxStatus::Dropped);
    }

    #[tokio::test]
    async fn test_monitor_recovers_from_fetch_failures() {
        let source = ScriptedSource::new(vec![
            Observation::FetchFailed("relay down".into()),
            Observation::Found { confirmations: 0 },
            Observation::Found { confirmations: 1 },
        ]);
        let monitor = TransactionMonitor::spawn("txerr", source, fast_config(), None);

        let state = monitor.wait_for_confirmation().await.unwrap();
        let statuses: Vec<TxStatus> = state.history.iter().map(|c| c.to).collect();
        assert!(statuses.contains(&TxStatus::Error));
        assert!(statuses.contains(&TxStatus::Pending));
        assert_eq!(*statuses.last().unwrap(), TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_stop_freezes_state() {
        let source = ScriptedSource::new(vec![Observation::Found { confirmations: 0 }]);
        let config = MonitorConfig {
            confirmation_target: 5,
            ..fast_config()
        };
        let monitor = TransactionMonitor::spawn("txstop", source, config, None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.stop();
        assert!(!monitor.is_monitoring());

        let frozen = monitor.state();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after = monitor.state();
        assert_eq!(frozen.history.len(), after.history.len());
    }

    #[tokio::test]
    async fn test_multi_monitor_dedupes_and_aggregates() {
        let source = ScriptedSource::new(vec![Observation::Found { confirmations: 1 }]);
        let (mut multi, mut events_rx) = MultiMonitor::new(source, fast_config());

        multi.track("tx1");
        multi.track("tx1"); // duplicate ignored
        multi.track("tx2");
        assert!(multi.is_tracking("tx1"));
        assert_eq!(multi.statuses().len(), 2);

        // both confirm off the shared script's repeated last observation
        multi.monitor("tx1").unwrap().wait_for_confirmation().await.unwrap();
        multi.monitor("tx2").unwrap().wait_for_confirmation().await.unwrap();

        let mut seen = std::collections::HashSet::new();
        while let Ok(event) = events_rx.try_recv() {
            if event.status == TxStatus::Confirmed {
                seen.insert(event.txid);
            }
        }
        assert!(seen.contains("tx1"));
        assert!(seen.contains("tx2"));

        multi.stop_all();
    }
}
