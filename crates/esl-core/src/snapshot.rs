//! Snapshot poller and statistics engine
//!
//! Independent of the event stream, the engine asks the switch for its full
//! channel list on a fixed interval. The result is compared with the registry
//! and published to snapshot subscribers; it is never merged back. On a
//! second, slower interval a [`StatsSnapshot`] is appended to the history.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::call::{CallDirection, CallRecord, CallStatus, UNKNOWN_PARTY};
use crate::config::SnapshotConfig;
use crate::error::{EslError, EslResult};
use crate::events::EventHub;
use crate::gateway::CommandGateway;
use crate::registry::CallRegistry;
use crate::stats::{StatsHistory, StatsSnapshot};

const SHOW_CHANNELS: &str = "show channels as json";

/// Ids that differ between the polled list and the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub only_in_snapshot: Vec<String>,
    pub only_in_registry: Vec<String>,
}

impl Reconciliation {
    pub fn compare(snapshot_ids: &[String], registry_ids: &[String]) -> Self {
        let polled: HashSet<&String> = snapshot_ids.iter().collect();
        let tracked: HashSet<&String> = registry_ids.iter().collect();

        let mut only_in_snapshot: Vec<String> =
            polled.difference(&tracked).map(|id| id.to_string()).collect();
        let mut only_in_registry: Vec<String> =
            tracked.difference(&polled).map(|id| id.to_string()).collect();
        only_in_snapshot.sort();
        only_in_registry.sort();

        Self {
            only_in_snapshot,
            only_in_registry,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.only_in_snapshot.is_empty() && self.only_in_registry.is_empty()
    }
}

/// Full active-call list as reported by the switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCallsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub calls: Vec<CallRecord>,
    pub reconciliation: Reconciliation,
}

impl ActiveCallsSnapshot {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    #[serde(default)]
    rows: Vec<ChannelRow>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelRow {
    uuid: String,
    direction: String,
    created_epoch: String,
    name: String,
    cid_num: String,
    dest: String,
    callee_num: String,
    callstate: String,
    context: String,
    hostname: String,
    call_uuid: String,
}

impl ChannelRow {
    fn into_record(self, now: DateTime<Utc>) -> CallRecord {
        let start_time = self
            .created_epoch
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(now);
        let direction = self.direction.parse().unwrap_or(CallDirection::Inbound);
        let caller = non_empty(&self.cid_num).unwrap_or(UNKNOWN_PARTY);
        let callee = non_empty(&self.callee_num)
            .or_else(|| non_empty(&self.dest))
            .unwrap_or(UNKNOWN_PARTY);

        let mut record = CallRecord::new(&self.uuid, caller, callee, direction, start_time);
        record.status = CallStatus::from_switch_state(&self.callstate);

        let mut metadata = HashMap::new();
        for (key, value) in [
            ("channel_name", &self.name),
            ("context", &self.context),
            ("hostname", &self.hostname),
            ("call_uuid", &self.call_uuid),
        ] {
            if let Some(value) = non_empty(value) {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
        record.metadata = metadata;
        record
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Turn `show channels as json` output into call records.
///
/// Empty output, or a list without `rows` (the switch omits it when nothing
/// is up), is an empty list. Rows without a uuid are skipped.
pub fn parse_channels(json: &str, now: DateTime<Utc>) -> EslResult<Vec<CallRecord>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let list: ChannelList = serde_json::from_str(json)
        .map_err(|e| EslError::malformed_response(SHOW_CHANNELS, e.to_string()))?;

    let mut calls = Vec::with_capacity(list.rows.len());
    for row in list.rows {
        if row.uuid.trim().is_empty() {
            warn!("Skipping channel row without uuid");
            continue;
        }
        calls.push(row.into_record(now));
    }
    Ok(calls)
}

/// Periodic snapshot poller plus statistics history
pub struct SnapshotEngine {
    gateway: CommandGateway,
    registry: Arc<CallRegistry>,
    hub: EventHub,
    history: Arc<StatsHistory>,
    latest: RwLock<Option<Arc<ActiveCallsSnapshot>>>,
    in_flight: AtomicUsize,
    config: SnapshotConfig,
}

impl std::fmt::Debug for SnapshotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotEngine")
            .field("history", &self.history.len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish()
    }
}

impl SnapshotEngine {
    pub fn new(
        gateway: CommandGateway,
        registry: Arc<CallRegistry>,
        hub: EventHub,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            gateway,
            registry,
            hub,
            history: Arc::new(StatsHistory::new(config.history_capacity)),
            latest: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            config,
        }
    }

    pub fn history(&self) -> Arc<StatsHistory> {
        Arc::clone(&self.history)
    }

    pub fn latest_snapshot(&self) -> Option<Arc<ActiveCallsSnapshot>> {
        self.latest.read().clone()
    }

    /// Poll the switch once, reconcile, store and publish the snapshot
    pub async fn poll_once(&self) -> EslResult<Arc<ActiveCallsSnapshot>> {
        let output = self.gateway.show_channels().await?;
        let now = Utc::now();
        let calls = parse_channels(&output, now)?;

        let polled_ids: Vec<String> = calls.iter().map(|c| c.call_id.clone()).collect();
        let reconciliation = Reconciliation::compare(&polled_ids, &self.registry.call_ids());
        if !reconciliation.is_consistent() {
            info!(
                only_in_snapshot = ?reconciliation.only_in_snapshot,
                only_in_registry = ?reconciliation.only_in_registry,
                "Registry drift detected"
            );
        }

        let snapshot = Arc::new(ActiveCallsSnapshot {
            captured_at: now,
            calls,
            reconciliation,
        });
        *self.latest.write() = Some(Arc::clone(&snapshot));
        let receivers = self.hub.publish_snapshot(Arc::clone(&snapshot));
        debug!(calls = snapshot.len(), receivers, "Published active-call snapshot");
        Ok(snapshot)
    }

    /// Statistics over the freshest view: a recent snapshot, else the registry
    pub fn current_stats(&self) -> StatsSnapshot {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.poll_interval() * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));

        match self.latest_snapshot() {
            Some(snapshot) if now - snapshot.captured_at <= max_age => {
                StatsSnapshot::compute(&snapshot.calls, now)
            }
            _ => StatsSnapshot::compute(&self.registry.list(), now),
        }
    }

    /// Compute statistics and append them to the history
    pub fn record_stats(&self) -> StatsSnapshot {
        let stats = self.current_stats();
        self.history.push(stats.clone());
        stats
    }

    /// Whether a new poll should start now
    fn should_poll(&self) -> bool {
        !(self.in_flight.load(Ordering::SeqCst) > 0 && self.hub.snapshot_subscribers() == 0)
    }

    fn spawn_poll(self: &Arc<Self>) {
        if !self.should_poll() {
            debug!("Previous poll still outstanding and nobody listening, skipping cycle");
            return;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.poll_once().await {
                Ok(_) => {}
                Err(EslError::NotConnected) => debug!("Skipping snapshot poll while disconnected"),
                Err(e) => warn!(error = %e, "Snapshot poll failed"),
            }
            this.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Drive both intervals until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut poll_tick = tokio::time::interval(self.config.poll_interval());
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_tick = tokio::time::interval(self.config.stats_interval());
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_ms = self.config.poll_interval_ms,
            stats_ms = self.config.stats_interval_ms,
            "Starting snapshot engine"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll_tick.tick() => self.spawn_poll(),
                _ = stats_tick.tick() => {
                    let stats = self.record_stats();
                    debug!(total = stats.total, answer_rate = stats.answer_rate, "Recorded stats");
                }
            }
        }
        info!("Snapshot engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absent_rows_is_empty() {
        let calls = parse_channels(r#"{"row_count":0}"#, Utc::now()).unwrap();
        assert!(calls.is_empty());
        let stats = StatsSnapshot::compute(&calls, Utc::now());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.answer_rate, 0);
    }

    #[test]
    fn test_parse_empty_output_is_empty() {
        assert!(parse_channels("", Utc::now()).unwrap().is_empty());
        assert!(parse_channels("  \n", Utc::now()).unwrap().is_empty());
        assert!(parse_channels("not json", Utc::now()).is_err());
    }

    #[test]
    fn test_parse_rows() {
        let json = r#"{
            "row_count": 2,
            "rows": [
                {"uuid":"A123","direction":"inbound","created_epoch":"1700000000",
                 "name":"sofia/internal/1000@pbx","cid_num":"1000","dest":"2000",
                 "callee_num":"","callstate":"ACTIVE","context":"default"},
                {"uuid":"B456","direction":"outbound","created_epoch":"",
                 "cid_num":"","dest":"","callee_num":"3000","callstate":"RINGING"}
            ]
        }"#;
        let now = Utc::now();
        let calls = parse_channels(json, now).unwrap();
        assert_eq!(calls.len(), 2);

        assert_eq!(calls[0].call_id, "A123");
        assert_eq!(calls[0].callee_number, "2000");
        assert_eq!(calls[0].status, CallStatus::Answered);
        assert_eq!(calls[0].start_time.timestamp(), 1_700_000_000);
        assert_eq!(calls[0].metadata.get("context").map(String::as_str), Some("default"));

        assert_eq!(calls[1].direction, CallDirection::Outbound);
        assert_eq!(calls[1].caller_number, UNKNOWN_PARTY);
        assert_eq!(calls[1].callee_number, "3000");
        assert_eq!(calls[1].status, CallStatus::Ringing);
        assert_eq!(calls[1].start_time, now);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_channels("-ERR no reply", Utc::now()),
            Err(EslError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_reconciliation() {
        let polled = vec!["a".to_string(), "b".to_string()];
        let tracked = vec!["b".to_string(), "c".to_string()];
        let report = Reconciliation::compare(&polled, &tracked);
        assert_eq!(report.only_in_snapshot, vec!["a"]);
        assert_eq!(report.only_in_registry, vec!["c"]);
        assert!(!report.is_consistent());
        assert!(Reconciliation::compare(&polled, &polled).is_consistent());
    }
}
