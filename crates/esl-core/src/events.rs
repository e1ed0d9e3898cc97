//! Broadcast surface for real-time consumers
//!
//! Three typed channels fan out to any number of subscribers:
//!
//! - [`CallEvent`]s produced by the dispatcher from registry transitions
//! - every raw switch event, after its handler ran
//! - periodic [`ActiveCallsSnapshot`]s from the snapshot poller
//!
//! Publishing never blocks. A subscriber that falls behind loses the oldest
//! messages (`RecvError::Lagged`), it never slows the dispatcher down.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::call::{CallDirection, CallRecord, CallStatus};
use crate::protocol::EslEvent;
use crate::snapshot::ActiveCallsSnapshot;

/// What happened to a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEventKind {
    Created,
    Answered,
    Held,
    Resumed,
    HungUp {
        duration_secs: u64,
        cause: Option<String>,
    },
    Dtmf {
        digit: String,
        duration_ms: Option<u64>,
    },
    RecordingStarted {
        path: String,
    },
    RecordingStopped,
}

/// Call lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    #[serde(flatten)]
    pub kind: CallEventKind,
    pub call_id: String,
    pub caller_number: String,
    pub callee_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl CallEvent {
    /// Build an event from the record state right after the transition
    pub fn from_record(kind: CallEventKind, record: &CallRecord, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            call_id: record.call_id.clone(),
            caller_number: record.caller_number.clone(),
            callee_number: record.callee_number.clone(),
            direction: record.direction,
            status: record.status,
            timestamp,
            metadata: record.metadata.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, CallEventKind::HungUp { .. })
    }
}

/// Fan-out hub for every broadcast channel
#[derive(Debug, Clone)]
pub struct EventHub {
    calls: broadcast::Sender<CallEvent>,
    raw: broadcast::Sender<Arc<EslEvent>>,
    snapshots: broadcast::Sender<Arc<ActiveCallsSnapshot>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (calls, _) = broadcast::channel(capacity);
        let (raw, _) = broadcast::channel(capacity);
        let (snapshots, _) = broadcast::channel(capacity.min(64));
        Self { calls, raw, snapshots }
    }

    /// Returns the number of subscribers that received the event
    pub fn publish_call(&self, event: CallEvent) -> usize {
        match self.calls.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No call event subscribers");
                0
            }
        }
    }

    pub fn publish_raw(&self, event: Arc<EslEvent>) -> usize {
        self.raw.send(event).unwrap_or(0)
    }

    pub fn publish_snapshot(&self, snapshot: Arc<ActiveCallsSnapshot>) -> usize {
        self.snapshots.send(snapshot).unwrap_or(0)
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<EslEvent>> {
        self.raw.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<Arc<ActiveCallsSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot_subscribers(&self) -> usize {
        self.snapshots.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1000)
    }
}
