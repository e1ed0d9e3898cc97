//! Aggregate call statistics and their bounded history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::call::{CallDirection, CallRecord, CallStatus};

/// Immutable aggregate over a set of calls at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub answered: usize,
    pub ringing: usize,
    pub held: usize,
    /// Over calls with a positive duration only
    pub average_duration_secs: f64,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    /// Calls that were answered (including held ones) over `total`, as a
    /// rounded percentage; 0 without calls
    pub answer_rate: u8,
}

impl StatsSnapshot {
    /// All-zero statistics
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            total: 0,
            inbound: 0,
            outbound: 0,
            answered: 0,
            ringing: 0,
            held: 0,
            average_duration_secs: 0.0,
            min_duration_secs: 0,
            max_duration_secs: 0,
            answer_rate: 0,
        }
    }

    pub fn compute(calls: &[CallRecord], now: DateTime<Utc>) -> Self {
        let mut stats = Self::empty(now);
        stats.total = calls.len();

        let mut durations = Vec::with_capacity(calls.len());
        let mut connected = 0usize;
        for call in calls {
            match call.direction {
                CallDirection::Inbound => stats.inbound += 1,
                CallDirection::Outbound => stats.outbound += 1,
            }
            match call.status {
                CallStatus::Answered => stats.answered += 1,
                CallStatus::Ringing => stats.ringing += 1,
                CallStatus::Hold => stats.held += 1,
                CallStatus::Hangup => {}
            }
            if matches!(call.status, CallStatus::Answered | CallStatus::Hold) || call.is_answered() {
                connected += 1;
            }
            let duration = call.duration_secs_at(now);
            if duration > 0 {
                durations.push(duration);
            }
        }

        if !durations.is_empty() {
            let sum: u64 = durations.iter().sum();
            stats.average_duration_secs = sum as f64 / durations.len() as f64;
            stats.min_duration_secs = durations.iter().copied().min().unwrap_or(0);
            stats.max_duration_secs = durations.iter().copied().max().unwrap_or(0);
        }

        if stats.total > 0 {
            let rate = (connected as f64 / stats.total as f64 * 100.0).round();
            stats.answer_rate = rate.clamp(0.0, 100.0) as u8;
        }
        stats
    }
}

/// Fixed-capacity history, oldest snapshot evicted first
#[derive(Debug)]
pub struct StatsHistory {
    capacity: usize,
    entries: Mutex<VecDeque<StatsSnapshot>>,
}

impl StatsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, snapshot: StatsSnapshot) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        self.entries.lock().back().cloned()
    }

    /// Oldest first
    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn since(&self, from: DateTime<Utc>) -> Vec<StatsSnapshot> {
        self.entries
            .lock()
            .iter()
            .filter(|s| s.timestamp >= from)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
