//! Active-call registry
//!
//! The registry is the single piece of shared mutable call state. Callers
//! never get a reference into the map: every mutation is one method call that
//! takes the write lock, applies the transition and returns a copy of the
//! resulting record. The lock is a `parking_lot` lock and is never held across
//! an `.await`.
//!
//! ```text
//! (none) --create--> ringing --answer--> answered <--hold/unhold--> hold
//!                       \                    |                       /
//!                        +------------------hangup------------------+
//!                                            |
//!                                        (removed)
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::call::{CallRecord, CallStatus};
use crate::error::{EslError, EslResult};

/// Counters kept alongside the map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    pub total_created: u64,
    pub total_removed: u64,
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<String, CallRecord>,
    counters: RegistryCounters,
}

/// In-memory map call id to call record
#[derive(Debug, Default)]
pub struct CallRegistry {
    inner: RwLock<Inner>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created call. A second create for a live id is rejected.
    pub fn insert(&self, record: CallRecord) -> EslResult<CallRecord> {
        let mut inner = self.inner.write();
        if inner.calls.contains_key(&record.call_id) {
            return Err(EslError::CallAlreadyExists {
                call_id: record.call_id,
            });
        }
        inner.counters.total_created += 1;
        inner.calls.insert(record.call_id.clone(), record.clone());
        debug!(call_id = %record.call_id, "Registered call");
        Ok(record)
    }

    /// ringing -> answered, recording `answer_time` once
    pub fn mark_answered(&self, call_id: &str, at: DateTime<Utc>) -> EslResult<CallRecord> {
        self.update(call_id, |record| {
            if record.answer_time.is_none() {
                record.answer_time = Some(at);
            }
            if record.status == CallStatus::Ringing {
                record.status = CallStatus::Answered;
            }
        })
    }

    /// Put a call on hold, or take it off hold.
    ///
    /// Unhold restores `answered` when the call was answered before,
    /// `ringing` otherwise.
    pub fn set_hold(&self, call_id: &str, held: bool) -> EslResult<CallRecord> {
        self.update(call_id, |record| {
            record.status = if held {
                CallStatus::Hold
            } else if record.is_answered() {
                CallStatus::Answered
            } else {
                CallStatus::Ringing
            };
        })
    }

    pub fn set_recording(&self, call_id: &str, recording: bool) -> EslResult<CallRecord> {
        self.update(call_id, |record| record.recording = recording)
    }

    fn update<F>(&self, call_id: &str, apply: F) -> EslResult<CallRecord>
    where
        F: FnOnce(&mut CallRecord),
    {
        let mut inner = self.inner.write();
        let record = inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| EslError::call_not_found(call_id))?;
        apply(record);
        Ok(record.clone())
    }

    /// Finish a call: compute its final duration, hand the record to `notify`
    /// and only then delete it, all under one write lock.
    ///
    /// `explicit_secs` (the switch-reported duration) wins over
    /// `ended_at - start_time`. Returns the removed record and its duration.
    pub fn remove_with<F>(
        &self,
        call_id: &str,
        explicit_secs: Option<u64>,
        ended_at: DateTime<Utc>,
        notify: F,
    ) -> Option<(CallRecord, u64)>
    where
        F: FnOnce(&CallRecord, u64),
    {
        let mut inner = self.inner.write();
        let Some(record) = inner.calls.get_mut(call_id) else {
            warn!(call_id = %call_id, "Hangup for unknown call");
            return None;
        };

        let duration = explicit_secs.unwrap_or_else(|| record.duration_secs_at(ended_at));
        record.status = CallStatus::Hangup;
        notify(record, duration);

        let record = inner.calls.remove(call_id)?;
        inner.counters.total_removed += 1;
        debug!(call_id = %call_id, duration_secs = duration, "Removed call");
        Some((record, duration))
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.inner.read().calls.get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.inner.read().calls.contains_key(call_id)
    }

    /// All live calls, oldest first
    pub fn list(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self.inner.read().calls.values().cloned().collect();
        calls.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.call_id.cmp(&b.call_id)));
        calls
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.inner.read().calls.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().calls.is_empty()
    }

    pub fn counters(&self) -> RegistryCounters {
        self.inner.read().counters
    }
}
