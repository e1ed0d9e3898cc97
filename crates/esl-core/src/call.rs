//! Call records tracked by the live registry
//!
//! A [`CallRecord`] describes one call leg as the switch reports it. The
//! record never stores its duration: [`CallRecord::duration_secs`] derives it
//! from `start_time` whenever it is read, so a record can never carry a stale
//! value.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for parties the switch did not report
pub const UNKNOWN_PARTY: &str = "unknown";

/// Direction of a call leg as seen by the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl FromStr for CallDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Ok(CallDirection::Inbound),
            "outbound" => Ok(CallDirection::Outbound),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Inbound => f.write_str("inbound"),
            CallDirection::Outbound => f.write_str("outbound"),
        }
    }
}

/// Lifecycle status of a call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Hold,
    Hangup,
}

impl CallStatus {
    /// Map a switch call-state string (`show channels` `callstate` column)
    pub fn from_switch_state(state: &str) -> Self {
        match state.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" | "BRIDGED" | "ANSWERED" => CallStatus::Answered,
            "HELD" | "HOLD" => CallStatus::Hold,
            "HANGUP" => CallStatus::Hangup,
            _ => CallStatus::Ringing,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Hold => "hold",
            CallStatus::Hangup => "hangup",
        };
        f.write_str(s)
    }
}

/// One call leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Switch call identifier, unique while the call is active
    pub call_id: String,
    pub caller_number: String,
    pub callee_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub recording: bool,
    /// Flagged as the authoritative leg for billing
    pub billing_leg: bool,
    /// Extra header values (domain, user agent, SIP call id, ...)
    pub metadata: HashMap<String, String>,
}

impl CallRecord {
    /// New ringing record started at `start_time`
    pub fn new(
        call_id: impl Into<String>,
        caller_number: impl Into<String>,
        callee_number: impl Into<String>,
        direction: CallDirection,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_number: caller_number.into(),
            callee_number: callee_number.into(),
            direction,
            status: CallStatus::Ringing,
            start_time,
            answer_time: None,
            recording: false,
            billing_leg: false,
            metadata: HashMap::new(),
        }
    }

    /// Whole seconds between `start_time` and `now`, never negative
    pub fn duration_secs_at(&self, now: DateTime<Utc>) -> u64 {
        (now - self.start_time).num_seconds().max(0) as u64
    }

    /// Whole seconds since `start_time`
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs_at(Utc::now())
    }

    pub fn is_answered(&self) -> bool {
        self.answer_time.is_some()
    }

    /// Serializable view with the duration resolved at `now`
    pub fn view_at(&self, now: DateTime<Utc>) -> CallView {
        CallView {
            record: self.clone(),
            duration_secs: self.duration_secs_at(now),
        }
    }
}

/// A record plus its duration at the moment the view was taken; this is the
/// shape handed to broadcast consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallView {
    #[serde(flatten)]
    pub record: CallRecord,
    pub duration_secs: u64,
}
