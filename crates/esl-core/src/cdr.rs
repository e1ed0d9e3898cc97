//! CDR collaborator seam
//!
//! Billing storage lives outside this crate. The dispatcher hands lifecycle
//! payloads to a [`CdrForwarder`], which feeds them in order to a single task
//! calling the [`CdrSink`]. Sink failures are logged there and never reach the
//! registry or the event loop.
//!
//! The queue is bounded. When a stalled sink lets it fill up, further updates
//! are dropped and counted rather than blocking event dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::call::{CallDirection, CallRecord};
use crate::error::EslResult;
use crate::protocol::{names, EslEvent};

/// Fields known when the call is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrCreate {
    pub call_id: String,
    pub caller_number: String,
    pub callee_number: String,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub billing_leg: bool,
    pub metadata: HashMap<String, String>,
}

impl From<&CallRecord> for CdrCreate {
    fn from(record: &CallRecord) -> Self {
        Self {
            call_id: record.call_id.clone(),
            caller_number: record.caller_number.clone(),
            callee_number: record.callee_number.clone(),
            direction: record.direction,
            start_time: record.start_time,
            billing_leg: record.billing_leg,
            metadata: record.metadata.clone(),
        }
    }
}

/// Fields known when the call is answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrAnswer {
    pub answer_time: DateTime<Utc>,
    pub headers: HashMap<String, String>,
}

/// Media quality figures reported on hangup-complete
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaQuality {
    pub mos: Option<f64>,
    pub jitter_max_variance: Option<f64>,
    pub packets_in: Option<u64>,
    pub packets_skipped: Option<u64>,
}

/// Authoritative billing fields from `CHANNEL_HANGUP_COMPLETE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrFinal {
    pub hangup_cause: Option<String>,
    pub duration_secs: Option<u64>,
    pub billsec: Option<u64>,
    pub progress_secs: Option<u64>,
    pub answer_secs: Option<u64>,
    pub wait_secs: Option<u64>,
    pub recording_path: Option<String>,
    pub media: MediaQuality,
    pub billing_leg: bool,
    pub ended_at: DateTime<Utc>,
}

impl CdrFinal {
    pub fn from_event(event: &EslEvent, billing_leg: bool, ended_at: DateTime<Utc>) -> Self {
        let hangup_cause = event
            .variable("hangup_cause")
            .or_else(|| event.header(names::HANGUP_CAUSE))
            .map(str::to_string);
        let recording_path = event
            .variable("record_path")
            .or_else(|| event.variable("recording_file"))
            .map(str::to_string);

        Self {
            hangup_cause,
            duration_secs: event.variable_u64("duration"),
            billsec: event.variable_u64("billsec"),
            progress_secs: event.variable_u64("progresssec"),
            answer_secs: event.variable_u64("answersec"),
            wait_secs: event.variable_u64("waitsec"),
            recording_path,
            media: MediaQuality {
                mos: event.variable_f64("rtp_audio_in_mos"),
                jitter_max_variance: event.variable_f64("rtp_audio_in_jitter_max_variance"),
                packets_in: event.variable_u64("rtp_audio_in_packet_count"),
                packets_skipped: event.variable_u64("rtp_audio_in_skip_packet_count"),
            },
            billing_leg,
            ended_at,
        }
    }
}

/// External CDR/billing collaborator
#[async_trait]
pub trait CdrSink: Send + Sync {
    async fn create_from_event(&self, fields: CdrCreate) -> EslResult<()>;

    async fn update_on_answer(&self, call_id: &str, fields: CdrAnswer) -> EslResult<()>;

    async fn update_on_hangup(&self, call_id: &str, fields: CdrFinal) -> EslResult<()>;
}

/// Sink that only logs, used when no billing backend is attached
#[derive(Debug, Default, Clone)]
pub struct LoggingCdrSink;

#[async_trait]
impl CdrSink for LoggingCdrSink {
    async fn create_from_event(&self, fields: CdrCreate) -> EslResult<()> {
        debug!(call_id = %fields.call_id, billing_leg = fields.billing_leg, "CDR create");
        Ok(())
    }

    async fn update_on_answer(&self, call_id: &str, fields: CdrAnswer) -> EslResult<()> {
        debug!(call_id = %call_id, answer_time = %fields.answer_time, "CDR answer");
        Ok(())
    }

    async fn update_on_hangup(&self, call_id: &str, fields: CdrFinal) -> EslResult<()> {
        debug!(
            call_id = %call_id,
            cause = fields.hangup_cause.as_deref().unwrap_or("unknown"),
            billsec = fields.billsec.unwrap_or(0),
            "CDR final"
        );
        Ok(())
    }
}

#[derive(Debug)]
enum CdrCommand {
    Create(CdrCreate),
    Answer { call_id: String, fields: CdrAnswer },
    Hangup { call_id: String, fields: CdrFinal },
}

/// Ordered, fire-and-forget handle to the CDR task
#[derive(Debug, Clone)]
pub struct CdrForwarder {
    tx: mpsc::Sender<CdrCommand>,
    dropped: Arc<AtomicU64>,
}

impl CdrForwarder {
    /// Spawn the forwarding task with room for `capacity` queued updates.
    /// The task drains what is queued and ends once every forwarder clone is dropped.
    pub fn spawn(sink: Arc<dyn CdrSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CdrCommand>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let (call_id, stage, result) = match command {
                    CdrCommand::Create(fields) => {
                        let call_id = fields.call_id.clone();
                        (call_id, "create", sink.create_from_event(fields).await)
                    }
                    CdrCommand::Answer { call_id, fields } => {
                        let result = sink.update_on_answer(&call_id, fields).await;
                        (call_id, "answer", result)
                    }
                    CdrCommand::Hangup { call_id, fields } => {
                        let result = sink.update_on_hangup(&call_id, fields).await;
                        (call_id, "hangup", result)
                    }
                };
                if let Err(e) = result {
                    warn!(call_id = %call_id, stage, error = %e, "CDR sink call failed");
                }
            }
            debug!("CDR forwarder stopped");
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Updates discarded because the queue was full or the task was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn create(&self, fields: CdrCreate) {
        self.forward(CdrCommand::Create(fields));
    }

    pub fn answer(&self, call_id: impl Into<String>, fields: CdrAnswer) {
        self.forward(CdrCommand::Answer {
            call_id: call_id.into(),
            fields,
        });
    }

    pub fn hangup(&self, call_id: impl Into<String>, fields: CdrFinal) {
        self.forward(CdrCommand::Hangup {
            call_id: call_id.into(),
            fields,
        });
    }

    fn forward(&self, command: CdrCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "CDR queue full, dropping CDR update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("CDR forwarder task is gone, dropping CDR update");
            }
        }
    }
}
