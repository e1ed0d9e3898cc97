//! Event dispatcher
//!
//! Consumes the ordered event channel fed by the connection read loop. Each
//! event is classified by exact `Event-Name`, handed to its lifecycle handler
//! and then republished as a raw event, whatever the handler did. Handler
//! errors and panics are contained per event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::{CallDirection, CallRecord, UNKNOWN_PARTY};
use crate::cdr::{CdrAnswer, CdrCreate, CdrFinal, CdrForwarder};
use crate::config::BillingLegConfig;
use crate::error::{EslError, EslResult};
use crate::events::{CallEvent, CallEventKind, EventHub};
use crate::jobs::JobTable;
use crate::protocol::{names, EslEvent};
use crate::registry::CallRegistry;

/// Decides whether a leg is the one billing should treat as authoritative
pub trait BillingLegPredicate: Send + Sync {
    fn is_billing_leg(&self, event: &EslEvent) -> bool;
}

/// Channel-name / origination heuristic.
///
/// A leg is the billing leg when it was originated with an explicit
/// `origination_uuid`, or when its channel name contains one of the
/// configured markers (gateway legs by default). Otherwise the A-leg of an
/// inbound call (`Unique-ID == Channel-Call-UUID`) is used.
#[derive(Debug, Clone)]
pub struct ChannelMarkerBillingLeg {
    markers: Vec<String>,
}

impl ChannelMarkerBillingLeg {
    pub fn new(config: &BillingLegConfig) -> Self {
        Self {
            markers: config.channel_markers.clone(),
        }
    }
}

impl BillingLegPredicate for ChannelMarkerBillingLeg {
    fn is_billing_leg(&self, event: &EslEvent) -> bool {
        if event.variable("origination_uuid").map_or(false, |v| !v.is_empty()) {
            return true;
        }
        if let Some(channel) = event.header(names::CHANNEL_NAME) {
            if self.markers.iter().any(|m| !m.is_empty() && channel.contains(m.as_str())) {
                return true;
            }
        }
        let inbound = event
            .header(names::CALL_DIRECTION)
            .and_then(|d| d.parse::<CallDirection>().ok())
            == Some(CallDirection::Inbound);
        inbound
            && event.unique_id().is_some()
            && event.unique_id() == event.header(names::CHANNEL_CALL_UUID)
    }
}

/// Counters for monitoring the dispatch loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub dropped: u64,
    pub unhandled: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    unhandled: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
}

/// Routes switch events to registry transitions and broadcast channels
pub struct EventDispatcher {
    registry: Arc<CallRegistry>,
    jobs: Arc<JobTable>,
    hub: EventHub,
    /// Released when the dispatch loop ends so the CDR task can drain and stop
    cdr: Mutex<Option<CdrForwarder>>,
    billing: Arc<dyn BillingLegPredicate>,
    counters: Counters,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("calls", &self.registry.len())
            .field("pending_jobs", &self.jobs.len())
            .field("cdr", &self.cdr.lock().is_some())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(registry: Arc<CallRegistry>, jobs: Arc<JobTable>, hub: EventHub) -> Self {
        Self {
            registry,
            jobs,
            hub,
            cdr: Mutex::new(None),
            billing: Arc::new(ChannelMarkerBillingLeg::new(&BillingLegConfig::default())),
            counters: Counters::default(),
        }
    }

    pub fn with_cdr(mut self, cdr: CdrForwarder) -> Self {
        *self.cdr.get_mut() = Some(cdr);
        self
    }

    /// Drop the CDR forwarder; later lifecycle events reach no sink
    pub fn release_cdr(&self) {
        if self.cdr.lock().take().is_some() {
            debug!("Released CDR forwarder");
        }
    }

    pub fn with_billing_predicate(mut self, predicate: Arc<dyn BillingLegPredicate>) -> Self {
        self.billing = predicate;
        self
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            handler_panics: self.counters.handler_panics.load(Ordering::Relaxed),
        }
    }

    /// Drain the event channel until it closes or `cancel` fires
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<EslEvent>, cancel: CancellationToken) {
        info!("Starting event dispatch loop");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }
        self.release_cdr();
        info!("Event dispatch loop ended");
    }

    /// Handle one event, then republish it on the raw channel
    pub fn dispatch(&self, event: EslEvent) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(name) = event.event_name().map(str::to_string) else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(headers = event.headers().len(), "Dropping event without Event-Name");
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| self.handle(&name, &event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(event = %name, error = %e, category = e.category(), "Event handler failed");
            }
            Err(_) => {
                self.counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                error!(event = %name, "Event handler panicked");
            }
        }

        self.hub.publish_raw(Arc::new(event));
    }

    fn handle(&self, name: &str, event: &EslEvent) -> EslResult<()> {
        match name {
            names::CHANNEL_CREATE => self.on_create(event),
            names::CHANNEL_ANSWER => self.on_answer(event),
            names::CHANNEL_HANGUP => self.on_hangup(event),
            names::CHANNEL_HANGUP_COMPLETE => self.on_hangup_complete(event),
            names::CHANNEL_HOLD => self.on_hold(event, true),
            names::CHANNEL_UNHOLD => self.on_hold(event, false),
            names::DTMF => self.on_dtmf(event),
            names::RECORD_START => self.on_record(event, true),
            names::RECORD_STOP => self.on_record(event, false),
            names::BACKGROUND_JOB => self.on_background_job(event),
            other => {
                self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
                debug!(event = %other, "Unhandled event");
                Ok(())
            }
        }
    }

    fn on_create(&self, event: &EslEvent) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let now = Utc::now();

        let caller = event
            .header(names::CALLER_NUMBER)
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_PARTY);
        let callee = event
            .header(names::DESTINATION_NUMBER)
            .or_else(|| event.header("Caller-Callee-ID-Number"))
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_PARTY);
        let direction = event
            .header(names::CALL_DIRECTION)
            .and_then(|d| d.parse().ok())
            .unwrap_or(CallDirection::Inbound);

        let mut record = CallRecord::new(call_id, caller, callee, direction, now);
        record.metadata = call_metadata(event);
        record.billing_leg = self.billing.is_billing_leg(event);

        let record = self.registry.insert(record)?;
        debug!(
            call_id = %record.call_id,
            caller = %record.caller_number,
            callee = %record.callee_number,
            direction = %record.direction,
            billing_leg = record.billing_leg,
            "Call created"
        );
        self.hub
            .publish_call(CallEvent::from_record(CallEventKind::Created, &record, now));
        if let Some(cdr) = self.cdr.lock().as_ref() {
            cdr.create(CdrCreate::from(&record));
        }
        Ok(())
    }

    fn on_answer(&self, event: &EslEvent) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let now = Utc::now();
        let record = self.registry.mark_answered(call_id, now)?;
        debug!(call_id = %call_id, "Call answered");

        self.hub
            .publish_call(CallEvent::from_record(CallEventKind::Answered, &record, now));
        if let Some(cdr) = self.cdr.lock().as_ref() {
            cdr.answer(
                call_id,
                CdrAnswer {
                    answer_time: now,
                    headers: event.headers().clone(),
                },
            );
        }
        Ok(())
    }

    fn on_hangup(&self, event: &EslEvent) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let now = Utc::now();
        let explicit = event.variable_u64("duration");
        let cause = event
            .header(names::HANGUP_CAUSE)
            .or_else(|| event.variable("hangup_cause"))
            .map(str::to_string);

        let removed = self.registry.remove_with(call_id, explicit, now, |record, duration_secs| {
            let kind = CallEventKind::HungUp {
                duration_secs,
                cause: cause.clone(),
            };
            self.hub.publish_call(CallEvent::from_record(kind, record, now));
        });

        match removed {
            Some((_, duration_secs)) => {
                debug!(call_id = %call_id, duration_secs, cause = ?cause, "Call hung up");
                Ok(())
            }
            None => Err(EslError::call_not_found(call_id)),
        }
    }

    /// Billing fields only; the record is already gone
    fn on_hangup_complete(&self, event: &EslEvent) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let fields = CdrFinal::from_event(event, self.billing.is_billing_leg(event), Utc::now());
        debug!(
            call_id = %call_id,
            billsec = fields.billsec.unwrap_or(0),
            billing_leg = fields.billing_leg,
            "Hangup complete"
        );
        if let Some(cdr) = self.cdr.lock().as_ref() {
            cdr.hangup(call_id, fields);
        }
        Ok(())
    }

    fn on_hold(&self, event: &EslEvent, held: bool) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let record = self.registry.set_hold(call_id, held)?;
        let kind = if held {
            CallEventKind::Held
        } else {
            CallEventKind::Resumed
        };
        self.hub
            .publish_call(CallEvent::from_record(kind, &record, Utc::now()));
        Ok(())
    }

    fn on_record(&self, event: &EslEvent, started: bool) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let record = self.registry.set_recording(call_id, started)?;
        let kind = if started {
            CallEventKind::RecordingStarted {
                path: event
                    .header(names::RECORD_FILE_PATH)
                    .unwrap_or_default()
                    .to_string(),
            }
        } else {
            CallEventKind::RecordingStopped
        };
        self.hub
            .publish_call(CallEvent::from_record(kind, &record, Utc::now()));
        Ok(())
    }

    fn on_dtmf(&self, event: &EslEvent) -> EslResult<()> {
        let call_id = required_call_id(event)?;
        let digit = event
            .header(names::DTMF_DIGIT)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| EslError::missing_header(names::DTMF_DIGIT))?;
        let duration_ms = event
            .header(names::DTMF_DURATION)
            .and_then(|d| d.trim().parse().ok());

        let record = self
            .registry
            .get(call_id)
            .ok_or_else(|| EslError::call_not_found(call_id))?;
        debug!(call_id = %call_id, digit, "DTMF");
        let kind = CallEventKind::Dtmf {
            digit: digit.to_string(),
            duration_ms,
        };
        self.hub
            .publish_call(CallEvent::from_record(kind, &record, Utc::now()));
        Ok(())
    }

    fn on_background_job(&self, event: &EslEvent) -> EslResult<()> {
        let job_id = event
            .job_uuid()
            .ok_or_else(|| EslError::missing_header(names::JOB_UUID))?;
        let body = event.body().unwrap_or_default();
        if !self.jobs.complete(job_id, body) {
            debug!(job_id = %job_id, "Background job result had no waiting caller");
        }
        Ok(())
    }
}

fn required_call_id(event: &EslEvent) -> EslResult<&str> {
    event
        .unique_id()
        .ok_or_else(|| EslError::missing_header(names::UNIQUE_ID))
}

/// Header values carried into the record's metadata bag
fn call_metadata(event: &EslEvent) -> HashMap<String, String> {
    const CARRIED: &[(&str, &str)] = &[
        ("channel_name", names::CHANNEL_NAME),
        ("caller_name", names::CALLER_NAME),
        ("domain", "variable_domain_name"),
        ("user_agent", "variable_sip_user_agent"),
        ("sip_call_id", "variable_sip_call_id"),
        ("call_uuid", names::CHANNEL_CALL_UUID),
    ];

    CARRIED
        .iter()
        .filter_map(|(key, header)| {
            event
                .header(header)
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v.to_string()))
        })
        .collect()
}
