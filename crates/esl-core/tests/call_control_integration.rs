//! Call-control service end to end against a loopback switch
//!
//! Events pushed by the switch must show up in the registry and on the call
//! stream; commands must reach the switch in the expected wire form.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{default_responder, event_frame, eventually, MockSwitch};
use parking_lot::Mutex;
use rvoip_esl_core::{
    CallControlService, CallDirection, CallEvent, CallEventKind, CallStatus, CdrAnswer, CdrCreate,
    CdrFinal, CdrSink, ChannelMarkerBillingLeg, EslError, EslResult, OriginateRequest,
};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

async fn started(switch: &MockSwitch) -> CallControlService {
    let service = CallControlService::new(switch.config());
    service.start().await.expect("service connects to the loopback switch");
    service
}

async fn next_call_event(calls: &mut broadcast::Receiver<CallEvent>) -> CallEvent {
    timeout(Duration::from_secs(2), calls.recv())
        .await
        .expect("call event within two seconds")
        .expect("call stream open")
}

fn create_a123(switch: &MockSwitch) {
    switch.send_event(&[
        ("Event-Name", "CHANNEL_CREATE"),
        ("Unique-ID", "A123"),
        ("Caller-Caller-ID-Number", "1000"),
        ("Caller-Destination-Number", "2000"),
        ("Call-Direction", "inbound"),
        ("Channel-Name", "sofia/internal/1000@pbx.local"),
    ]);
}

#[tokio::test]
async fn test_status_reports_switch_output() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;

    let status = assert_ok!(service.gateway().get_status().await);
    assert!(status.connected);
    assert!(status.connected_since.is_some());
    assert!(status.switch_status.starts_with("UP"), "got {:?}", status.switch_status);
    assert!(switch.received("api status"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_call_lifecycle_from_switch_events() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    create_a123(&switch);
    let created = next_call_event(&mut calls).await;
    assert_eq!(created.kind, CallEventKind::Created);
    assert_eq!(created.call_id, "A123");
    assert_eq!(created.caller_number, "1000");
    assert_eq!(created.callee_number, "2000");
    assert_eq!(created.direction, CallDirection::Inbound);
    assert_eq!(created.status, CallStatus::Ringing);

    let record = service.registry().get("A123").expect("A123 registered");
    assert_eq!(
        record.metadata.get("channel_name").map(String::as_str),
        Some("sofia/internal/1000@pbx.local"),
        "percent-encoded header values arrive decoded"
    );

    switch.send_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "A123")]);
    let answered = next_call_event(&mut calls).await;
    assert_eq!(answered.kind, CallEventKind::Answered);
    assert_eq!(answered.status, CallStatus::Answered);
    assert!(service.registry().get("A123").unwrap().answer_time.is_some());

    switch.send_event(&[
        ("Event-Name", "CHANNEL_HANGUP"),
        ("Unique-ID", "A123"),
        ("Hangup-Cause", "NORMAL_CLEARING"),
    ]);
    let hung_up = next_call_event(&mut calls).await;
    match &hung_up.kind {
        CallEventKind::HungUp { cause, .. } => {
            assert_eq!(cause.as_deref(), Some("NORMAL_CLEARING"));
        }
        other => panic!("expected HungUp, got {:?}", other),
    }
    assert_eq!(hung_up.status, CallStatus::Hangup);
    assert!(hung_up.is_terminal());
    assert!(service.registry().get("A123").is_none(), "hangup removes the call");
    assert!(service.active_calls().is_empty());

    let dispatch = service.dispatch_stats();
    assert_eq!(dispatch.received, 3);
    assert_eq!(dispatch.handler_errors, 0);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_events_reach_raw_subscribers() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    let mut raw = service.subscribe_raw();

    switch.send_event(&[("Event-Name", "HEARTBEAT"), ("Up-Time", "0 years, 1 day")]);
    let event = timeout(Duration::from_secs(2), raw.recv())
        .await
        .expect("raw event within two seconds")
        .unwrap();
    assert_eq!(event.event_name(), Some("HEARTBEAT"));
    assert_eq!(event.header("Up-Time"), Some("0 years, 1 day"));
    assert!(service.active_calls().is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hold_and_unhold_update_registry() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    create_a123(&switch);
    next_call_event(&mut calls).await;
    switch.send_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "A123")]);
    next_call_event(&mut calls).await;

    assert_ok!(service.gateway().hold("A123").await);
    assert!(switch.received("api uuid_hold A123"));
    assert_eq!(service.registry().get("A123").unwrap().status, CallStatus::Hold);

    assert_ok!(service.gateway().unhold("A123").await);
    assert!(switch.received("api uuid_hold off A123"));
    assert_eq!(service.registry().get("A123").unwrap().status, CallStatus::Answered);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recording_path_and_flag() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    create_a123(&switch);
    next_call_event(&mut calls).await;

    let path = assert_ok!(service.gateway().start_recording("A123").await);
    assert!(path.contains("/A123_"), "path {:?}", path);
    assert!(path.ends_with(".wav"));
    assert!(switch.received(&format!("api uuid_record A123 start {}", path)));
    assert!(service.registry().get("A123").unwrap().recording);

    assert_ok!(service.gateway().stop_recording("A123").await);
    assert!(switch.received("api uuid_record A123 stop all"));
    assert!(!service.registry().get("A123").unwrap().recording);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hangup_and_transfer_wire_form() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;

    assert_ok!(service.gateway().hangup("A123", "").await);
    assert!(switch.received("api uuid_kill A123 NORMAL_CLEARING"));

    assert_ok!(service.gateway().hangup("A123", "USER_BUSY").await);
    assert!(switch.received("api uuid_kill A123 USER_BUSY"));

    assert_ok!(service.gateway().transfer("A123", "3000", "default").await);
    assert!(switch.received("api uuid_transfer A123 3000 XML default"));

    let result = service.gateway().transfer("A123", "30 00", "default").await;
    assert!(matches!(result, Err(EslError::CommandFailed { .. })));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_originate_returns_request_call_id() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;

    let request = OriginateRequest::new("1000", "default", 30).with_extension("1000");
    let call_id = assert_ok!(service.gateway().originate_request(&request).await);
    assert_eq!(call_id, request.call_id());

    let bgapi = switch
        .commands()
        .into_iter()
        .find(|c| c.starts_with("bgapi originate"))
        .expect("originate sent as bgapi");
    assert!(bgapi.contains(&format!("origination_uuid={}", call_id)));
    assert!(bgapi.contains("originate_timeout=30"));
    assert!(bgapi.contains("loopback/1000/default 1000 XML default"), "command {:?}", bgapi);
    assert!(bgapi.contains("\nJob-UUID: "));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_background_job_error_is_command_failed() {
    let responder = Arc::new(|command: &str| {
        if command.starts_with("originate") {
            Some("-ERR USER_BUSY\n".to_string())
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = started(&switch).await;

    let result = service.gateway().bgapi("originate user/1000 &park()").await;
    match assert_err!(result) {
        EslError::CommandFailed { reason, .. } => assert!(reason.contains("USER_BUSY"), "reason {:?}", reason),
        other => panic!("expected CommandFailed, got {:?}", other),
    }

    // Originate hands back the id on acceptance; the failed job only gets logged
    let call_id = assert_ok!(service.gateway().originate("1000", "default", 30).await);
    assert!(!call_id.is_empty());
    assert!(eventually(|| service.pending_jobs() == 0).await);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_originate_returns_before_the_call_is_answered() {
    // The switch accepts the job but reports its outcome only once the leg answers
    let responder = Arc::new(|command: &str| {
        if command.starts_with("originate") {
            None
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    let started_at = Instant::now();
    let call_id = assert_ok!(service.gateway().originate("1000", "default", 60).await);
    assert!(
        started_at.elapsed() < Duration::from_millis(500),
        "originate waited {:?}",
        started_at.elapsed()
    );
    assert_eq!(service.pending_jobs(), 1, "job result still awaited in the background");

    switch.send_event(&[
        ("Event-Name", "CHANNEL_CREATE"),
        ("Unique-ID", &call_id),
        ("Caller-Caller-ID-Number", "0000000000"),
        ("Caller-Destination-Number", "1000"),
        ("Call-Direction", "outbound"),
        ("variable_origination_uuid", &call_id),
    ]);
    let created = next_call_event(&mut calls).await;
    assert_eq!(created.kind, CallEventKind::Created);
    assert_eq!(created.call_id, call_id);
    assert!(service.registry().get(&call_id).is_some());

    // Past the configured job timeout the ring timeout still keeps the job alive
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(service.pending_jobs(), 1);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_api_times_out() {
    let responder = Arc::new(|command: &str| {
        if command == "reloadxml" {
            None
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = started(&switch).await;

    let result = service
        .gateway()
        .api_with_timeout("reloadxml", Duration::from_millis(100))
        .await;
    assert!(
        matches!(result, Err(EslError::CommandTimeout { timeout_ms: 100, .. })),
        "got {:?}",
        result
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_background_job_is_discarded() {
    let responder = Arc::new(|command: &str| {
        if command == "hupall" {
            None
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = CallControlService::new(switch.config().with_job_timeout(Duration::from_millis(200)));
    service.start().await.unwrap();
    let mut raw = service.subscribe_raw();

    let result = service.gateway().bgapi("hupall").await;
    assert!(
        matches!(result, Err(EslError::CommandTimeout { timeout_ms: 200, .. })),
        "got {:?}",
        result
    );
    assert_eq!(service.pending_jobs(), 0, "timed-out job is released");

    let job_id = switch
        .commands()
        .iter()
        .find_map(|c| c.strip_prefix("bgapi hupall\nJob-UUID: ").map(str::to_string))
        .expect("hupall sent as bgapi with a job id");
    switch.send_raw(event_frame(
        &[("Event-Name", "BACKGROUND_JOB"), ("Job-UUID", &job_id)],
        Some("+OK late\n"),
    ));

    let event = timeout(Duration::from_secs(2), raw.recv())
        .await
        .expect("late job still republished")
        .unwrap();
    assert_eq!(event.event_name(), Some("BACKGROUND_JOB"));
    assert_eq!(service.dispatch_stats().handler_errors, 0);

    // The next job gets its own result, not the late one
    let output = assert_ok!(service.gateway().bgapi("status").await);
    assert!(output.starts_with("UP"), "got {:?}", output);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_channel_list_is_no_calls() {
    let responder = Arc::new(|command: &str| {
        if command == "show channels as json" {
            Some(String::new())
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = started(&switch).await;

    let snapshot = assert_ok!(service.poll_snapshot().await);
    assert!(snapshot.is_empty());
    assert!(snapshot.reconciliation.only_in_snapshot.is_empty());
    assert_eq!(assert_ok!(service.gateway().show_channels().await), "");

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hold_rejects_calls_in_the_wrong_state() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    create_a123(&switch);
    next_call_event(&mut calls).await;

    let result = service.gateway().hold("A123").await;
    assert_eq!(
        assert_err!(result),
        EslError::InvalidCallState {
            call_id: "A123".to_string(),
            current_state: "ringing".to_string(),
        }
    );
    assert!(!switch.received("api uuid_hold A123"), "rejected before reaching the switch");

    switch.send_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "A123")]);
    next_call_event(&mut calls).await;
    let result = service.gateway().unhold("A123").await;
    assert!(
        matches!(result, Err(EslError::InvalidCallState { ref current_state, .. }) if current_state == "answered"),
        "got {:?}",
        result
    );

    // Calls the registry does not track go straight to the switch
    assert_ok!(service.gateway().hold("Z999").await);
    assert!(switch.received("api uuid_hold Z999"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_execute_raw_joins_arguments() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;

    let output = assert_ok!(service.gateway().execute_raw("uuid_setvar", &["A123", "foo", "bar"]).await);
    assert_eq!(output.trim(), "+OK");
    assert!(switch.received("api uuid_setvar A123 foo bar"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_reports_registry_drift() {
    let responder = Arc::new(|command: &str| {
        if command == "show channels as json" {
            Some(
                r#"{"row_count":1,"rows":[{"uuid":"B456","direction":"outbound","created_epoch":"1700000000","cid_num":"3000","dest":"4000","callstate":"ACTIVE"}]}"#
                    .to_string(),
            )
        } else {
            default_responder(command)
        }
    });
    let switch = MockSwitch::start_with(responder).await.unwrap();
    let service = started(&switch).await;
    let mut calls = service.subscribe_calls();

    create_a123(&switch);
    next_call_event(&mut calls).await;

    let snapshot = assert_ok!(service.poll_snapshot().await);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.calls[0].call_id, "B456");
    assert_eq!(snapshot.calls[0].status, CallStatus::Answered);
    assert_eq!(snapshot.calls[0].direction, CallDirection::Outbound);
    assert_eq!(snapshot.reconciliation.only_in_snapshot, vec!["B456".to_string()]);
    assert_eq!(snapshot.reconciliation.only_in_registry, vec!["A123".to_string()]);

    // Fresh snapshot drives the statistics
    let stats = service.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.outbound, 1);
    assert_eq!(stats.answered, 1);
    assert_eq!(stats.answer_rate, 100);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let switch = MockSwitch::start().await.unwrap();
    let service = started(&switch).await;
    assert!(service.is_connected());

    service.shutdown().await.unwrap();
    assert!(!service.is_connected());
    assert!(eventually(|| switch.received("exit")).await);

    let result = service.gateway().get_status().await;
    assert_eq!(assert_err!(result), EslError::NotConnected);
    let result = service.gateway().hangup("A123", "NORMAL_CLEARING").await;
    assert_eq!(assert_err!(result), EslError::NotConnected);
}

/// Sink that takes its time on every call
#[derive(Default)]
struct SlowSink {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CdrSink for SlowSink {
    async fn create_from_event(&self, fields: CdrCreate) -> EslResult<()> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.calls.lock().push(format!("create:{}", fields.call_id));
        Ok(())
    }

    async fn update_on_answer(&self, call_id: &str, _fields: CdrAnswer) -> EslResult<()> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.calls.lock().push(format!("answer:{}", call_id));
        Ok(())
    }

    async fn update_on_hangup(&self, call_id: &str, fields: CdrFinal) -> EslResult<()> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.calls.lock().push(format!(
            "hangup:{}:{}",
            call_id,
            fields.billsec.unwrap_or_default()
        ));
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_delivers_queued_cdr_updates() {
    let switch = MockSwitch::start().await.unwrap();
    let config = switch.config();
    let sink = Arc::new(SlowSink::default());
    let billing = Arc::new(ChannelMarkerBillingLeg::new(&config.billing));
    let service = CallControlService::with_collaborators(config, sink.clone(), billing);
    service.start().await.unwrap();
    let mut raw = service.subscribe_raw();

    create_a123(&switch);
    switch.send_event(&[("Event-Name", "CHANNEL_ANSWER"), ("Unique-ID", "A123")]);
    switch.send_event(&[
        ("Event-Name", "CHANNEL_HANGUP"),
        ("Unique-ID", "A123"),
        ("Hangup-Cause", "NORMAL_CLEARING"),
    ]);
    switch.send_event(&[
        ("Event-Name", "CHANNEL_HANGUP_COMPLETE"),
        ("Unique-ID", "A123"),
        ("variable_billsec", "42"),
    ]);

    loop {
        let event = timeout(Duration::from_secs(2), raw.recv())
            .await
            .expect("hangup-complete within two seconds")
            .unwrap();
        if event.event_name() == Some("CHANNEL_HANGUP_COMPLETE") {
            break;
        }
    }
    assert!(sink.calls.lock().len() < 3, "sink is still working through the queue");

    service.shutdown().await.unwrap();
    assert_eq!(
        *sink.calls.lock(),
        vec!["create:A123", "answer:A123", "hangup:A123:42"]
    );
}
