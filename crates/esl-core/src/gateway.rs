//! Command gateway
//!
//! Every switch command goes through [`CommandGateway`]. Commands come in two
//! shapes:
//!
//! - **api**: written as `api <command>`, the caller waits for the matching
//!   `api/response` up to the command timeout
//! - **bgapi**: written as `bgapi <command>` with a client-chosen `Job-UUID`
//!   that is registered in the [`JobTable`] first. The switch acknowledges at
//!   once and the output arrives later as a `BACKGROUND_JOB` event
//!
//! All operations fail with [`EslError::NotConnected`] before touching the
//! socket when the connection is down. Switch `-ERR` replies become
//! [`EslError::CommandFailed`], empty or unusable replies
//! [`EslError::MalformedResponse`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::call::{CallRecord, CallStatus};
use crate::config::EslConfig;
use crate::connection::ConnectionManager;
use crate::error::{EslError, EslResult};
use crate::jobs::JobTable;
use crate::protocol::{ContentType, EslFrame};
use crate::registry::CallRegistry;

/// Hangup cause used when the caller gives none
pub const DEFAULT_HANGUP_CAUSE: &str = "NORMAL_CLEARING";

/// Extra time an originate job may take beyond its ring timeout
const ORIGINATE_JOB_MARGIN: Duration = Duration::from_secs(10);

const SHOW_CHANNELS: &str = "show channels as json";

/// A call to originate.
///
/// The call id is generated when the request is built, so submitting the same
/// request again reuses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginateRequest {
    call_id: String,
    destination: String,
    context: String,
    timeout_secs: u32,
    extension: Option<String>,
    variables: BTreeMap<String, String>,
}

impl OriginateRequest {
    /// `destination` is either a dial string (`sofia/gateway/carrier/1555...`,
    /// `user/1000`) or a bare number routed through `context`
    pub fn new(destination: impl Into<String>, context: impl Into<String>, timeout_secs: u32) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            context: context.into(),
            timeout_secs,
            extension: None,
            variables: BTreeMap::new(),
        }
    }

    /// Send the answered leg to `extension` in the request context instead of parking it
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// The `originate` command line
    pub fn to_command(&self) -> String {
        let mut vars = vec![
            format!("origination_uuid={}", self.call_id),
            format!("originate_timeout={}", self.timeout_secs),
        ];
        vars.extend(self.variables.iter().map(|(k, v)| format!("{}={}", k, v)));

        let dial_string = if self.destination.contains('/') {
            self.destination.clone()
        } else {
            format!("loopback/{}/{}", self.destination, self.context)
        };

        let target = match &self.extension {
            Some(ext) => format!("{} XML {}", ext, self.context),
            None => "&park()".to_string(),
        };

        format!("originate {{{}}}{} {}", vars.join(","), dial_string, target)
    }

    fn validate(&self) -> EslResult<()> {
        check_arg("originate", &self.destination)?;
        check_arg("originate", &self.context)?;
        if let Some(ext) = &self.extension {
            check_arg("originate", ext)?;
        }
        for (name, value) in &self.variables {
            if name.is_empty() || name.contains([',', '=', '}']) || value.contains([',', '}', '\n']) {
                return Err(EslError::command_failed(
                    "originate",
                    format!("invalid channel variable '{}'", name),
                ));
            }
        }
        Ok(())
    }
}

/// Result of [`CommandGateway::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStatus {
    pub connected: bool,
    /// Seconds since the control connection was established
    pub uptime_secs: u64,
    pub connected_since: Option<DateTime<Utc>>,
    /// Raw `status` output of the switch
    pub switch_status: String,
}

/// Issues switch commands and correlates their results
#[derive(Debug, Clone)]
pub struct CommandGateway {
    connection: Arc<ConnectionManager>,
    jobs: Arc<JobTable>,
    registry: Arc<CallRegistry>,
    command_timeout: Duration,
    reload_timeout: Duration,
    job_timeout: Duration,
    recordings_dir: String,
}

impl CommandGateway {
    pub fn new(
        connection: Arc<ConnectionManager>,
        jobs: Arc<JobTable>,
        registry: Arc<CallRegistry>,
        config: &EslConfig,
    ) -> Self {
        Self {
            connection,
            jobs,
            registry,
            command_timeout: config.command_timeout(),
            reload_timeout: config.reload_timeout(),
            job_timeout: config.job_timeout(),
            recordings_dir: config.recordings_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn ensure_connected(&self) -> EslResult<()> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(EslError::NotConnected)
        }
    }

    /// Run `api <command>` with the default command timeout
    pub async fn api(&self, command: &str) -> EslResult<String> {
        self.api_with_timeout(command, self.command_timeout).await
    }

    pub async fn api_with_timeout(&self, command: &str, timeout: Duration) -> EslResult<String> {
        self.ensure_connected()?;
        let line = format!("api {}", command);
        let frame = self.connection.send_command(&line, timeout).await?;
        interpret_api_frame(command, &frame)
    }

    /// Run `bgapi <command>` and wait for its `BACKGROUND_JOB` result
    pub async fn bgapi(&self, command: &str) -> EslResult<String> {
        let (job_id, completion) = self.submit_bgapi(command, self.job_timeout).await?;
        await_job(&self.jobs, command, &job_id, completion, self.job_timeout).await
    }

    /// Write `bgapi <command>` under a fresh `Job-UUID` and wait only for the
    /// switch's acknowledgement. The job stays registered for `job_timeout`.
    async fn submit_bgapi(
        &self,
        command: &str,
        job_timeout: Duration,
    ) -> EslResult<(String, oneshot::Receiver<String>)> {
        self.ensure_connected()?;

        let job_id = Uuid::new_v4().to_string();
        let completion = self.jobs.register(job_id.clone(), command, job_timeout);
        let line = format!("bgapi {}\nJob-UUID: {}", command, job_id);

        let reply = match self.connection.send_command(&line, self.command_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.jobs.cancel(&job_id);
                return Err(e);
            }
        };
        if !reply.is_ok_reply() {
            self.jobs.cancel(&job_id);
            return Err(EslError::command_failed(
                command,
                reply.reply_text().unwrap_or("no reply text").trim(),
            ));
        }
        if let Some(acked) = reply.job_uuid() {
            if acked != job_id {
                warn!(job_id = %job_id, acked = %acked, "Switch acknowledged a different job id");
            }
        }
        Ok((job_id, completion))
    }

    /// Originate a call and return its call id
    pub async fn originate(&self, destination: &str, context: &str, timeout_secs: u32) -> EslResult<String> {
        self.originate_request(&OriginateRequest::new(destination, context, timeout_secs))
            .await
    }

    /// Originate a prepared request. Retrying with the same request reuses its call id.
    ///
    /// Returns as soon as the switch accepts the job, before the call is
    /// answered, so the id can be matched against `CHANNEL_CREATE`. The job
    /// outcome only arrives once the new leg answers or fails; it is awaited
    /// in the background and a failure is logged.
    pub async fn originate_request(&self, request: &OriginateRequest) -> EslResult<String> {
        self.ensure_connected()?;
        request.validate()?;

        info!(
            call_id = %request.call_id(),
            destination = %request.destination(),
            context = %request.context(),
            "Originating call"
        );
        let command = request.to_command();
        let job_timeout = self
            .job_timeout
            .max(Duration::from_secs(u64::from(request.timeout_secs)) + ORIGINATE_JOB_MARGIN);
        let (job_id, completion) = self.submit_bgapi(&command, job_timeout).await?;

        let jobs = Arc::clone(&self.jobs);
        let call_id = request.call_id().to_string();
        tokio::spawn(async move {
            match await_job(&jobs, &command, &job_id, completion, job_timeout).await {
                Ok(output) => {
                    let reported = output.strip_prefix("+OK").map(str::trim).unwrap_or_default();
                    if !reported.is_empty() && reported != call_id {
                        warn!(call_id = %call_id, reported = %reported, "Switch reported a different call id");
                    } else {
                        debug!(call_id = %call_id, "Originate completed");
                    }
                }
                Err(e) => warn!(call_id = %call_id, error = %e, "Originate failed"),
            }
        });
        Ok(request.call_id().to_string())
    }

    pub async fn hangup(&self, call_id: &str, cause: &str) -> EslResult<()> {
        self.ensure_connected()?;
        check_arg("uuid_kill", call_id)?;
        let cause = if cause.trim().is_empty() {
            DEFAULT_HANGUP_CAUSE
        } else {
            cause.trim()
        };
        check_arg("uuid_kill", cause)?;
        self.api(&format!("uuid_kill {} {}", call_id, cause)).await?;
        debug!(call_id = %call_id, cause, "Hangup requested");
        Ok(())
    }

    pub async fn transfer(&self, call_id: &str, destination: &str, context: &str) -> EslResult<()> {
        self.ensure_connected()?;
        for arg in [call_id, destination, context] {
            check_arg("uuid_transfer", arg)?;
        }
        self.api(&format!("uuid_transfer {} {} XML {}", call_id, destination, context))
            .await?;
        debug!(call_id = %call_id, destination, context, "Transfer requested");
        Ok(())
    }

    pub async fn hold(&self, call_id: &str) -> EslResult<()> {
        self.set_hold(call_id, true).await
    }

    pub async fn unhold(&self, call_id: &str) -> EslResult<()> {
        self.set_hold(call_id, false).await
    }

    /// Tracked calls must be answered to be held and held to be resumed.
    /// Calls the registry does not know are passed through to the switch.
    async fn set_hold(&self, call_id: &str, held: bool) -> EslResult<()> {
        self.ensure_connected()?;
        check_arg("uuid_hold", call_id)?;
        if let Some(record) = self.registry.get(call_id) {
            let allowed = if held {
                record.status == CallStatus::Answered
            } else {
                record.status == CallStatus::Hold
            };
            if !allowed {
                return Err(EslError::InvalidCallState {
                    call_id: call_id.to_string(),
                    current_state: record.status.to_string(),
                });
            }
        }
        let command = if held {
            format!("uuid_hold {}", call_id)
        } else {
            format!("uuid_hold off {}", call_id)
        };
        self.api(&command).await?;

        match self.registry.set_hold(call_id, held) {
            Ok(record) => debug!(call_id = %call_id, status = %record.status, "Hold state updated"),
            Err(e) => debug!(call_id = %call_id, error = %e, "Hold applied to a call the registry does not track"),
        }
        Ok(())
    }

    /// Start recording to `<recordings_dir>/<call_id>_<timestamp>.wav`, returns the path
    pub async fn start_recording(&self, call_id: &str) -> EslResult<String> {
        self.ensure_connected()?;
        check_arg("uuid_record", call_id)?;
        let path = format!(
            "{}/{}_{}.wav",
            self.recordings_dir,
            call_id,
            Utc::now().format("%Y%m%d%H%M%S")
        );
        self.api(&format!("uuid_record {} start {}", call_id, path)).await?;

        if let Err(e) = self.registry.set_recording(call_id, true) {
            debug!(call_id = %call_id, error = %e, "Recording started for an untracked call");
        }
        info!(call_id = %call_id, path = %path, "Recording started");
        Ok(path)
    }

    pub async fn stop_recording(&self, call_id: &str) -> EslResult<()> {
        self.ensure_connected()?;
        check_arg("uuid_record", call_id)?;
        self.api(&format!("uuid_record {} stop all", call_id)).await?;

        if let Err(e) = self.registry.set_recording(call_id, false) {
            debug!(call_id = %call_id, error = %e, "Recording stopped for an untracked call");
        }
        Ok(())
    }

    pub async fn get_channel_info(&self, call_id: &str) -> EslResult<CallRecord> {
        self.ensure_connected()?;
        self.registry
            .get(call_id)
            .ok_or_else(|| EslError::call_not_found(call_id))
    }

    pub async fn get_active_calls(&self) -> EslResult<Vec<CallRecord>> {
        self.ensure_connected()?;
        Ok(self.registry.list())
    }

    pub async fn get_status(&self) -> EslResult<SwitchStatus> {
        self.ensure_connected()?;
        let switch_status = self.api("status").await?;
        let connected_since = self.connection.connected_since();
        let uptime_secs = connected_since
            .map(|since| (Utc::now() - since).num_seconds().max(0) as u64)
            .unwrap_or(0);
        Ok(SwitchStatus {
            connected: self.connection.is_connected(),
            uptime_secs,
            connected_since,
            switch_status,
        })
    }

    /// Run an arbitrary api command, arguments joined with spaces
    pub async fn execute_raw(&self, command: &str, args: &[&str]) -> EslResult<String> {
        self.ensure_connected()?;
        check_arg("api", command)?;
        let mut line = command.to_string();
        for arg in args {
            if arg.contains('\n') {
                return Err(EslError::command_failed(command, "argument contains a line break"));
            }
            line.push(' ');
            line.push_str(arg);
        }
        self.api(&line).await
    }

    /// `reloadxml` with the longer reload timeout
    pub async fn reload_xml(&self) -> EslResult<String> {
        self.ensure_connected()?;
        self.api_with_timeout("reloadxml", self.reload_timeout).await
    }

    /// Raw JSON of `show channels as json`. An empty reply means no channels
    /// and comes back as an empty string.
    pub async fn show_channels(&self) -> EslResult<String> {
        self.ensure_connected()?;
        let line = format!("api {}", SHOW_CHANNELS);
        let frame = self.connection.send_command(&line, self.command_timeout).await?;
        if frame.content_type() == Some(ContentType::ApiResponse)
            && frame.body().map_or(true, |b| b.trim().is_empty())
        {
            return Ok(String::new());
        }
        interpret_api_frame(SHOW_CHANNELS, &frame)
    }
}

/// Wait for a submitted job; on timeout the slot is released so a late result is discarded
async fn await_job(
    jobs: &JobTable,
    command: &str,
    job_id: &str,
    completion: oneshot::Receiver<String>,
    timeout: Duration,
) -> EslResult<String> {
    let timeout_ms = timeout.as_millis() as u64;
    match tokio::time::timeout(timeout, completion).await {
        Ok(Ok(body)) => interpret_body(command, Some(body.as_str())),
        Ok(Err(_)) => Err(EslError::CommandTimeout {
            command: command.to_string(),
            timeout_ms,
        }),
        Err(_) => {
            jobs.cancel(job_id);
            Err(EslError::CommandTimeout {
                command: command.to_string(),
                timeout_ms,
            })
        }
    }
}

/// Reject arguments that would split the command line
fn check_arg(command: &str, value: &str) -> EslResult<()> {
    if value.trim().is_empty() {
        return Err(EslError::command_failed(command, "empty argument"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(EslError::command_failed(
            command,
            format!("argument '{}' contains whitespace", value.escape_debug()),
        ));
    }
    Ok(())
}

fn interpret_api_frame(command: &str, frame: &EslFrame) -> EslResult<String> {
    match frame.content_type() {
        Some(ContentType::ApiResponse) => interpret_body(command, frame.body()),
        // The switch answers refused api commands with a bare command/reply
        Some(ContentType::CommandReply) => match frame.reply_text() {
            Some(text) if text.starts_with("-ERR") => Err(EslError::command_failed(
                command,
                text.trim_start_matches("-ERR").trim(),
            )),
            Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            _ => Err(EslError::malformed_response(command, "reply without text")),
        },
        other => Err(EslError::malformed_response(
            command,
            format!("unexpected content type {:?}", other),
        )),
    }
}

/// Map a command output to a result; `-ERR` and `-USAGE` are failures
pub(crate) fn interpret_body(command: &str, body: Option<&str>) -> EslResult<String> {
    let body = body
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| EslError::malformed_response(command, "empty response"))?;

    if let Some(reason) = body.strip_prefix("-ERR") {
        return Err(EslError::command_failed(command, reason.trim()));
    }
    if body.starts_with("-USAGE") {
        return Err(EslError::command_failed(command, body));
    }
    Ok(body.to_string())
}
