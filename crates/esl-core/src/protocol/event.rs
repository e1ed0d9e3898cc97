//! Switch events

use std::collections::HashMap;

use super::frame::{ContentType, EslFrame};
use super::parse_header_block;
use crate::error::{EslError, EslResult};

/// Event and header names used by this crate
pub mod names {
    pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
    pub const CHANNEL_ANSWER: &str = "CHANNEL_ANSWER";
    pub const CHANNEL_HANGUP: &str = "CHANNEL_HANGUP";
    pub const CHANNEL_HANGUP_COMPLETE: &str = "CHANNEL_HANGUP_COMPLETE";
    pub const CHANNEL_HOLD: &str = "CHANNEL_HOLD";
    pub const CHANNEL_UNHOLD: &str = "CHANNEL_UNHOLD";
    pub const DTMF: &str = "DTMF";
    pub const BACKGROUND_JOB: &str = "BACKGROUND_JOB";
    pub const RECORD_START: &str = "RECORD_START";
    pub const RECORD_STOP: &str = "RECORD_STOP";

    pub const EVENT_NAME: &str = "Event-Name";
    pub const UNIQUE_ID: &str = "Unique-ID";
    pub const JOB_UUID: &str = "Job-UUID";
    pub const CALL_DIRECTION: &str = "Call-Direction";
    pub const CALLER_NUMBER: &str = "Caller-Caller-ID-Number";
    pub const CALLER_NAME: &str = "Caller-Caller-ID-Name";
    pub const DESTINATION_NUMBER: &str = "Caller-Destination-Number";
    pub const CHANNEL_NAME: &str = "Channel-Name";
    pub const CHANNEL_CALL_UUID: &str = "Channel-Call-UUID";
    pub const HANGUP_CAUSE: &str = "Hangup-Cause";
    pub const DTMF_DIGIT: &str = "DTMF-Digit";
    pub const DTMF_DURATION: &str = "DTMF-Duration";
    pub const EVENT_TIMESTAMP: &str = "Event-Date-Timestamp";
    pub const RECORD_FILE_PATH: &str = "Record-File-Path";
}

/// One event from the switch: headers and optional body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EslEvent {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an event carrying only its `Event-Name`
    pub fn with_name(name: impl Into<String>) -> Self {
        let mut event = Self::new();
        event.set_header(names::EVENT_NAME, name);
        event
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Builder-style header setter, handy for tests and synthetic events
    pub fn header_with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.header(names::EVENT_NAME).filter(|name| !name.is_empty())
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.header(names::UNIQUE_ID).filter(|id| !id.is_empty())
    }

    pub fn job_uuid(&self) -> Option<&str> {
        self.header(names::JOB_UUID).filter(|id| !id.is_empty())
    }

    /// Channel variable lookup (`variable_<name>` header)
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&format!("variable_{}", name))
            .map(String::as_str)
    }

    /// Numeric channel variable; unparsable values read as absent
    pub fn variable_u64(&self, name: &str) -> Option<u64> {
        self.variable(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn variable_f64(&self, name: &str) -> Option<f64> {
        self.variable(name).and_then(|v| v.trim().parse().ok())
    }

    /// Parse a `text/event-plain` body
    pub fn parse_plain(text: &str) -> EslResult<Self> {
        let (block, rest) = match text.find("\n\n") {
            Some(pos) => (&text[..pos], Some(&text[pos + 2..])),
            None => (text, None),
        };

        let headers = parse_header_block(block, true);
        if headers.is_empty() {
            return Err(EslError::protocol("event without headers"));
        }

        let body = match (headers.get("Content-Length"), rest) {
            (Some(len), Some(rest)) => {
                let len: usize = len.trim().parse().map_err(|_| {
                    EslError::protocol(format!("invalid event Content-Length '{}'", len))
                })?;
                Some(rest.get(..len).unwrap_or(rest).to_string())
            }
            _ => None,
        };

        Ok(Self { headers, body })
    }

    /// Parse a `text/event-json` body
    pub fn parse_json(text: &str) -> EslResult<Self> {
        let map: HashMap<String, serde_json::Value> = serde_json::from_str(text)
            .map_err(|e| EslError::protocol(format!("invalid JSON event: {}", e)))?;

        let mut event = Self::new();
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            if name == "_body" {
                event.body = Some(value);
            } else {
                event.headers.insert(name, value);
            }
        }
        if event.headers.is_empty() {
            return Err(EslError::protocol("event without headers"));
        }
        Ok(event)
    }

    /// Extract the event carried by an event frame
    pub fn from_frame(frame: &EslFrame) -> EslResult<Self> {
        let body = frame
            .body()
            .ok_or_else(|| EslError::protocol("event frame without body"))?;
        match frame.content_type() {
            Some(ContentType::EventPlain) => Self::parse_plain(body),
            Some(ContentType::EventJson) => Self::parse_json(body),
            other => Err(EslError::protocol(format!(
                "frame is not an event: {}",
                other.map(|c| c.to_string()).unwrap_or_else(|| "no content type".into())
            ))),
        }
    }
}
