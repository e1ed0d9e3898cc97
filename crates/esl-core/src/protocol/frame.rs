//! Outer protocol frames

use std::collections::HashMap;
use std::fmt;

/// Content type of a frame received from the switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// Sent once after connect, asks for `auth <password>`
    AuthRequest,
    /// Reply to `auth`, `event`, `bgapi` and other socket commands
    CommandReply,
    /// Reply to `api`, carries the command output as body
    ApiResponse,
    /// Plain text event
    EventPlain,
    /// JSON encoded event
    EventJson,
    /// Switch is about to close the socket
    DisconnectNotice,
    /// Connection refused by the switch ACL
    RudeRejection,
    /// Anything else
    Other(String),
}

impl ContentType {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "auth/request" => ContentType::AuthRequest,
            "command/reply" => ContentType::CommandReply,
            "api/response" => ContentType::ApiResponse,
            "text/event-plain" => ContentType::EventPlain,
            "text/event-json" => ContentType::EventJson,
            "text/disconnect-notice" => ContentType::DisconnectNotice,
            "text/rude-rejection" => ContentType::RudeRejection,
            other => ContentType::Other(other.to_string()),
        }
    }

    /// Frames that complete a pending synchronous command
    pub fn is_reply(&self) -> bool {
        matches!(self, ContentType::CommandReply | ContentType::ApiResponse)
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ContentType::EventPlain | ContentType::EventJson)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentType::AuthRequest => "auth/request",
            ContentType::CommandReply => "command/reply",
            ContentType::ApiResponse => "api/response",
            ContentType::EventPlain => "text/event-plain",
            ContentType::EventJson => "text/event-json",
            ContentType::DisconnectNotice => "text/disconnect-notice",
            ContentType::RudeRejection => "text/rude-rejection",
            ContentType::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// One message read off the socket: outer headers plus optional body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EslFrame {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslFrame {
    pub fn new(headers: HashMap<String, String>, body: Option<String>) -> Self {
        Self { headers, body }
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

    /// `None` when the frame carries no `Content-Type` header
    pub fn content_type(&self) -> Option<ContentType> {
        self.header("Content-Type").map(ContentType::parse)
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header("Reply-Text")
    }

    /// Job id returned by the switch in a `bgapi` reply
    pub fn job_uuid(&self) -> Option<&str> {
        self.header("Job-UUID").or_else(|| {
            self.reply_text()
                .and_then(|text| text.strip_prefix("+OK Job-UUID:"))
                .map(str::trim)
        })
    }

    /// `true` when a command reply starts with `+OK`
    pub fn is_ok_reply(&self) -> bool {
        self.reply_text().map_or(false, |text| text.starts_with("+OK"))
    }
}
