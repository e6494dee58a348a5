//! Newline-delimited JSON wire protocol.
//!
//! Every frame is one JSON object on a single line with a string `type`
//! field. Clients send [`ClientRequest`] frames; the server answers with
//! [`ServerFrame`]s and pushes relayed messages and typing indicators the
//! same way.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CourierError;

/// Current Unix time in seconds, as carried in every server frame.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// The four request types the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Register,
    Login,
    Message,
    Typing,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Register => "register",
            RequestKind::Login => "login",
            RequestKind::Message => "message",
            RequestKind::Typing => "typing",
        }
    }
}

impl FromStr for RequestKind {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(RequestKind::Register),
            "login" => Ok(RequestKind::Login),
            "message" => Ok(RequestKind::Message),
            "typing" => Ok(RequestKind::Typing),
            other => Err(CourierError::Protocol(format!(
                "Unknown message type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A well-formed client request, as a client would put it on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Register {
        username: String,
        email: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    Message {
        to: String,
        content: String,
    },
    Typing {
        to: String,
        is_typing: bool,
    },
}

impl ClientRequest {
    /// Serialize to a single `\n`-terminated line.
    pub fn to_line(&self) -> Result<String, CourierError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Every frame the server writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    RegisterResponse(Response),
    LoginResponse(Response),
    MessageResponse(Response),
    Error(ErrorFrame),
    /// A direct message pushed to its recipient.
    Message(MessageRelay),
    /// A typing indicator pushed to its target.
    Typing(TypingRelay),
}

/// Body of every `*_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRelay {
    pub from: String,
    pub content: String,
    pub timestamp: i64,
    pub delivered: bool,
    /// Set when the message was queued while the recipient was offline.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stored: bool,
    /// RFC 3339 time the server first accepted a stored message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingRelay {
    pub from: String,
    pub is_typing: bool,
    pub timestamp: i64,
}

impl ServerFrame {
    /// The `*_response` frame answering `kind`.
    ///
    /// Typing requests are fire-and-forget and have no response type, so
    /// they map to `None`.
    pub fn response(kind: RequestKind, success: bool, message: impl Into<String>) -> Option<Self> {
        let body = Response {
            success,
            message: message.into(),
            timestamp: unix_now(),
        };
        match kind {
            RequestKind::Register => Some(ServerFrame::RegisterResponse(body)),
            RequestKind::Login => Some(ServerFrame::LoginResponse(body)),
            RequestKind::Message => Some(ServerFrame::MessageResponse(body)),
            RequestKind::Typing => None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error(ErrorFrame {
            message: message.into(),
            timestamp: unix_now(),
        })
    }

    /// A message relayed live to an online recipient.
    pub fn live_message(from: impl Into<String>, content: impl Into<String>) -> Self {
        ServerFrame::Message(MessageRelay {
            from: from.into(),
            content: content.into(),
            timestamp: unix_now(),
            delivered: true,
            stored: false,
            original_time: None,
        })
    }

    /// A queued message flushed to its recipient at login.
    pub fn stored_message(
        from: impl Into<String>,
        content: impl Into<String>,
        original_time: impl Into<String>,
    ) -> Self {
        ServerFrame::Message(MessageRelay {
            from: from.into(),
            content: content.into(),
            timestamp: unix_now(),
            delivered: true,
            stored: true,
            original_time: Some(original_time.into()),
        })
    }

    pub fn typing(from: impl Into<String>, is_typing: bool) -> Self {
        ServerFrame::Typing(TypingRelay {
            from: from.into(),
            is_typing,
            timestamp: unix_now(),
        })
    }

    /// Serialize to a single `\n`-terminated line.
    pub fn to_line(&self) -> Result<String, CourierError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (with or without its terminator).
    pub fn from_line(line: &str) -> Result<Self, CourierError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
