//! Bus event types — messages flowing between channels and the agent loop.
//!
//! Replaces nanobot's `bus/events.py` `InboundMessage` / `OutboundMessage` dataclasses.

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// An inbound message from a channel to the agent.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "discord", "cli").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Text content of the message.
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media (photos, voice, documents).
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (e.g. message_id, username).
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Session key combining channel and chat_id (e.g. "telegram:123456").
    ///
    /// Used as the key for session persistence and history lookup.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// An outbound message from the agent to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
    /// True when this is a background task completion rather than a direct
    /// reply — channels may use this to suppress a "typing" indicator or add
    /// a distinguishing prefix.
    pub is_background: bool,
    /// Attached media to send.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata.
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            is_background: false,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Create a background (task-completion) outbound message.
    pub fn background(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(channel, chat_id, content);
        msg.is_background = true;
        msg
    }
}

/// A progress line published while a turn is in flight.
///
/// `line` is either one of the two sentinel strings that bracket a turn's
/// status stream, or a human-readable intro/progress line emitted in between.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Identifies the in-flight request this line belongs to (so a channel
    /// can route interleaved status streams from different turns).
    pub status_key: String,
    /// Sentinel or human-readable progress line.
    pub line: String,
}

/// Marks the start of a turn's status stream.
pub const STATUS_START: &str = "__KYBER_STATUS_START__";
/// Marks the end of a turn's status stream.
pub const STATUS_END: &str = "__KYBER_STATUS_END__";

impl StatusUpdate {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        status_key: impl Into<String>,
        line: impl Into<String>,
    ) -> Self {
        StatusUpdate {
            channel: channel.into(),
            chat_id: chat_id.into(),
            status_key: status_key.into(),
            line: line.into(),
        }
    }

    pub fn start(channel: impl Into<String>, chat_id: impl Into<String>, status_key: impl Into<String>) -> Self {
        Self::new(channel, chat_id, status_key, STATUS_START)
    }

    pub fn end(channel: impl Into<String>, chat_id: impl Into<String>, status_key: impl Into<String>) -> Self {
        Self::new(channel, chat_id, status_key, STATUS_END)
    }
}


