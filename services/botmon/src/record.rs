//! Canonical records flowing through the pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Classification of an interaction event.
///
/// Variants are listed in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Callback,
    Message,
    InlineQuery,
    InlineResult,
    ShippingQuery,
    PreCheckoutQuery,
    ChatMember,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Callback => "callback",
            EventKind::Message => "message",
            EventKind::InlineQuery => "inline_query",
            EventKind::InlineResult => "inline_result",
            EventKind::ShippingQuery => "shipping_query",
            EventKind::PreCheckoutQuery => "pre_checkout_query",
            EventKind::ChatMember => "chat_member",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachment carried by a message.
///
/// Variants are listed in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Animation,
    Audio,
    Document,
    Photo,
    Sticker,
    Video,
    VideoNote,
    Voice,
    Contact,
    Dice,
    Poll,
    Venue,
    Location,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Animation => "animation",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Photo => "photo",
            MediaKind::Sticker => "sticker",
            MediaKind::Video => "video",
            MediaKind::VideoNote => "video_note",
            MediaKind::Voice => "voice",
            MediaKind::Contact => "contact",
            MediaKind::Dice => "dice",
            MediaKind::Poll => "poll",
            MediaKind::Venue => "venue",
            MediaKind::Location => "location",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log entry severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// One normalized occurrence from the upstream event source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionEvent {
    /// When the event was received
    pub timestamp: DateTime<Utc>,
    /// Upstream event identifier
    pub event_id: u64,
    pub kind: EventKind,
    /// User who caused the event
    pub actor_id: i64,
    /// Conversation the event belongs to, if any
    pub conversation_id: Option<i64>,
    /// Message (or inline message) the event relates to
    pub reference_id: String,
    /// Textual payload
    pub text: String,
    pub media: Option<MediaKind>,
    pub is_inline: bool,
    pub is_forwarded: bool,
    pub is_reply: bool,
    pub was_edited: bool,
    /// Chosen inline result, `inline_result` events only
    pub result_id: Option<String>,
}

/// One structured diagnostic record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Event the entry relates to, 0 when unrelated
    pub related_event_id: u64,
    pub severity: Severity,
    pub message: String,
    /// JSON-encoded structured payload
    pub payload: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    ///
    /// A payload that cannot be serialized is recorded as absent.
    pub fn new(
        related_event_id: u64,
        severity: Severity,
        message: impl Into<String>,
        payload: Option<&serde_json::Value>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            related_event_id,
            severity,
            message: message.into(),
            payload: payload.and_then(|value| serde_json::to_string(value).ok()),
        }
    }
}

/// A canonical record of either kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Interaction(InteractionEvent),
    Log(LogEntry),
}

impl Record {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Interaction(event) => event.timestamp,
            Record::Log(entry) => entry.timestamp,
        }
    }

    /// Calendar date used for storage partitioning
    pub fn date_bucket(&self) -> NaiveDate {
        self.timestamp().date_naive()
    }
}

impl From<InteractionEvent> for Record {
    fn from(event: InteractionEvent) -> Self {
        Record::Interaction(event)
    }
}

impl From<LogEntry> for Record {
    fn from(entry: LogEntry) -> Self {
        Record::Log(entry)
    }
}
