//! Raw bot updates as delivered by the upstream event source.
//!
//! The types mirror the Telegram Bot API update object closely enough to be
//! deserialized straight from webhook or `getUpdates` JSON. Attachments and
//! rarely used service fields are kept as opaque JSON values: the pipeline
//! only needs to know whether they are present.
//!
//! The normalizer never looks at [`Update`] directly. It works against the
//! [`RawEvent`] capability trait so other update representations can be fed
//! into the pipeline.

use serde::Deserialize;
use serde_json::Value;

/// Marker telebot-style frameworks put in front of structured callback data
const CALLBACK_MARKER: char = '\u{c}';

/// Capabilities the normalizer needs from an upstream event.
///
/// Each accessor exposes one possible shape of the event. A well-formed event
/// exposes exactly one of them, but the normalizer tolerates several and
/// resolves the ambiguity with a fixed priority order.
pub trait RawEvent {
    /// Upstream identifier of the event
    fn event_id(&self) -> u64;

    /// Inline keyboard button press
    fn callback(&self) -> Option<&CallbackQuery>;

    /// The event's own message: new, edited, or posted to a channel
    fn message(&self) -> Option<&Message>;

    /// Inline query typed by the user
    fn inline_query(&self) -> Option<&InlineQuery>;

    /// Inline result picked by the user
    fn inline_result(&self) -> Option<&ChosenInlineResult>;

    fn shipping_query(&self) -> Option<&ShippingQuery>;

    fn pre_checkout_query(&self) -> Option<&PreCheckoutQuery>;

    /// Membership change of a chat member (including the bot itself)
    fn chat_member(&self) -> Option<&ChatMemberUpdated>;

    /// Whether the event is an edit of an earlier message
    fn is_edit(&self) -> bool;
}

/// A single update from the bot API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Update {
    pub update_id: u64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub edited_message: Option<Message>,
    #[serde(default)]
    pub channel_post: Option<Message>,
    #[serde(default)]
    pub edited_channel_post: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub inline_query: Option<InlineQuery>,
    #[serde(default)]
    pub chosen_inline_result: Option<ChosenInlineResult>,
    #[serde(default)]
    pub shipping_query: Option<ShippingQuery>,
    #[serde(default)]
    pub pre_checkout_query: Option<PreCheckoutQuery>,
    #[serde(default)]
    pub chat_member: Option<ChatMemberUpdated>,
    #[serde(default)]
    pub my_chat_member: Option<ChatMemberUpdated>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A chat message, including the service-notification fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,

    // Forward markers (legacy fields and forward_origin)
    #[serde(default)]
    pub forward_origin: Option<Value>,
    #[serde(default)]
    pub forward_from: Option<User>,
    #[serde(default)]
    pub forward_from_chat: Option<Chat>,
    #[serde(default)]
    pub forward_date: Option<i64>,

    // Attachments
    #[serde(default)]
    pub animation: Option<Value>,
    #[serde(default)]
    pub audio: Option<Value>,
    #[serde(default)]
    pub document: Option<Value>,
    #[serde(default)]
    pub photo: Option<Value>,
    #[serde(default)]
    pub sticker: Option<Value>,
    #[serde(default)]
    pub video: Option<Value>,
    #[serde(default)]
    pub video_note: Option<Value>,
    #[serde(default)]
    pub voice: Option<Value>,
    #[serde(default)]
    pub contact: Option<Value>,
    #[serde(default)]
    pub dice: Option<Value>,
    #[serde(default)]
    pub poll: Option<Value>,
    #[serde(default)]
    pub venue: Option<Value>,
    #[serde(default)]
    pub location: Option<Value>,

    // Service notifications
    #[serde(default)]
    pub new_chat_members: Option<Vec<User>>,
    #[serde(default)]
    pub left_chat_member: Option<User>,
    #[serde(default)]
    pub new_chat_title: Option<String>,
    #[serde(default)]
    pub new_chat_photo: Option<Value>,
    #[serde(default)]
    pub delete_chat_photo: bool,
    #[serde(default)]
    pub group_chat_created: bool,
    #[serde(default)]
    pub supergroup_chat_created: bool,
    #[serde(default)]
    pub channel_chat_created: bool,
    #[serde(default)]
    pub migrate_to_chat_id: Option<i64>,
    #[serde(default)]
    pub migrate_from_chat_id: Option<i64>,
    #[serde(default)]
    pub pinned_message: Option<Value>,
    #[serde(default)]
    pub message_auto_delete_timer_changed: Option<Value>,
}

impl Message {
    /// Whether the message only announces a change in the chat
    pub fn is_service(&self) -> bool {
        self.new_chat_members.is_some()
            || self.left_chat_member.is_some()
            || self.new_chat_title.is_some()
            || self.new_chat_photo.is_some()
            || self.delete_chat_photo
            || self.group_chat_created
            || self.supergroup_chat_created
            || self.channel_chat_created
            || self.migrate_to_chat_id.is_some()
            || self.migrate_from_chat_id.is_some()
            || self.pinned_message.is_some()
            || self.message_auto_delete_timer_changed.is_some()
    }

    pub fn is_forwarded(&self) -> bool {
        self.forward_origin.is_some()
            || self.forward_from.is_some()
            || self.forward_from_chat.is_some()
            || self.forward_date.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to_message.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Box<Message>>,
    #[serde(default)]
    pub inline_message_id: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl CallbackQuery {
    /// Unique button identifier of structured callback data (`"\f<unique>|<data>"`)
    pub fn unique(&self) -> &str {
        self.split_data().0
    }

    /// Data payload, with the unique identifier stripped when present
    pub fn payload(&self) -> &str {
        self.split_data().1
    }

    /// Whether the callback came from a message sent in inline mode
    pub fn is_inline(&self) -> bool {
        self.message.is_none()
    }

    fn split_data(&self) -> (&str, &str) {
        let data = self.data.as_deref().unwrap_or_default();
        match data.strip_prefix(CALLBACK_MARKER) {
            Some(structured) => structured.split_once('|').unwrap_or((structured, "")),
            None => ("", data),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChosenInlineResult {
    pub result_id: String,
    pub from: User,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub inline_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShippingQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub invoice_payload: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreCheckoutQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub total_amount: i64,
    #[serde(default)]
    pub invoice_payload: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    #[serde(default)]
    pub date: i64,
}

impl RawEvent for Update {
    fn event_id(&self) -> u64 {
        self.update_id
    }

    fn callback(&self) -> Option<&CallbackQuery> {
        self.callback_query.as_ref()
    }

    fn message(&self) -> Option<&Message> {
        self.message
            .as_ref()
            .or(self.edited_message.as_ref())
            .or(self.channel_post.as_ref())
            .or(self.edited_channel_post.as_ref())
    }

    fn inline_query(&self) -> Option<&InlineQuery> {
        self.inline_query.as_ref()
    }

    fn inline_result(&self) -> Option<&ChosenInlineResult> {
        self.chosen_inline_result.as_ref()
    }

    fn shipping_query(&self) -> Option<&ShippingQuery> {
        self.shipping_query.as_ref()
    }

    fn pre_checkout_query(&self) -> Option<&PreCheckoutQuery> {
        self.pre_checkout_query.as_ref()
    }

    fn chat_member(&self) -> Option<&ChatMemberUpdated> {
        self.chat_member.as_ref().or(self.my_chat_member.as_ref())
    }

    fn is_edit(&self) -> bool {
        self.edited_message.is_some() || self.edited_channel_post.is_some()
    }
}
