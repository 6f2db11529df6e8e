//! Conversion of raw upstream events into [`InteractionEvent`]s.

use crate::record::{EventKind, InteractionEvent, MediaKind};
use crate::update::{Message, RawEvent, User};
use chrono::{DateTime, Utc};
use tracing::trace;

/// Normalize a raw event received now.
///
/// Returns `None` for events that do not describe a user interaction: no
/// recognizable shape, no actor, or a chat service notification.
pub fn normalize<E: RawEvent + ?Sized>(event: &E) -> Option<InteractionEvent> {
    normalize_at(event, Utc::now())
}

/// Normalize a raw event with an explicit receive time
pub fn normalize_at<E: RawEvent + ?Sized>(
    event: &E,
    received_at: DateTime<Utc>,
) -> Option<InteractionEvent> {
    let Some(kind) = classify(event) else {
        trace!(event_id = event.event_id(), "unclassified event");
        return None;
    };

    let Some(actor) = sender(event) else {
        trace!(event_id = event.event_id(), kind = %kind, "event without actor");
        return None;
    };

    let message = attached_message(event);
    if message.is_some_and(Message::is_service) {
        trace!(event_id = event.event_id(), "service message");
        return None;
    }

    let mut normalized = InteractionEvent {
        timestamp: received_at,
        event_id: event.event_id(),
        kind,
        actor_id: actor.id,
        conversation_id: conversation_id(event, message),
        reference_id: String::new(),
        text: resolve_text(event),
        media: None,
        is_inline: false,
        is_forwarded: false,
        is_reply: false,
        was_edited: event.is_edit(),
        result_id: None,
    };

    if let Some(message) = message {
        normalized.reference_id = message.message_id.to_string();
        normalized.media = media_kind(message);
        normalized.is_forwarded = message.is_forwarded();
        normalized.is_reply = message.is_reply();
    }

    if let Some(callback) = event.callback() {
        normalized.is_inline = callback.is_inline();
        if normalized.is_inline {
            normalized.reference_id = callback.inline_message_id.clone().unwrap_or_default();
        }
    }

    if let Some(result) = event.inline_result() {
        normalized.is_inline = true;
        normalized.reference_id = result.inline_message_id.clone().unwrap_or_default();
        normalized.result_id = Some(result.result_id.clone());
    }

    Some(normalized)
}

/// Classify the event; the first matching shape wins.
pub fn classify<E: RawEvent + ?Sized>(event: &E) -> Option<EventKind> {
    // callback must be checked before message
    if event.callback().is_some() {
        Some(EventKind::Callback)
    } else if event.message().is_some() {
        Some(EventKind::Message)
    } else if event.inline_query().is_some() {
        Some(EventKind::InlineQuery)
    } else if event.inline_result().is_some() {
        Some(EventKind::InlineResult)
    } else if event.shipping_query().is_some() {
        Some(EventKind::ShippingQuery)
    } else if event.pre_checkout_query().is_some() {
        Some(EventKind::PreCheckoutQuery)
    } else if event.chat_member().is_some() {
        Some(EventKind::ChatMember)
    } else {
        None
    }
}

fn sender<E: RawEvent + ?Sized>(event: &E) -> Option<&User> {
    if let Some(callback) = event.callback() {
        return Some(&callback.from);
    }
    if let Some(query) = event.inline_query() {
        return Some(&query.from);
    }
    if let Some(result) = event.inline_result() {
        return Some(&result.from);
    }
    if let Some(query) = event.shipping_query() {
        return Some(&query.from);
    }
    if let Some(query) = event.pre_checkout_query() {
        return Some(&query.from);
    }
    if let Some(member) = event.chat_member() {
        return Some(&member.from);
    }
    event.message().and_then(|message| message.from.as_ref())
}

/// The event's own message, else the message a callback button belongs to
fn attached_message<E: RawEvent + ?Sized>(event: &E) -> Option<&Message> {
    event.message().or_else(|| {
        event
            .callback()
            .and_then(|callback| callback.message.as_deref())
    })
}

fn conversation_id<E: RawEvent + ?Sized>(event: &E, message: Option<&Message>) -> Option<i64> {
    message
        .and_then(|message| message.chat.as_ref())
        .or_else(|| event.chat_member().map(|member| &member.chat))
        .map(|chat| chat.id)
}

/// Resolve the text payload from exactly one source.
///
/// Precedence: own message text, own message caption, callback form,
/// then the query or invoice payload of the remaining shapes.
fn resolve_text<E: RawEvent + ?Sized>(event: &E) -> String {
    if let Some(message) = event.message() {
        let primary = message
            .text
            .as_deref()
            .filter(|text| !text.is_empty())
            .or_else(|| message.caption.as_deref().filter(|caption| !caption.is_empty()));
        if let Some(primary) = primary {
            return primary.to_string();
        }
    }

    if let Some(callback) = event.callback() {
        let (unique, payload) = (callback.unique(), callback.payload());
        return if payload.is_empty() {
            unique.to_string()
        } else {
            format!("{}|{}", unique, payload)
        };
    }

    if let Some(query) = event.inline_query() {
        return query.query.clone();
    }
    if let Some(result) = event.inline_result() {
        return result.query.clone();
    }
    if let Some(query) = event.shipping_query() {
        return query.invoice_payload.clone();
    }
    if let Some(query) = event.pre_checkout_query() {
        return query.invoice_payload.clone();
    }

    String::new()
}

/// First present attachment, in detection order
pub fn media_kind(message: &Message) -> Option<MediaKind> {
    let attachments = [
        (message.animation.is_some(), MediaKind::Animation),
        (message.audio.is_some(), MediaKind::Audio),
        (message.document.is_some(), MediaKind::Document),
        (message.photo.is_some(), MediaKind::Photo),
        (message.sticker.is_some(), MediaKind::Sticker),
        (message.video.is_some(), MediaKind::Video),
        (message.video_note.is_some(), MediaKind::VideoNote),
        (message.voice.is_some(), MediaKind::Voice),
        (message.contact.is_some(), MediaKind::Contact),
        (message.dice.is_some(), MediaKind::Dice),
        (message.poll.is_some(), MediaKind::Poll),
        (message.venue.is_some(), MediaKind::Venue),
        (message.location.is_some(), MediaKind::Location),
    ];

    attachments
        .into_iter()
        .find_map(|(present, kind)| present.then_some(kind))
}
