//! Inbound payload normalization.
//!
//! The gateway delivers wildly heterogeneous JSON: Baileys-style envelopes
//! nested under `data.data.messages[0]`, flat Uazapi shapes with top-level
//! `phone`/`text`, and everything in between. This module reduces all of
//! them to a stable `(participant, kind, text)` triple. Known shapes are
//! matched first through typed structs; a recursive scan of the whole
//! payload exists only as a compatibility fallback for shapes we have not
//! catalogued yet.
//!
//! `normalize` is pure and total: any input yields `Message` or
//! `Unrecognized`, never a panic.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::types::Kind;

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Message(InboundMessage),
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub phone: String,
    pub kind: Kind,
    pub text: Option<String>,
    pub push_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Known wire shapes (priority order)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireRecord {
    key: WireKey,
    remote_jid: Option<String>,
    push_name: Option<String>,
    message: WireBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireKey {
    remote_jid: Option<String>,
    participant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireBody {
    conversation: Option<String>,
    extended_text_message: Option<WireText>,
    buttons_response_message: Option<WireButtonReply>,
    list_response_message: Option<WireListReply>,
    image_message: Option<Value>,
    video_message: Option<Value>,
    audio_message: Option<Value>,
    document_message: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireText {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WireButtonReply {
    selected_display_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireListReply {
    title: Option<String>,
}

const TEXT_PATHS: &[&str] = &[
    "data.text",
    "data.message",
    "data.body",
    "text",
    "message",
    "body",
    "content",
    "caption",
];

const TEXT_SCAN_KEYS: &[&str] = &["text", "message", "body", "content", "caption", "conversation"];

pub fn normalize(payload: &Value) -> Normalized {
    if !payload.is_object() {
        return Normalized::Unrecognized;
    }

    let record = locate_record(payload);
    let wire = record
        .and_then(|r| serde_json::from_value::<WireRecord>(r.clone()).ok())
        .unwrap_or_default();

    let Some(phone) = extract_phone(payload, &wire) else {
        return Normalized::Unrecognized;
    };

    let text = extract_text(payload, &wire);
    let kind = if text.is_some() {
        Kind::Text
    } else {
        classify_media(payload, &wire)
    };

    Normalized::Message(InboundMessage {
        phone,
        kind,
        text,
        push_name: wire
            .push_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
    })
}

/// Locate the message record inside the envelope. The gateway nests it under
/// `data.data.messages[0]` or `messages[0]` depending on the installation.
fn locate_record(payload: &Value) -> Option<&Value> {
    for path in ["data.data.messages.0", "messages.0"] {
        if let Some(v) = deep_get(payload, path) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    None
}

fn extract_phone(payload: &Value, wire: &WireRecord) -> Option<String> {
    // 1. Canonical JIDs, record first, then event level.
    let jid_candidates = [
        wire.key.remote_jid.as_deref(),
        wire.remote_jid.as_deref(),
        deep_str(payload, "chat.chatId"),
        deep_str(payload, "chat.remoteJid"),
        deep_str(payload, "key.remoteJid"),
    ];
    for candidate in jid_candidates.into_iter().flatten() {
        if let Some(phone) = phone_from_jid(candidate) {
            return Some(phone);
        }
    }

    // 2. Group chats carry the group JID in remoteJid; the actual sender is
    //    in participant/author.
    let is_group = [wire.key.remote_jid.as_deref(), wire.remote_jid.as_deref()]
        .into_iter()
        .flatten()
        .any(|jid| jid.contains("@g.us"));
    if is_group {
        let member_candidates = [
            wire.key.participant.as_deref(),
            deep_str(payload, "participant"),
            deep_str(payload, "author"),
        ];
        for candidate in member_candidates.into_iter().flatten() {
            if let Some(phone) = phone_from_jid(candidate) {
                return Some(phone);
            }
        }
    }

    // 3. Flat Uazapi shape: identifier at the top level.
    for key in ["chatId", "from", "phone", "number"] {
        let Some(raw) = payload.get(key).and_then(Value::as_str) else {
            continue;
        };
        if let Some(phone) = phone_from_jid(raw) {
            return Some(phone);
        }
        let digits = only_digits(raw);
        if digits.len() >= 10 {
            return Some(digits);
        }
    }

    // 4. chat.id only when it carries a JID suffix; bare alphanumeric chat
    //    ids are not phone numbers.
    if let Some(raw) = deep_str(payload, "chat.id") {
        if let Some(phone) = phone_from_jid(raw) {
            return Some(phone);
        }
    }

    // 5. Compatibility fallback: brute-force scan of the whole payload.
    scan_for_phone(payload)
}

/// Normalize a JID-ish string into a bare phone number.
///
/// Accepts `<digits>@s.whatsapp.net`, `<digits>@c.us`, or a bare string
/// with at least 10 digits. Group JIDs (`@g.us`) are rejected outright.
fn phone_from_jid(value: &str) -> Option<String> {
    let v = value.trim();
    if v.contains("@g.us") {
        return None;
    }
    if v.contains("@s.whatsapp.net") || v.contains("@c.us") {
        let prefix = v.split('@').next().unwrap_or_default();
        let digits = only_digits(prefix);
        return (digits.len() >= 10).then_some(digits);
    }
    let digits = only_digits(v);
    (digits.len() >= 10).then_some(digits)
}

fn only_digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\D)(\+?\d{10,15})(?:\D|$)").unwrap())
}

/// Last-resort scan: walk every string in the payload, preferring ones with
/// a recognizable chat suffix, falling back to the first 10-15 digit run.
fn scan_for_phone(payload: &Value) -> Option<String> {
    let mut plain: Option<String> = None;
    if let Some(jid) = walk_for_phone(payload, &mut plain) {
        return Some(jid);
    }
    plain
}

fn walk_for_phone(value: &Value, plain: &mut Option<String>) -> Option<String> {
    match value {
        Value::Object(map) => {
            for v in map.values() {
                if let Some(found) = walk_for_phone(v, plain) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => {
            for v in items {
                if let Some(found) = walk_for_phone(v, plain) {
                    return Some(found);
                }
            }
            None
        }
        Value::String(s) => {
            if s.contains("@s.whatsapp.net") || s.contains("@c.us") {
                let digits = only_digits(s.split('@').next().unwrap_or_default());
                if digits.len() >= 10 {
                    return Some(digits);
                }
            }
            if plain.is_none() {
                if let Some(caps) = phone_regex().captures(s) {
                    *plain = Some(only_digits(&caps[1]));
                }
            }
            None
        }
        _ => None,
    }
}

fn extract_text(payload: &Value, wire: &WireRecord) -> Option<String> {
    let typed = [
        wire.message.conversation.as_deref(),
        wire.message
            .extended_text_message
            .as_ref()
            .and_then(|m| m.text.as_deref()),
        wire.message
            .buttons_response_message
            .as_ref()
            .and_then(|m| m.selected_display_text.as_deref()),
        wire.message
            .list_response_message
            .as_ref()
            .and_then(|m| m.title.as_deref()),
    ];
    for candidate in typed.into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    for path in TEXT_PATHS {
        if let Some(text) = deep_str(payload, path) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    scan_for_text(payload)
}

/// Compatibility fallback: any non-empty string under an allow-listed key.
fn scan_for_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if let Value::String(s) = v {
                    let trimmed = s.trim();
                    if !trimmed.is_empty()
                        && TEXT_SCAN_KEYS.contains(&k.to_ascii_lowercase().as_str())
                    {
                        return Some(trimmed.to_string());
                    }
                }
                if let Some(found) = scan_for_text(v) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(scan_for_text),
        _ => None,
    }
}

fn classify_media(payload: &Value, wire: &WireRecord) -> Kind {
    if wire.message.image_message.is_some() || payload.get("image").is_some() {
        Kind::Image
    } else if wire.message.video_message.is_some() || payload.get("video").is_some() {
        Kind::Video
    } else if wire.message.audio_message.is_some() || payload.get("audio").is_some() {
        Kind::Audio
    } else if wire.message.document_message.is_some() || payload.get("document").is_some() {
        Kind::Document
    } else {
        Kind::Unknown
    }
}

fn deep_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in path.split('.') {
        match cur {
            Value::Object(map) => cur = map.get(part)?,
            Value::Array(items) => cur = items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(cur)
}

fn deep_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    deep_get(value, path).and_then(Value::as_str)
}
