use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

pub fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Direction> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Menu,
    HandoffOffer,
    NameRequest,
    Unknown,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Text => "text",
            Kind::Image => "image",
            Kind::Video => "video",
            Kind::Audio => "audio",
            Kind::Document => "document",
            Kind::Menu => "menu",
            Kind::HandoffOffer => "handoff_offer",
            Kind::NameRequest => "name_request",
            Kind::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Kind {
        match value {
            "text" => Kind::Text,
            "image" => Kind::Image,
            "video" => Kind::Video,
            "audio" => Kind::Audio,
            "document" => Kind::Document,
            "menu" => Kind::Menu,
            "handoff_offer" => Kind::HandoffOffer,
            "name_request" => Kind::NameRequest,
            _ => Kind::Unknown,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            Kind::Image | Kind::Video | Kind::Audio | Kind::Document
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub phone: String,
    pub display_name: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ConversationEvent {
    pub id: String,
    pub participant_id: String,
    pub direction: Direction,
    pub kind: Kind,
    pub body: Option<String>,
    pub media_ref: Option<String>,
    pub created_at: String,
}

/// Explicit funnel position, persisted per participant alongside the event
/// log. The enum plus the per-kind transition timestamps below replace the
/// old "scan the message history" inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelState {
    Idle,
    MenuOffered,
    VideoSent,
    HandoffOffered,
    AwaitingName,
}

impl FunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            FunnelState::Idle => "idle",
            FunnelState::MenuOffered => "menu_offered",
            FunnelState::VideoSent => "video_sent",
            FunnelState::HandoffOffered => "handoff_offered",
            FunnelState::AwaitingName => "awaiting_name",
        }
    }

    pub fn parse(value: &str) -> FunnelState {
        match value {
            "menu_offered" => FunnelState::MenuOffered,
            "video_sent" => FunnelState::VideoSent,
            "handoff_offered" => FunnelState::HandoffOffered,
            "awaiting_name" => FunnelState::AwaitingName,
            _ => FunnelState::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunnelSnapshot {
    pub participant_id: String,
    pub state: FunnelState,
    pub entered_at: DateTime<Utc>,
    pub name_attempts: u32,
    pub last_menu_at: Option<DateTime<Utc>>,
    pub last_video_at: Option<DateTime<Utc>>,
    pub last_handoff_offer_at: Option<DateTime<Utc>>,
    pub last_name_request_at: Option<DateTime<Utc>>,
}

impl FunnelSnapshot {
    pub fn new(participant_id: &str, now: DateTime<Utc>) -> FunnelSnapshot {
        FunnelSnapshot {
            participant_id: participant_id.to_string(),
            state: FunnelState::Idle,
            entered_at: now,
            name_attempts: 0,
            last_menu_at: None,
            last_video_at: None,
            last_handoff_offer_at: None,
            last_name_request_at: None,
        }
    }

    pub fn enter(&mut self, state: FunnelState, now: DateTime<Utc>) {
        self.state = state;
        self.entered_at = now;
        if state != FunnelState::AwaitingName {
            self.name_attempts = 0;
        }
    }

    pub fn mark_sent(&mut self, kind: Kind, now: DateTime<Utc>) {
        match kind {
            Kind::Menu => self.last_menu_at = Some(now),
            Kind::Video => self.last_video_at = Some(now),
            Kind::HandoffOffer => self.last_handoff_offer_at = Some(now),
            Kind::NameRequest => self.last_name_request_at = Some(now),
            _ => {}
        }
    }

    /// True strictly inside the window, false at or after expiry.
    pub fn was_recently_sent(&self, kind: Kind, window: Duration, now: DateTime<Utc>) -> bool {
        let sent_at = match kind {
            Kind::Menu => self.last_menu_at,
            Kind::Video => self.last_video_at,
            Kind::HandoffOffer => self.last_handoff_offer_at,
            Kind::NameRequest => self.last_name_request_at,
            _ => None,
        };
        match sent_at {
            Some(ts) => now.signed_duration_since(ts) < window,
            None => false,
        }
    }

    /// Whether the current state was entered recently enough to still steer
    /// the conversation. A stale step falls through to the AI path.
    pub fn state_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.entered_at) < window
    }
}
