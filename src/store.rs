use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{
    now_iso, parse_iso, ConversationEvent, Direction, FunnelSnapshot, FunnelState, Kind,
    Participant,
};

/// Persistence seam for participants, the append-only event log and the
/// funnel-state row. The production implementation is Postgres; tests use
/// the in-memory double below.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_or_create_participant(
        &self,
        phone: &str,
        push_name: Option<&str>,
    ) -> Result<Participant, String>;

    async fn set_display_name(&self, participant_id: &str, name: &str) -> Result<(), String>;

    async fn set_thread_id(&self, participant_id: &str, thread_id: &str) -> Result<(), String>;

    async fn append_event(
        &self,
        participant_id: &str,
        direction: Direction,
        kind: Kind,
        body: Option<&str>,
        media_ref: Option<&str>,
    ) -> Result<(), String>;

    /// Most recent events first, optionally filtered by direction and kind.
    async fn recent_events(
        &self,
        participant_id: &str,
        direction: Option<Direction>,
        kind: Option<Kind>,
        limit: i64,
    ) -> Result<Vec<ConversationEvent>, String>;

    async fn funnel_snapshot(&self, participant_id: &str) -> Result<FunnelSnapshot, String>;

    async fn save_funnel_snapshot(&self, snapshot: &FunnelSnapshot) -> Result<(), String>;
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> PgStore {
        PgStore { db }
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> ConversationEvent {
    ConversationEvent {
        id: row.get("id"),
        participant_id: row.get("participant_id"),
        direction: Direction::parse(&row.get::<String, _>("direction"))
            .unwrap_or(Direction::Inbound),
        kind: Kind::parse(&row.get::<String, _>("kind")),
        body: row.get("body"),
        media_ref: row.get("media_ref"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_or_create_participant(
        &self,
        phone: &str,
        push_name: Option<&str>,
    ) -> Result<Participant, String> {
        let existing = sqlx::query(
            "SELECT id, phone, display_name, thread_id, created_at FROM participants WHERE phone = $1",
        )
        .bind(phone)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| format!("participant lookup failed: {err}"))?;

        if let Some(row) = existing {
            let participant = Participant {
                id: row.get("id"),
                phone: row.get("phone"),
                display_name: row.get("display_name"),
                thread_id: row.get("thread_id"),
                created_at: row.get("created_at"),
            };
            // Best-effort profile-name backfill; an explicit name set by the
            // funnel always wins.
            if participant.display_name.is_none() {
                if let Some(name) = push_name.map(str::trim).filter(|n| !n.is_empty()) {
                    let _ = sqlx::query(
                        "UPDATE participants SET display_name = $1 WHERE id = $2 AND display_name IS NULL",
                    )
                    .bind(name)
                    .bind(&participant.id)
                    .execute(&self.db)
                    .await;
                    return Ok(Participant {
                        display_name: Some(name.to_string()),
                        ..participant
                    });
                }
            }
            return Ok(participant);
        }

        let participant = Participant {
            id: Uuid::new_v4().to_string(),
            phone: phone.to_string(),
            display_name: push_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            thread_id: None,
            created_at: now_iso(),
        };
        sqlx::query(
            "INSERT INTO participants (id, phone, display_name, thread_id, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (phone) DO NOTHING",
        )
        .bind(&participant.id)
        .bind(&participant.phone)
        .bind(&participant.display_name)
        .bind(&participant.thread_id)
        .bind(&participant.created_at)
        .execute(&self.db)
        .await
        .map_err(|err| format!("participant insert failed: {err}"))?;
        Ok(participant)
    }

    async fn set_display_name(&self, participant_id: &str, name: &str) -> Result<(), String> {
        sqlx::query("UPDATE participants SET display_name = $1 WHERE id = $2")
            .bind(name)
            .bind(participant_id)
            .execute(&self.db)
            .await
            .map_err(|err| format!("display name update failed: {err}"))?;
        Ok(())
    }

    async fn set_thread_id(&self, participant_id: &str, thread_id: &str) -> Result<(), String> {
        sqlx::query("UPDATE participants SET thread_id = $1 WHERE id = $2")
            .bind(thread_id)
            .bind(participant_id)
            .execute(&self.db)
            .await
            .map_err(|err| format!("thread id update failed: {err}"))?;
        Ok(())
    }

    async fn append_event(
        &self,
        participant_id: &str,
        direction: Direction,
        kind: Kind,
        body: Option<&str>,
        media_ref: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO conversation_events (id, participant_id, direction, kind, body, media_ref, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(participant_id)
        .bind(direction.as_str())
        .bind(kind.as_str())
        .bind(body)
        .bind(media_ref)
        .bind(now_iso())
        .execute(&self.db)
        .await
        .map_err(|err| format!("event append failed: {err}"))?;
        Ok(())
    }

    async fn recent_events(
        &self,
        participant_id: &str,
        direction: Option<Direction>,
        kind: Option<Kind>,
        limit: i64,
    ) -> Result<Vec<ConversationEvent>, String> {
        let rows = match (direction, kind) {
            (Some(direction), Some(kind)) => {
                sqlx::query(
                    "SELECT id, participant_id, direction, kind, body, media_ref, created_at \
                     FROM conversation_events \
                     WHERE participant_id = $1 AND direction = $2 AND kind = $3 \
                     ORDER BY created_at DESC LIMIT $4",
                )
                .bind(participant_id)
                .bind(direction.as_str())
                .bind(kind.as_str())
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
            (Some(direction), None) => {
                sqlx::query(
                    "SELECT id, participant_id, direction, kind, body, media_ref, created_at \
                     FROM conversation_events \
                     WHERE participant_id = $1 AND direction = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(participant_id)
                .bind(direction.as_str())
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
            (None, Some(kind)) => {
                sqlx::query(
                    "SELECT id, participant_id, direction, kind, body, media_ref, created_at \
                     FROM conversation_events \
                     WHERE participant_id = $1 AND kind = $2 \
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(participant_id)
                .bind(kind.as_str())
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
            (None, None) => {
                sqlx::query(
                    "SELECT id, participant_id, direction, kind, body, media_ref, created_at \
                     FROM conversation_events \
                     WHERE participant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(participant_id)
                .bind(limit)
                .fetch_all(&self.db)
                .await
            }
        }
        .map_err(|err| format!("event query failed: {err}"))?;

        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn funnel_snapshot(&self, participant_id: &str) -> Result<FunnelSnapshot, String> {
        let row = sqlx::query(
            "SELECT state, entered_at, name_attempts, last_menu_at, last_video_at, \
                    last_handoff_offer_at, last_name_request_at \
             FROM funnel_states WHERE participant_id = $1",
        )
        .bind(participant_id)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| format!("funnel state lookup failed: {err}"))?;

        let Some(row) = row else {
            return Ok(FunnelSnapshot::new(participant_id, Utc::now()));
        };

        let opt_ts = |column: &str| -> Option<chrono::DateTime<Utc>> {
            row.get::<Option<String>, _>(column)
                .as_deref()
                .and_then(parse_iso)
        };

        Ok(FunnelSnapshot {
            participant_id: participant_id.to_string(),
            state: FunnelState::parse(&row.get::<String, _>("state")),
            entered_at: parse_iso(&row.get::<String, _>("entered_at")).unwrap_or_else(Utc::now),
            name_attempts: row.get::<i32, _>("name_attempts").max(0) as u32,
            last_menu_at: opt_ts("last_menu_at"),
            last_video_at: opt_ts("last_video_at"),
            last_handoff_offer_at: opt_ts("last_handoff_offer_at"),
            last_name_request_at: opt_ts("last_name_request_at"),
        })
    }

    async fn save_funnel_snapshot(&self, snapshot: &FunnelSnapshot) -> Result<(), String> {
        let iso = |ts: &Option<chrono::DateTime<Utc>>| ts.map(|t| t.to_rfc3339());
        sqlx::query(
            "INSERT INTO funnel_states \
                 (participant_id, state, entered_at, name_attempts, last_menu_at, \
                  last_video_at, last_handoff_offer_at, last_name_request_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (participant_id) DO UPDATE SET \
                 state = EXCLUDED.state, \
                 entered_at = EXCLUDED.entered_at, \
                 name_attempts = EXCLUDED.name_attempts, \
                 last_menu_at = EXCLUDED.last_menu_at, \
                 last_video_at = EXCLUDED.last_video_at, \
                 last_handoff_offer_at = EXCLUDED.last_handoff_offer_at, \
                 last_name_request_at = EXCLUDED.last_name_request_at",
        )
        .bind(&snapshot.participant_id)
        .bind(snapshot.state.as_str())
        .bind(snapshot.entered_at.to_rfc3339())
        .bind(snapshot.name_attempts as i32)
        .bind(iso(&snapshot.last_menu_at))
        .bind(iso(&snapshot.last_video_at))
        .bind(iso(&snapshot.last_handoff_offer_at))
        .bind(iso(&snapshot.last_name_request_at))
        .execute(&self.db)
        .await
        .map_err(|err| format!("funnel state save failed: {err}"))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory `Store` double used across the test suites.
    #[derive(Default)]
    pub struct MemStore {
        pub participants: Mutex<Vec<Participant>>,
        pub events: Mutex<Vec<ConversationEvent>>,
        pub snapshots: Mutex<HashMap<String, FunnelSnapshot>>,
    }

    impl MemStore {
        pub fn new() -> MemStore {
            MemStore::default()
        }

        pub fn outbound_kinds(&self) -> Vec<Kind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.direction == Direction::Outbound)
                .map(|e| e.kind)
                .collect()
        }
    }

    #[async_trait]
    impl Store for MemStore {
        async fn find_or_create_participant(
            &self,
            phone: &str,
            push_name: Option<&str>,
        ) -> Result<Participant, String> {
            let mut participants = self.participants.lock().unwrap();
            if let Some(existing) = participants.iter().find(|p| p.phone == phone) {
                return Ok(existing.clone());
            }
            let participant = Participant {
                id: Uuid::new_v4().to_string(),
                phone: phone.to_string(),
                display_name: push_name.map(str::to_string),
                thread_id: None,
                created_at: now_iso(),
            };
            participants.push(participant.clone());
            Ok(participant)
        }

        async fn set_display_name(&self, participant_id: &str, name: &str) -> Result<(), String> {
            let mut participants = self.participants.lock().unwrap();
            if let Some(p) = participants.iter_mut().find(|p| p.id == participant_id) {
                p.display_name = Some(name.to_string());
            }
            Ok(())
        }

        async fn set_thread_id(&self, participant_id: &str, thread_id: &str) -> Result<(), String> {
            let mut participants = self.participants.lock().unwrap();
            if let Some(p) = participants.iter_mut().find(|p| p.id == participant_id) {
                p.thread_id = Some(thread_id.to_string());
            }
            Ok(())
        }

        async fn append_event(
            &self,
            participant_id: &str,
            direction: Direction,
            kind: Kind,
            body: Option<&str>,
            media_ref: Option<&str>,
        ) -> Result<(), String> {
            self.events.lock().unwrap().push(ConversationEvent {
                id: Uuid::new_v4().to_string(),
                participant_id: participant_id.to_string(),
                direction,
                kind,
                body: body.map(str::to_string),
                media_ref: media_ref.map(str::to_string),
                created_at: now_iso(),
            });
            Ok(())
        }

        async fn recent_events(
            &self,
            participant_id: &str,
            direction: Option<Direction>,
            kind: Option<Kind>,
            limit: i64,
        ) -> Result<Vec<ConversationEvent>, String> {
            let events = self.events.lock().unwrap();
            Ok(events
                .iter()
                .rev()
                .filter(|e| e.participant_id == participant_id)
                .filter(|e| direction.map_or(true, |d| e.direction == d))
                .filter(|e| kind.map_or(true, |k| e.kind == k))
                .take(limit.max(0) as usize)
                .cloned()
                .collect())
        }

        async fn funnel_snapshot(&self, participant_id: &str) -> Result<FunnelSnapshot, String> {
            let snapshots = self.snapshots.lock().unwrap();
            Ok(snapshots
                .get(participant_id)
                .cloned()
                .unwrap_or_else(|| FunnelSnapshot::new(participant_id, Utc::now())))
        }

        async fn save_funnel_snapshot(&self, snapshot: &FunnelSnapshot) -> Result<(), String> {
            self.snapshots
                .lock()
                .unwrap()
                .insert(snapshot.participant_id.clone(), snapshot.clone());
            Ok(())
        }
    }
}
