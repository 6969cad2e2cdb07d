//! Durable ordered queue of planned outbound messages.
//!
//! The repository is the only handoff between planning and delivery; the
//! core never emits a message that did not pass through here. Wraps a
//! single SQLite connection in a `Mutex`; planner and delivery worker may
//! live in different processes, in which case each opens its own
//! connection against the same database file.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, error, warn};

use porteiro_core::events::{self, Event, EventSink};
use porteiro_core::types::{ConversationId, PlannedMessage, TurnId};

use crate::db::init_db;
use crate::error::Result;
use crate::types::{OutboxItem, OutboxStats, OutboxStatus};

pub struct OutboxRepository {
    db: Mutex<Connection>,
    sink: Arc<dyn EventSink>,
}

impl OutboxRepository {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection, sink: Arc<dyn EventSink>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            sink,
        })
    }

    /// Persist a turn's planned messages with initial status `queued`.
    ///
    /// Idempotent: rows that already exist (same primary key, or same
    /// idempotency key within the conversation) are kept untouched, so
    /// `save(items); save(items)` is indistinguishable from one call.
    /// Returns the number of rows actually inserted.
    pub fn save(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        items: &[PlannedMessage],
    ) -> Result<usize> {
        if items.is_empty() {
            warn!(conversation_id = %conversation_id, turn_id = %turn_id, "empty outbox save");
            return Ok(0);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let mut inserted = 0;
        for (idx, item) in items.iter().enumerate() {
            if item.idempotency_key.is_empty() {
                error!(
                    conversation_id = %conversation_id,
                    turn_id = %turn_id,
                    item_index = idx,
                    "planned message without idempotency key, skipped"
                );
                continue;
            }
            let payload = serde_json::to_string(&item.payload)?;
            inserted += db.execute(
                "INSERT OR IGNORE INTO outbox_messages
                 (conversation_id, turn_id, item_index, payload, status,
                  idempotency_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6)",
                rusqlite::params![
                    conversation_id.as_str(),
                    turn_id.as_str(),
                    idx as i64,
                    payload,
                    item.idempotency_key,
                    now
                ],
            )?;
        }

        self.sink.emit(
            &Event::new(events::OUTBOX, "persisted")
                .field("conversation_id", conversation_id)
                .field("turn_id", turn_id)
                .field("count", inserted),
        );
        Ok(inserted)
    }

    /// Load the turn's undelivered items (`queued` or `failed`) in
    /// `item_index` order. Emits `rehydrate_hit` / `rehydrate_miss`.
    pub fn load_pending(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> Result<Vec<OutboxItem>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT conversation_id, turn_id, item_index, payload, status,
                    idempotency_key, fail_reason, created_at, sent_at, provider_message_id
             FROM outbox_messages
             WHERE conversation_id = ?1 AND turn_id = ?2
               AND status IN ('queued', 'failed')
             ORDER BY item_index ASC",
        )?;
        let items: Vec<OutboxItem> = stmt
            .query_map(
                rusqlite::params![conversation_id.as_str(), turn_id.as_str()],
                row_to_item,
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        if items.is_empty() {
            self.sink.emit(
                &Event::new(events::OUTBOX, "rehydrate_miss")
                    .field("conversation_id", conversation_id)
                    .field("turn_id", turn_id),
            );
        } else {
            self.sink.emit(
                &Event::new(events::OUTBOX, "rehydrate_hit")
                    .field("conversation_id", conversation_id)
                    .field("turn_id", turn_id)
                    .field("count", items.len()),
            );
        }
        Ok(items)
    }

    /// Conditionally flip a `queued` row to `sent`, recording the provider's
    /// message id. A no-op (returning `false`) for any other status —
    /// concurrent deliveries serialize here and exactly one wins, and a
    /// `failed` row can only become sendable again through
    /// [`retry_failed`](Self::retry_failed).
    pub fn mark_sent(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        item_index: u32,
        provider_message_id: &str,
    ) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE outbox_messages
             SET status = 'sent', sent_at = ?1, provider_message_id = ?2
             WHERE conversation_id = ?3 AND turn_id = ?4 AND item_index = ?5
               AND status = 'queued'",
            rusqlite::params![
                now,
                provider_message_id,
                conversation_id.as_str(),
                turn_id.as_str(),
                item_index as i64
            ],
        )?;
        drop(db);

        if updated > 0 {
            self.sink.emit(
                &Event::new(events::OUTBOX, "mark_sent")
                    .field("conversation_id", conversation_id)
                    .field("turn_id", turn_id)
                    .field("item_index", item_index)
                    .field("provider_message_id", provider_message_id),
            );
        } else {
            debug!(
                conversation_id = %conversation_id,
                turn_id = %turn_id,
                item_index,
                "mark_sent no-op, row not queued"
            );
        }
        Ok(updated > 0)
    }

    /// Flip a `queued` row to `failed` with a reason. Failed rows re-enter
    /// `queued` only through [`retry_failed`](Self::retry_failed).
    pub fn mark_failed(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        item_index: u32,
        reason: &str,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE outbox_messages
             SET status = 'failed', fail_reason = ?1
             WHERE conversation_id = ?2 AND turn_id = ?3 AND item_index = ?4
               AND status = 'queued'",
            rusqlite::params![
                reason,
                conversation_id.as_str(),
                turn_id.as_str(),
                item_index as i64
            ],
        )?;
        drop(db);

        if updated > 0 {
            self.sink.emit(
                &Event::new(events::OUTBOX, "mark_failed")
                    .field("conversation_id", conversation_id)
                    .field("turn_id", turn_id)
                    .field("item_index", item_index)
                    .field("reason", reason),
            );
        }
        Ok(updated > 0)
    }

    /// Explicit operator action: re-queue a turn's `failed` rows.
    /// Returns the number of rows re-queued.
    pub fn retry_failed(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE outbox_messages
             SET status = 'queued', fail_reason = NULL
             WHERE conversation_id = ?1 AND turn_id = ?2 AND status = 'failed'",
            rusqlite::params![conversation_id.as_str(), turn_id.as_str()],
        )?;
        Ok(updated)
    }

    /// Explicit operator action: abandon a turn's `failed` rows. Discarded
    /// rows never deliver and are only removed by `purge_older_than`.
    pub fn discard_failed(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
    ) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let updated = db.execute(
            "UPDATE outbox_messages
             SET status = 'discarded'
             WHERE conversation_id = ?1 AND turn_id = ?2 AND status = 'failed'",
            rusqlite::params![conversation_id.as_str(), turn_id.as_str()],
        )?;
        Ok(updated)
    }

    /// One row by its full key, regardless of status.
    pub fn item(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        item_index: u32,
    ) -> Result<Option<OutboxItem>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT conversation_id, turn_id, item_index, payload, status,
                    idempotency_key, fail_reason, created_at, sent_at, provider_message_id
             FROM outbox_messages
             WHERE conversation_id = ?1 AND turn_id = ?2 AND item_index = ?3",
            rusqlite::params![
                conversation_id.as_str(),
                turn_id.as_str(),
                item_index as i64
            ],
            row_to_item,
        ) {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Per-status counts for a conversation, optionally scoped to one turn.
    pub fn stats(
        &self,
        conversation_id: &ConversationId,
        turn_id: Option<&TurnId>,
    ) -> Result<OutboxStats> {
        let db = self.db.lock().unwrap();
        let mut stats = OutboxStats::default();
        let collect = |rows: &mut dyn Iterator<Item = rusqlite::Result<(String, i64)>>,
                       stats: &mut OutboxStats| {
            for row in rows.flatten() {
                let (status, count) = row;
                match OutboxStatus::from_str(&status) {
                    Ok(OutboxStatus::Queued) => stats.queued = count as u64,
                    Ok(OutboxStatus::Sent) => stats.sent = count as u64,
                    Ok(OutboxStatus::Failed) => stats.failed = count as u64,
                    Ok(OutboxStatus::Discarded) => stats.discarded = count as u64,
                    Err(_) => {}
                }
            }
        };

        match turn_id {
            Some(turn_id) => {
                let mut stmt = db.prepare(
                    "SELECT status, COUNT(*) FROM outbox_messages
                     WHERE conversation_id = ?1 AND turn_id = ?2
                     GROUP BY status",
                )?;
                let mut rows = stmt.query_map(
                    rusqlite::params![conversation_id.as_str(), turn_id.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )?;
                collect(&mut rows, &mut stats);
            }
            None => {
                let mut stmt = db.prepare(
                    "SELECT status, COUNT(*) FROM outbox_messages
                     WHERE conversation_id = ?1
                     GROUP BY status",
                )?;
                let mut rows =
                    stmt.query_map(rusqlite::params![conversation_id.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?;
                collect(&mut rows, &mut stats);
            }
        }
        Ok(stats)
    }

    /// Delete terminal rows (`sent`, `failed`, `discarded`) older than
    /// `days`. Returns the number of rows removed.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let deleted = db.execute(
            "DELETE FROM outbox_messages
             WHERE created_at < ?1 AND status IN ('sent', 'failed', 'discarded')",
            rusqlite::params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Trivial query proving the store is reachable; used by the health and
    /// readiness probes.
    pub fn probe(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Map a SQLite row to an `OutboxItem`. Rows with an undecodable payload or
/// status fail the map and are dropped by the caller's `filter_map`; the
/// planner never produces them, so this only fires on external tampering.
fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxItem> {
    let payload_json: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_str: String = row.get(4)?;
    let status = OutboxStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })?;

    Ok(OutboxItem {
        conversation_id: row.get(0)?,
        turn_id: row.get(1)?,
        item_index: row.get::<_, i64>(2)? as u32,
        payload,
        status,
        idempotency_key: row.get(5)?,
        fail_reason: row.get(6)?,
        created_at: row.get(7)?,
        sent_at: row.get(8)?,
        provider_message_id: row.get(9)?,
    })
}
