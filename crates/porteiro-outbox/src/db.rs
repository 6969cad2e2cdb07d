use rusqlite::Connection;

use crate::error::Result;

/// Initialise the outbox relation and its index.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// The primary key and the idempotency-key uniqueness are both load-bearing:
/// `INSERT OR IGNORE` against them is what makes `save` idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outbox_messages (
            conversation_id     TEXT    NOT NULL,
            turn_id             TEXT    NOT NULL,
            item_index          INTEGER NOT NULL,
            payload             TEXT    NOT NULL,
            status              TEXT    NOT NULL DEFAULT 'queued',
            idempotency_key     TEXT    NOT NULL,
            fail_reason         TEXT,
            created_at          TEXT    NOT NULL,
            sent_at             TEXT,
            provider_message_id TEXT,
            PRIMARY KEY (conversation_id, turn_id, item_index),
            UNIQUE (conversation_id, idempotency_key)
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_pending
            ON outbox_messages(conversation_id, turn_id, status);",
    )?;
    Ok(())
}
