use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `periodic_tasks` table and the single-row
/// `periodic_tasks_changed` marker table. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periodic_tasks (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL UNIQUE,
            task              TEXT    NOT NULL,
            args              TEXT    NOT NULL DEFAULT '[]',
            kwargs            TEXT    NOT NULL DEFAULT '{}',
            queue             TEXT,
            exchange          TEXT,
            routing_key       TEXT,
            priority          INTEGER,
            policy            TEXT    NOT NULL,   -- JSON-encoded Policy enum
            start_time        TEXT,               -- RFC 3339 or NULL
            expire_at         TEXT,
            expire_after_secs INTEGER,
            one_off           INTEGER NOT NULL DEFAULT 0,
            enabled           INTEGER NOT NULL DEFAULT 1,
            total_run_count   INTEGER NOT NULL DEFAULT 0,
            last_run_time     TEXT,
            description       TEXT,
            created_time      TEXT    NOT NULL,
            updated_time      TEXT    NOT NULL
        ) STRICT;

        -- load_enabled: SELECT … WHERE enabled = 1
        CREATE INDEX IF NOT EXISTS idx_periodic_tasks_enabled ON periodic_tasks (enabled);

        -- Polled every tick instead of the full table.
        CREATE TABLE IF NOT EXISTS periodic_tasks_changed (
            id          INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
            last_update TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name LIKE 'periodic_tasks%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
