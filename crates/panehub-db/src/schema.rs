use rusqlite::Connection;

/// Current schema version. Bump this when adding migrations.
pub const CURRENT_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS session_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            closed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_session_history_open
            ON session_history(session_id, closed_at);

        CREATE TABLE IF NOT EXISTS pane_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pane_id INTEGER NOT NULL,
            session_id INTEGER NOT NULL,
            pane_type TEXT NOT NULL,
            title TEXT NOT NULL,
            shell TEXT,
            args TEXT NOT NULL DEFAULT '[]',
            cwd TEXT,
            created_at TEXT NOT NULL,
            closed_at TEXT,
            exit_code INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_pane_history_session
            ON pane_history(session_id, pane_id);
        ",
    )?;

    migrate(conn)?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let version = current_version(conn)?;

    if version < 1 {
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            [1_i64],
        )?;
    }

    if version < 2 {
        // v2: panes record whether their process was force-closed.
        let has_killed = conn
            .prepare("SELECT killed FROM pane_history LIMIT 0")
            .is_ok();

        if !has_killed {
            conn.execute_batch(
                "ALTER TABLE pane_history ADD COLUMN killed INTEGER NOT NULL DEFAULT 0;",
            )?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            [CURRENT_VERSION],
        )?;
    }

    Ok(())
}
