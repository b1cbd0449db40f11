//! Session and pane lifecycle history.
//!
//! Live ids restart from 1 whenever the daemon starts, so rows carry their
//! own primary key and updates target the newest open row for an id.

use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub id: i64,
    pub session_id: i64,
    pub name: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneHistory {
    pub id: i64,
    pub pane_id: i64,
    pub session_id: i64,
    pub pane_type: String,
    pub title: String,
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub exit_code: Option<i32>,
    pub killed: bool,
}

/// Fields recorded when a pane opens.
#[derive(Debug, Clone, Default)]
pub struct NewPane<'a> {
    pub pane_id: i64,
    pub session_id: i64,
    pub pane_type: &'a str,
    pub title: &'a str,
    pub shell: Option<&'a str>,
    pub args: &'a [String],
    pub cwd: Option<&'a str>,
    pub created_at: &'a str,
}

pub fn record_session_created(
    conn: &Connection,
    session_id: i64,
    name: &str,
    created_at: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO session_history (session_id, name, created_at) VALUES (?1, ?2, ?3)",
        params![session_id, name, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn record_session_renamed(conn: &Connection, session_id: i64, name: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE session_history SET name = ?2
         WHERE id = (SELECT MAX(id) FROM session_history WHERE session_id = ?1 AND closed_at IS NULL)",
        params![session_id, name],
    )?;
    Ok(changed > 0)
}

pub fn record_session_closed(conn: &Connection, session_id: i64, closed_at: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE session_history SET closed_at = ?2
         WHERE id = (SELECT MAX(id) FROM session_history WHERE session_id = ?1 AND closed_at IS NULL)",
        params![session_id, closed_at],
    )?;
    Ok(changed > 0)
}

pub fn record_pane_created(conn: &Connection, pane: &NewPane<'_>) -> rusqlite::Result<i64> {
    let args = serde_json::to_string(pane.args).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO pane_history (pane_id, session_id, pane_type, title, shell, args, cwd, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            pane.pane_id,
            pane.session_id,
            pane.pane_type,
            pane.title,
            pane.shell,
            args,
            pane.cwd,
            pane.created_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Stores the exit status. The row stays open until the pane is closed.
pub fn record_pane_exited(
    conn: &Connection,
    pane_id: i64,
    exit_code: Option<i32>,
    killed: bool,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE pane_history SET exit_code = ?2, killed = ?3
         WHERE id = (SELECT MAX(id) FROM pane_history WHERE pane_id = ?1)",
        params![pane_id, exit_code, killed],
    )?;
    Ok(changed > 0)
}

pub fn record_pane_closed(conn: &Connection, pane_id: i64, closed_at: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE pane_history SET closed_at = ?2
         WHERE id = (SELECT MAX(id) FROM pane_history WHERE pane_id = ?1 AND closed_at IS NULL)",
        params![pane_id, closed_at],
    )?;
    Ok(changed > 0)
}

/// Marks rows left open by a previous run as closed. Returns the number of rows touched.
pub fn close_dangling(conn: &Connection, closed_at: &str) -> rusqlite::Result<usize> {
    let sessions = conn.execute(
        "UPDATE session_history SET closed_at = ?1 WHERE closed_at IS NULL",
        params![closed_at],
    )?;
    let panes = conn.execute(
        "UPDATE pane_history SET closed_at = ?1 WHERE closed_at IS NULL",
        params![closed_at],
    )?;
    Ok(sessions + panes)
}

/// Most recent sessions first.
pub fn list_session_history(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<SessionHistory>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, name, created_at, closed_at
         FROM session_history ORDER BY id DESC LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SessionHistory {
            id: row.get(0)?,
            session_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
            closed_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Panes recorded for one run of a session, identified by its history row.
pub fn list_pane_history(conn: &Connection, history_id: i64) -> rusqlite::Result<Vec<PaneHistory>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.pane_id, p.session_id, p.pane_type, p.title, p.shell, p.args, p.cwd,
                p.created_at, p.closed_at, p.exit_code, p.killed
         FROM pane_history p
         JOIN session_history s ON s.session_id = p.session_id
         WHERE s.id = ?1
           AND p.created_at >= s.created_at
           AND (s.closed_at IS NULL OR p.created_at <= s.closed_at)
         ORDER BY p.id",
    )?;
    let rows = stmt.query_map(params![history_id], |row| {
        let args: String = row.get(6)?;
        let args = serde_json::from_str(&args)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
        Ok(PaneHistory {
            id: row.get(0)?,
            pane_id: row.get(1)?,
            session_id: row.get(2)?,
            pane_type: row.get(3)?,
            title: row.get(4)?,
            shell: row.get(5)?,
            args,
            cwd: row.get(7)?,
            created_at: row.get(8)?,
            closed_at: row.get(9)?,
            exit_code: row.get(10)?,
            killed: row.get(11)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::initialize(&conn).unwrap();
        conn
    }

    fn terminal<'a>(pane_id: i64, session_id: i64, args: &'a [String], at: &'a str) -> NewPane<'a> {
        NewPane {
            pane_id,
            session_id,
            pane_type: "terminal",
            title: "shell",
            shell: Some("/bin/sh"),
            args,
            cwd: Some("/tmp"),
            created_at: at,
        }
    }

    #[test]
    fn session_lifecycle_is_recorded() {
        let conn = conn();
        record_session_created(&conn, 1, "demo", "2025-01-01T00:00:00Z").unwrap();
        assert!(record_session_renamed(&conn, 1, "renamed").unwrap());
        assert!(record_session_closed(&conn, 1, "2025-01-01T01:00:00Z").unwrap());
        assert!(!record_session_closed(&conn, 1, "2025-01-01T02:00:00Z").unwrap());

        let history = list_session_history(&conn, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "renamed");
        assert_eq!(history[0].closed_at.as_deref(), Some("2025-01-01T01:00:00Z"));
    }

    #[test]
    fn reused_ids_update_the_newest_open_row() {
        let conn = conn();
        record_session_created(&conn, 1, "first run", "2025-01-01T00:00:00Z").unwrap();
        close_dangling(&conn, "2025-01-01T00:30:00Z").unwrap();
        record_session_created(&conn, 1, "second run", "2025-01-02T00:00:00Z").unwrap();
        record_session_closed(&conn, 1, "2025-01-02T01:00:00Z").unwrap();

        let history = list_session_history(&conn, 10).unwrap();
        assert_eq!(history[0].name, "second run");
        assert_eq!(history[0].closed_at.as_deref(), Some("2025-01-02T01:00:00Z"));
        assert_eq!(history[1].closed_at.as_deref(), Some("2025-01-01T00:30:00Z"));
        assert_eq!(list_session_history(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn pane_rows_keep_exit_status() {
        let conn = conn();
        let history_id = record_session_created(&conn, 3, "work", "2025-01-01T00:00:00Z").unwrap();
        let args = vec!["-c".to_string(), "exit 3".to_string()];
        record_pane_created(&conn, &terminal(7, 3, &args, "2025-01-01T00:00:01Z")).unwrap();
        assert!(record_pane_exited(&conn, 7, Some(3), false).unwrap());
        assert!(record_pane_closed(&conn, 7, "2025-01-01T00:00:05Z").unwrap());

        let panes = list_pane_history(&conn, history_id).unwrap();
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0].args, args);
        assert_eq!(panes[0].exit_code, Some(3));
        assert!(!panes[0].killed);
        assert_eq!(panes[0].closed_at.as_deref(), Some("2025-01-01T00:00:05Z"));
    }

    #[test]
    fn pane_history_is_scoped_to_one_session_run() {
        let conn = conn();
        let first = record_session_created(&conn, 1, "a", "2025-01-01T00:00:00Z").unwrap();
        record_pane_created(&conn, &terminal(1, 1, &[], "2025-01-01T00:00:01Z")).unwrap();
        record_session_closed(&conn, 1, "2025-01-01T00:10:00Z").unwrap();

        let second = record_session_created(&conn, 1, "b", "2025-01-02T00:00:00Z").unwrap();
        record_pane_created(&conn, &terminal(1, 1, &[], "2025-01-02T00:00:01Z")).unwrap();
        record_pane_created(&conn, &terminal(2, 1, &[], "2025-01-02T00:00:02Z")).unwrap();

        assert_eq!(list_pane_history(&conn, first).unwrap().len(), 1);
        assert_eq!(list_pane_history(&conn, second).unwrap().len(), 2);
    }
}
