pub mod history;
pub mod schema;
pub mod settings;

use rusqlite::Connection;
use std::path::Path;

pub use history::{NewPane, PaneHistory, SessionHistory};

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panehub.db");
        {
            let conn = open(&path).unwrap();
            settings::set(&conn, "metrics_interval_ms", "1000").unwrap();
        }
        let conn = open(&path).unwrap();
        assert_eq!(
            settings::get(&conn, "metrics_interval_ms").unwrap().as_deref(),
            Some("1000")
        );
        assert_eq!(schema::current_version(&conn).unwrap(), schema::CURRENT_VERSION);
    }
}
