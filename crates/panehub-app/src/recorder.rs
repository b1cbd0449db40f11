//! Background recorder that writes registry lifecycle events to the history tables.
//!
//! Runs on its own OS thread and drains the registry's broadcast channel with
//! blocking receives, so database writes never stall the async runtime and
//! are applied in the order the registry emitted them.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, SecondsFormat, Utc};
use panehub_core::{PaneDescriptor, PaneType, RegistryEvent};
use panehub_db::{history, NewPane};
use rusqlite::Connection;
use tokio::sync::broadcast::{self, error::RecvError};

/// Start the recorder thread. It exits when the registry is dropped.
pub fn start_recorder(
    db: Arc<Mutex<Connection>>,
    mut events: broadcast::Receiver<RegistryEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("history-recorder".into())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => {
                    let conn = db.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = record(&conn, &event) {
                        log::warn!("[recorder] failed to record {event:?}: {e}");
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("[recorder] fell behind, {missed} lifecycle events not recorded");
                }
                Err(RecvError::Closed) => {
                    log::debug!("[recorder] registry gone, stopping");
                    break;
                }
            }
        })
}

/// Apply one lifecycle event to the history tables.
pub fn record(conn: &Connection, event: &RegistryEvent) -> rusqlite::Result<()> {
    let now = timestamp(Utc::now());
    match event {
        RegistryEvent::SessionCreated { session } => {
            history::record_session_created(
                conn,
                session.id as i64,
                &session.name,
                &timestamp(session.created_at),
            )?;
        }
        RegistryEvent::SessionRenamed { session_id, name } => {
            history::record_session_renamed(conn, *session_id as i64, name)?;
        }
        RegistryEvent::SessionClosed { session_id } => {
            history::record_session_closed(conn, *session_id as i64, &now)?;
        }
        RegistryEvent::PaneCreated { pane } => record_pane(conn, pane)?,
        RegistryEvent::PaneClosed { pane_id, .. } => {
            history::record_pane_closed(conn, *pane_id as i64, &now)?;
        }
        RegistryEvent::PaneExited {
            pane_id,
            exit_code,
            killed,
        } => {
            history::record_pane_exited(conn, *pane_id as i64, *exit_code, *killed)?;
        }
    }
    Ok(())
}

fn record_pane(conn: &Connection, pane: &PaneDescriptor) -> rusqlite::Result<()> {
    let pane_type = pane_type_label(&pane.pane_type);
    let created_at = timestamp(pane.created_at);
    let (shell, args, cwd) = match &pane.process {
        Some(process) => (
            Some(process.shell.as_str()),
            process.args.as_slice(),
            Some(process.cwd.to_string_lossy()),
        ),
        None => (None, &[][..], pane.working_dir.as_ref().map(|dir| dir.to_string_lossy())),
    };
    history::record_pane_created(
        conn,
        &NewPane {
            pane_id: pane.id as i64,
            session_id: pane.session_id as i64,
            pane_type: &pane_type,
            title: &pane.title,
            shell,
            args,
            cwd: cwd.as_deref(),
            created_at: &created_at,
        },
    )?;
    Ok(())
}

/// Fixed-width UTC timestamps so stored values sort as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn pane_type_label(pane_type: &PaneType) -> String {
    match pane_type {
        PaneType::Terminal => "terminal".to_string(),
        PaneType::Editor => "editor".to_string(),
        PaneType::FileTree => "file_tree".to_string(),
        PaneType::Dashboard => "dashboard".to_string(),
        PaneType::Custom(name) => format!("custom:{name}"),
    }
}
