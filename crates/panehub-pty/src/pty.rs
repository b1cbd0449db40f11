use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};

/// Largest accepted value for either terminal dimension.
pub const MAX_DIMENSION: u16 = 1000;

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    SpawnFailed(String),
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    ResizeFailed(String),
    #[error("invalid terminal dimensions: {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },
    #[error("process has exited")]
    ProcessExited,
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub rows: u16,
    pub cols: u16,
}

impl Geometry {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Reject zero-sized or absurdly large terminals before they reach the OS.
    pub fn validate(self) -> Result<Self, PtyError> {
        if self.rows == 0 || self.cols == 0 || self.rows > MAX_DIMENSION || self.cols > MAX_DIMENSION {
            return Err(PtyError::InvalidGeometry {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(self)
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Everything needed to launch a process on a fresh PTY.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Program to run. `None` means the user's default shell.
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub geometry: Geometry,
}

impl SpawnConfig {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Immutable facts about a spawned process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub shell: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub spawned_at: DateTime<Utc>,
}

/// Owns a portable-pty child process, master pair, reader, and writer.
///
/// The reader, writer and child are handed off to dedicated threads by
/// [`crate::terminal::TerminalProcess`]; the master stays here for resizing.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    info: ProcessInfo,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("info", &self.info)
            .field("has_reader", &self.reader.is_some())
            .field("has_writer", &self.writer.is_some())
            .field("has_child", &self.child.is_some())
            .finish()
    }
}

impl PtyHandle {
    /// Spawn a new PTY running the configured program.
    ///
    /// If `config.shell` is `None`, uses the user's default shell (`$SHELL` or `/bin/sh`).
    /// Every failure happens before this returns, so a caller never holds a
    /// half-started process.
    pub fn spawn(config: &SpawnConfig) -> Result<Self, PtyError> {
        let geometry = config.geometry.validate()?;
        let shell = config.shell.clone().unwrap_or_else(default_shell);
        let program = resolve_program(&shell)?;

        let cwd = match &config.cwd {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(PtyError::SpawnFailed(format!(
                        "working directory does not exist: {}",
                        dir.display()
                    )));
                }
                dir.clone()
            }
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(geometry.to_pty_size())
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&config.args);
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {shell}: {e}")))?;
        // The child holds its own copy of the slave; ours must go so the
        // master sees EOF once the process exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        let info = ProcessInfo {
            pid: child.process_id(),
            shell: program.to_string_lossy().into_owned(),
            args: config.args.clone(),
            cwd,
            env: config.env.clone(),
            spawned_at: Utc::now(),
        };

        log::debug!("[pty] spawned {} (pid {:?})", info.shell, info.pid);

        Ok(Self {
            master: pair.master,
            reader: Some(reader),
            writer: Some(writer),
            child: Some(child),
            info,
        })
    }

    /// Resize the PTY to new dimensions.
    pub fn resize(&self, geometry: Geometry) -> Result<(), PtyError> {
        let geometry = geometry.validate()?;
        self.master
            .resize(geometry.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(format!("{e}")))
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn pid(&self) -> Option<u32> {
        self.info.pid
    }

    /// Extract the PTY reader for use in a dedicated I/O thread.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Extract the PTY writer for use in a dedicated input thread.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    /// Extract the child so the I/O thread can reap it once output ends.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// Build a signaller for the child. Must be called before [`take_child`](Self::take_child).
    pub fn signaller(&self) -> Option<ProcessSignaller> {
        self.child.as_ref().map(|child| ProcessSignaller {
            pid: self.info.pid,
            killer: child.clone_killer(),
        })
    }
}

/// Delivers termination signals to a PTY child (and its process group on unix).
#[derive(Debug)]
pub struct ProcessSignaller {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl ProcessSignaller {
    /// Ask the process to exit, the way a closing terminal would (SIGHUP).
    pub fn hang_up(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, libc::SIGHUP);
                return;
            }
        }
        if let Err(e) = self.killer.kill() {
            log::debug!("[pty] hang-up failed: {e}");
        }
    }

    /// Force the process (group) down.
    pub fn kill(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, libc::SIGKILL);
                return;
            }
        }
        if let Err(e) = self.killer.kill() {
            log::debug!("[pty] kill failed: {e}");
        }
    }
}

/// The PTY child is a session leader, so its pid doubles as the process group id.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only yields ESRCH.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // Fall back to the leader alone when the group is already gone.
        // SAFETY: as above.
        unsafe { libc::kill(pid, signal) };
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Resolve a program name the way a shell would: paths are checked as-is,
/// bare names are looked up on `$PATH`.
pub fn resolve_program(program: &str) -> Result<PathBuf, PtyError> {
    if program.is_empty() {
        return Err(PtyError::SpawnFailed("empty program name".to_string()));
    }

    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(program);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(PtyError::SpawnFailed(format!("program not found: {program}")));
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| PtyError::SpawnFailed(format!("program not found on PATH: {program}")))
}
