//! panehub-pty: PTY processes, scrollback and output streaming for panehub.
//!
//! This crate sits between the real shell process and everyone who wants to
//! watch it. It spawns processes on pseudo-terminals, sequences their output,
//! retains bounded scrollback, and fans events out to any number of
//! subscribers without letting a slow one hold up the others.
//!
//! # Architecture
//!
//! - [`PtyHandle`]: Low-level PTY process management (spawn, resize, signals).
//! - [`ScrollbackBuffer`]: Bounded ring of sequenced output chunks.
//! - [`PaneStream`]: Per-pane sequencer and subscriber fan-out.
//! - [`TerminalProcess`]: A `PtyHandle` wired to a `PaneStream` by
//!   dedicated reader and writer threads.

pub mod buffer;
pub mod pty;
pub mod stream;
pub mod terminal;

pub use buffer::{ScrollbackBuffer, ScrollbackLimits, ScrollbackMatch, Truncation};
pub use pty::{default_shell, Geometry, ProcessInfo, PtyError, PtyHandle, SpawnConfig, MAX_DIMENSION};
pub use stream::{OutputChunk, PaneEvent, PaneId, PaneStream, StreamError, Subscription};
pub use terminal::{OutputObserver, ProcessExit, StreamConfig, TerminalProcess};
