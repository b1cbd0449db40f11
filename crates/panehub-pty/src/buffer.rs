//! Bounded scrollback of sequenced PTY output.
//!
//! Each pane owns a `ScrollbackBuffer`. The streaming layer appends every
//! [`OutputChunk`] as it is read; new subscribers receive the retained
//! chunks as their opening snapshot. Memory is bounded by a line limit and
//! a byte limit, whichever is hit first. Eviction always drops whole chunks
//! from the front and is counted in [`Truncation`] so late subscribers can
//! be told that history is missing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::stream::OutputChunk;

/// Default line limit for scrollback.
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// Default byte limit for scrollback: 8 MiB.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 8 * 1024 * 1024;

/// Retention limits for a [`ScrollbackBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbackLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for ScrollbackLimits {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_SCROLLBACK_LINES,
            max_bytes: DEFAULT_SCROLLBACK_BYTES,
        }
    }
}

/// How much history has been evicted so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub evicted_chunks: u64,
    pub evicted_bytes: u64,
    pub evicted_lines: u64,
}

impl Truncation {
    pub fn is_truncated(&self) -> bool {
        self.evicted_bytes > 0
    }
}

/// A scrollback line matching a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrollbackMatch {
    /// Absolute line number since the pane started (0-based).
    pub line: u64,
    pub text: String,
}

/// Ring of output chunks bounded by lines and bytes.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<OutputChunk>,
    lines: usize,
    bytes: usize,
    limits: ScrollbackLimits,
    truncation: Truncation,
}

impl ScrollbackBuffer {
    /// Limits of zero are raised to one so the buffer stays usable.
    pub fn new(limits: ScrollbackLimits) -> Self {
        Self {
            chunks: VecDeque::new(),
            lines: 0,
            bytes: 0,
            limits: ScrollbackLimits {
                max_lines: limits.max_lines.max(1),
                max_bytes: limits.max_bytes.max(1),
            },
            truncation: Truncation::default(),
        }
    }

    /// Append a chunk, evicting the oldest chunks until both limits hold.
    /// The newest chunk is never evicted; if it alone exceeds a limit its
    /// head is trimmed instead.
    pub fn push(&mut self, chunk: OutputChunk) {
        if chunk.data.is_empty() {
            return;
        }
        self.lines += count_newlines(&chunk.data);
        self.bytes += chunk.data.len();
        self.chunks.push_back(chunk);

        while self.over_limit() && self.chunks.len() > 1 {
            let Some(old) = self.chunks.pop_front() else {
                break;
            };
            let old_lines = count_newlines(&old.data);
            self.lines -= old_lines;
            self.bytes -= old.data.len();
            self.truncation.evicted_chunks += 1;
            self.truncation.evicted_bytes += old.data.len() as u64;
            self.truncation.evicted_lines += old_lines as u64;
        }

        if self.over_limit() {
            self.trim_newest();
        }
    }

    fn over_limit(&self) -> bool {
        self.lines > self.limits.max_lines || self.bytes > self.limits.max_bytes
    }

    /// Cut the head of the only remaining chunk down to the last
    /// `max_lines` lines and `max_bytes` bytes.
    fn trim_newest(&mut self) {
        let Some(last) = self.chunks.back_mut() else {
            return;
        };
        let data = &last.data;

        let mut start = 0;
        let excess_lines = self.lines.saturating_sub(self.limits.max_lines);
        if excess_lines > 0 {
            if let Some((idx, _)) = data.iter().enumerate().filter(|(_, b)| **b == b'\n').nth(excess_lines - 1) {
                start = idx + 1;
            }
        }
        start = start.max(data.len().saturating_sub(self.limits.max_bytes));
        if start == 0 {
            return;
        }

        let cut_lines = count_newlines(&data[..start]);
        last.data = data.slice(start..);
        self.lines -= cut_lines;
        self.bytes -= start;
        self.truncation.evicted_bytes += start as u64;
        self.truncation.evicted_lines += cut_lines as u64;
    }

    /// Retained chunks, oldest first.
    pub fn chunks(&self) -> impl Iterator<Item = &OutputChunk> {
        self.chunks.iter()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Completed lines currently retained.
    pub fn line_count(&self) -> usize {
        self.lines
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn limits(&self) -> ScrollbackLimits {
        self.limits
    }

    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    /// Drop everything without recording it as eviction.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.lines = 0;
        self.bytes = 0;
    }

    /// Contiguous copy of all retained bytes (oldest first).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    /// The last `max_lines` lines of retained output, including a trailing
    /// partial line if the process has not finished it yet.
    pub fn tail_lines(&self, max_lines: usize) -> Vec<u8> {
        if max_lines == 0 {
            return Vec::new();
        }
        let all = self.to_vec();
        let body = match all.last() {
            Some(b'\n') => &all[..all.len() - 1],
            _ => &all[..],
        };

        let mut seen = 0;
        for (idx, byte) in body.iter().enumerate().rev() {
            if *byte == b'\n' {
                seen += 1;
                if seen == max_lines {
                    return all[idx + 1..].to_vec();
                }
            }
        }
        all
    }

    /// Case-sensitive substring search over retained lines.
    pub fn search(&self, needle: &str) -> Vec<ScrollbackMatch> {
        if needle.is_empty() {
            return Vec::new();
        }
        let all = self.to_vec();
        let text = String::from_utf8_lossy(&all);
        text.split('\n')
            .enumerate()
            .filter(|(_, line)| line.contains(needle))
            .map(|(idx, line)| ScrollbackMatch {
                line: self.truncation.evicted_lines + idx as u64,
                text: line.trim_end_matches('\r').to_string(),
            })
            .collect()
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(ScrollbackLimits::default())
    }
}

fn count_newlines(data: &[u8]) -> usize {
    data.iter().filter(|b| **b == b'\n').count()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
