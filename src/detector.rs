//! Check-cycle detection from a watch process's console output.
//!
//! The watched tool has no machine-readable event channel, so cycles are
//! inferred from fixed substrings in its stdout. The detector keeps the byte
//! offset of the last start marker and of the last end marker seen anywhere in
//! the accumulated output. Output only grows, so both offsets only move
//! forward, and a cycle is in flight exactly when the last start marker sits
//! after the last end marker.

use regex::Regex;

/// The substrings that delimit one check cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    pub start: String,
    pub end: Vec<String>,
}

impl MarkerSet {
    pub fn new(start: impl Into<String>, end: Vec<String>) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    /// Longest marker in bytes, used to size the rescan window.
    fn longest(&self) -> usize {
        self.end
            .iter()
            .map(String::len)
            .chain(std::iter::once(self.start.len()))
            .max()
            .unwrap_or(0)
    }
}

/// Snapshot of the end-marker high-water mark at some point in time.
///
/// A completion counts as new only once the end offset moves past the
/// snapshot, so a cycle that finished before the snapshot is never reported
/// twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionMark(Option<usize>);

/// Accumulates a watch process's output and tracks cycle boundaries.
#[derive(Debug)]
pub struct CycleDetector {
    markers: MarkerSet,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    // `None` orders below every `Some`, so an absent marker compares like -1.
    last_start: Option<usize>,
    last_end: Option<usize>,
}

impl CycleDetector {
    pub fn new(markers: MarkerSet) -> Self {
        Self {
            markers,
            stdout: Vec::new(),
            stderr: Vec::new(),
            last_start: None,
            last_end: None,
        }
    }

    /// Append a chunk of stdout and move the marker offsets forward.
    ///
    /// Only the tail that could contain a new occurrence is rescanned: the new
    /// bytes plus enough of the old buffer to catch a marker split across the
    /// chunk boundary. The result is the same as searching the whole buffer
    /// for the last occurrence of every marker.
    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let window_start = self
            .stdout
            .len()
            .saturating_sub(self.markers.longest().saturating_sub(1));
        self.stdout.extend_from_slice(chunk);
        let window = &self.stdout[window_start..];

        if let Some(pos) = rfind(window, self.markers.start.as_bytes()) {
            self.last_start = self.last_start.max(Some(window_start + pos));
        }
        for marker in &self.markers.end {
            if let Some(pos) = rfind(window, marker.as_bytes()) {
                self.last_end = self.last_end.max(Some(window_start + pos));
            }
        }
    }

    /// Append a chunk of stderr. Stderr is kept for diagnostics only.
    pub fn feed_stderr(&mut self, chunk: &[u8]) {
        self.stderr.extend_from_slice(chunk);
    }

    /// True while a start marker has been seen after the most recent end marker.
    pub fn is_busy(&self) -> bool {
        self.last_start > self.last_end
    }

    /// True once any end marker has been seen.
    pub fn has_completed(&self) -> bool {
        self.last_end.is_some()
    }

    pub fn mark(&self) -> CompletionMark {
        CompletionMark(self.last_end)
    }

    /// A cycle finished after `mark` was taken and nothing is in flight now.
    pub fn completed_since(&self, mark: CompletionMark) -> bool {
        CompletionMark(self.last_end) > mark && !self.is_busy()
    }

    pub fn last_start(&self) -> Option<usize> {
        self.last_start
    }

    pub fn last_end(&self) -> Option<usize> {
        self.last_end
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// The number captured by `pattern`'s first group in its last match.
    ///
    /// Watch tools typically print a summary such as `Found 3 errors.` at the
    /// end of each cycle; this returns the count from the most recent one.
    pub fn last_diagnostic_count(&self, pattern: &Regex) -> Option<u64> {
        let text = String::from_utf8_lossy(&self.stdout);
        pattern
            .captures_iter(&text)
            .last()
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Byte offset of the last occurrence of `needle` in `haystack`.
fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
