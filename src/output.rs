//! Output windowing and error pattern extraction for LLM-friendly command output.
//!
//! This module provides pure functions that take raw command output lines and produce
//! structured, token-efficient summaries suitable for LLM consumption.

use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;

/// The number of lines reserved for the "head" portion of windowed output.
const HEAD_LINES: usize = 10;

/// Default error patterns that match common build/test failure output.
static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        r"(?i)\berror\b",
        r"(?i)\bfailed\b",
        r"(?i)\bfailure\b",
        r"(?i)\bfatal\b",
        r"(?i)\bpanic\b",
        r"(?i)\bexception\b",
        r"(?i)\btraceback\b",
        r"(?i)\bFAIL\b",
        r"(?i)\bdenied\b",
        r"(?i)\baborted\b",
    ];
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("invalid error pattern regex"))
        .collect()
});

/// A windowed view of command output, optimized for LLM token efficiency.
#[derive(Debug, Clone, Serialize)]
pub struct OutputWindow {
    /// First N lines of output (usually invocation context / setup).
    pub head: Vec<String>,
    /// Last M lines of output (usually the result / error summary).
    pub tail: Vec<String>,
    /// Lines that matched error patterns, extracted from the full output.
    pub error_lines: Vec<String>,
    /// Total number of lines in the original output.
    pub total_lines: usize,
    /// Whether the output was truncated (head+tail < total).
    pub truncated: bool,
}

/// Window command output into head + tail sections for LLM consumption.
///
/// If the output fits within `max_lines`, returns it as-is in `head` with an empty `tail`.
/// Otherwise, splits into the first [`HEAD_LINES`] lines (head) and the remaining budget
/// as the tail from the end of output.
#[must_use]
pub fn window(lines: &[String], max_lines: usize) -> OutputWindow {
    let total_lines = lines.len();

    if total_lines <= max_lines {
        return OutputWindow {
            head: lines.to_vec(),
            tail: Vec::new(),
            error_lines: extract_errors(lines),
            total_lines,
            truncated: false,
        };
    }

    let head_count = HEAD_LINES.min(max_lines);
    let tail_count = max_lines.saturating_sub(head_count);

    let head = lines[..head_count].to_vec();
    let tail = if tail_count > 0 {
        let start = total_lines.saturating_sub(tail_count);
        lines[start..].to_vec()
    } else {
        Vec::new()
    };

    OutputWindow {
        head,
        tail,
        error_lines: extract_errors(lines),
        total_lines,
        truncated: true,
    }
}

/// Extract lines that match common error patterns from command output.
///
/// Scans each line against a set of regex patterns for errors, failures, panics,
/// exceptions, and other common failure indicators.
#[must_use]
pub fn extract_errors(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| ERROR_PATTERNS.iter().any(|re| re.is_match(line)))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// ANSI escape code stripping (for PTY output)
// ---------------------------------------------------------------------------

/// Regex matching ANSI escape sequences (CSI sequences, OSC sequences, etc.).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    // Matches:
    // - CSI sequences: \x1b[ ... final_byte  (parameters can include 0-9;?<=>!)
    //   Covers standard ANSI, DEC private modes, and Kitty keyboard protocol
    // - OSC sequences: \x1b] ... ST          (e.g., terminal title)
    // - Simple escapes: \x1b followed by a single character
    // - Backspace sequences: char \x08 (used by some programs for bold/overstrike)
    Regex::new(
        r"\x1b\[[0-9;?<=>!]*[a-zA-Z~]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-B]|\x1b[a-zA-Z]|.\x08",
    )
    .expect("invalid ANSI regex")
});

/// Strip ANSI escape codes from a string.
///
/// PTY output contains terminal formatting (colors, cursor movement, etc.)
/// that is meaningless to an LLM. This function removes it, leaving only
/// the visible text content.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

// ---------------------------------------------------------------------------
// Output Buffer (C1): append-only byte sink with a truncation tail-window.
// ---------------------------------------------------------------------------

/// The literal prefix written in place of truncated leading bytes.
const TRUNCATION_PREFIX: &[u8] = b"...";

/// A growable byte container with a ceiling.
///
/// Writes append. Once the total content exceeds `max_length`, the buffer is
/// truncated from the front so that the most recent `max_length - 3` bytes
/// remain, prefixed with the literal three bytes `...`. All writes and reads
/// are serialized by a single mutex; reads return a snapshot copy.
///
/// Contract: for any sequence of writes totalling `B` bytes with cap `L > 3`,
/// the final buffer length is exactly `min(B, L)` and its suffix equals the
/// suffix of the concatenation of all writes.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
    max_length: usize,
}

impl OutputBuffer {
    /// Create a new empty buffer capped at `max_length` bytes.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            max_length,
        }
    }

    /// Append bytes, truncating from the front if the cap is exceeded.
    pub async fn write(&self, data: &[u8]) {
        let mut buf = self.inner.lock().await;
        buf.extend_from_slice(data);
        Self::truncate_front(&mut buf, self.max_length);
    }

    /// Append a line of text plus a trailing newline.
    pub async fn write_line(&self, line: &str) {
        let mut buf = self.inner.lock().await;
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        Self::truncate_front(&mut buf, self.max_length);
    }

    /// Return a snapshot copy of the current content.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().await.clone()
    }

    /// Return a snapshot copy of the current content, decoded lossily as UTF-8.
    pub async fn snapshot_string(&self) -> String {
        String::from_utf8_lossy(&self.snapshot().await).into_owned()
    }

    /// Current length in bytes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Re-apply the truncation rule with a new, possibly smaller, cap. Used
    /// by the Supervisor's resource-cleanup pass to shrink buffers that were
    /// created before a configuration reload lowered the ceiling.
    pub async fn truncate_to(&self, max_length: usize) {
        let mut buf = self.inner.lock().await;
        Self::truncate_front(&mut buf, max_length);
    }

    fn truncate_front(buf: &mut Vec<u8>, max_length: usize) {
        if max_length <= TRUNCATION_PREFIX.len() || buf.len() <= max_length {
            // A cap too small to hold the prefix is treated as "no room to
            // signal truncation" rather than dropping below it.
            if buf.len() > max_length && max_length > 0 {
                let start = buf.len() - max_length;
                buf.drain(..start);
            }
            return;
        }

        let keep = max_length - TRUNCATION_PREFIX.len();
        let start = buf.len() - keep;
        let mut truncated = Vec::with_capacity(max_length);
        truncated.extend_from_slice(TRUNCATION_PREFIX);
        truncated.extend_from_slice(&buf[start..]);
        *buf = truncated;
    }
}

#[cfg(test)]
mod output_buffer_tests {
    use super::*;

    #[tokio::test]
    async fn write_under_cap_is_unmodified() {
        let buf = OutputBuffer::new(100);
        buf.write(b"hello").await;
        assert_eq!(buf.snapshot().await, b"hello");
    }

    #[tokio::test]
    async fn write_over_cap_truncates_with_prefix() {
        let buf = OutputBuffer::new(100);
        buf.write(&vec![b'a'; 1000]).await;
        let snap = buf.snapshot().await;
        assert_eq!(snap.len(), 100);
        assert_eq!(&snap[..3], b"...");
        assert!(snap[3..].iter().all(|&b| b == b'a'));
    }

    #[tokio::test]
    async fn final_length_is_min_of_total_and_cap() {
        let buf = OutputBuffer::new(50);
        for _ in 0..10 {
            buf.write(b"0123456789").await;
        }
        assert_eq!(buf.len().await, 50);

        let buf2 = OutputBuffer::new(500);
        for _ in 0..10 {
            buf2.write(b"0123456789").await;
        }
        assert_eq!(buf2.len().await, 100);
    }

    #[tokio::test]
    async fn suffix_is_preserved_across_writes() {
        let buf = OutputBuffer::new(10);
        buf.write(b"abcdefgh").await;
        buf.write(b"ijklmnop").await;
        // Total is "abcdefghijklmnop" (16 bytes), cap 10 -> keep last 7, prefix 3.
        let snap = buf.snapshot().await;
        assert_eq!(snap, b"...jklmnop".to_vec());
    }
}
