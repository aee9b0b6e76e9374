//! Exit-output classification.
//!
//! Agent CLIs report throttling and billing problems as text, not exit
//! codes, so the engine reads the tail of the attempt's output file and
//! pattern-matches it. Rate limits win over quota when both match.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

/// How much of the output file tail is examined.
pub const OUTPUT_TAIL_BYTES: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    /// No failure pattern matched.
    Clean,
    RateLimited,
    QuotaExceeded,
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)rate.*limit|too.*many.*request|429|RESOURCE_EXHAUSTED")
            .expect("static rate-limit pattern")
    })
}

fn quota_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)quota.*exceed|billing.*limit").expect("static quota pattern")
    })
}

/// Classify an output tail.
pub fn classify_output(tail: &str) -> OutputClass {
    if rate_limit_re().is_match(tail) {
        OutputClass::RateLimited
    } else if quota_re().is_match(tail) {
        OutputClass::QuotaExceeded
    } else {
        OutputClass::Clean
    }
}

/// Read up to `max_bytes` from the end of `path`. Missing or unreadable
/// files classify as clean rather than erroring out an attempt.
pub fn read_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::with_capacity(max_bytes.min(len) as usize);
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
