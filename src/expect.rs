//! # Expect Matcher
//!
//! Accumulating text buffer used by macro steps that await a response. Steps
//! can wait indefinitely, so the buffer is hard-capped: overflow discards the
//! oldest text and keeps the most recent window, which is where a late match
//! will land anyway.

use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

/// Default accumulation cap (1 MiB of text).
pub const DEFAULT_EXPECT_CAP: usize = 1024 * 1024;

/// Literal-or-regex matcher over a bounded rolling buffer.
///
/// A pattern wrapped in slashes (`/timeout|OK/`) is compiled as a regex once
/// and cached per pattern string; anything else is a case-sensitive substring
/// test. Callers lowercase both sides if they want case-insensitive matching.
pub struct ExpectMatcher {
    buffer: String,
    cap: usize,
    /// `None` caches a pattern that failed to compile so it is reported once.
    regex_cache: HashMap<String, Option<Regex>>,
}

impl ExpectMatcher {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_EXPECT_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        assert!(cap > 0, "expect buffer cap must be non-zero");
        Self {
            buffer: String::new(),
            cap,
            regex_cache: HashMap::new(),
        }
    }

    /// Accumulate response text, trimming the oldest bytes past the cap.
    pub fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
        if self.buffer.len() > self.cap {
            let mut cut = self.buffer.len() - self.cap;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }

    /// Test `pattern` against the whole buffered window.
    pub fn is_match(&mut self, pattern: &str) -> bool {
        if let Some(expr) = regex_body(pattern) {
            let compiled = self
                .regex_cache
                .entry(pattern.to_string())
                .or_insert_with(|| match Regex::new(expr) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!("invalid expect regex {pattern:?}: {err}");
                        None
                    }
                });
            match compiled {
                Some(re) => re.is_match(&self.buffer),
                None => false,
            }
        } else {
            self.buffer.contains(pattern)
        }
    }

    /// Clear the accumulated text; compiled patterns stay cached.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

impl Default for ExpectMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// The regex sentinel is a pattern wrapped in slashes with a non-empty body.
fn regex_body(pattern: &str) -> Option<&str> {
    if pattern.len() >= 3 && pattern.starts_with('/') && pattern.ends_with('/') {
        Some(&pattern[1..pattern.len() - 1])
    } else {
        None
    }
}
