//! Response body patterns.

use regex::bytes::{Regex, RegexBuilder};

/// A compiled response pattern. `.` also matches line breaks.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        RegexBuilder::new(pattern)
            .dot_matches_new_line(true)
            .build()
            .map(Pattern)
    }

    /// Compile `pattern`, treating the empty string as no pattern.
    pub fn optional(pattern: &str) -> Result<Option<Self>, regex::Error> {
        if pattern.is_empty() {
            Ok(None)
        } else {
            Self::compile(pattern).map(Some)
        }
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.0.is_match(haystack)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}
