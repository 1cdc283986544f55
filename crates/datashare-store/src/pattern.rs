//! Key patterns for watchers and key queries.
//!
//! A pattern is either an exact key or a glob where `*` matches any
//! (possibly empty) sequence of characters. Globs are compiled to anchored
//! regexes once, at registration time: literal segments are escaped, so
//! `.` and other regex metacharacters in keys mean themselves, and the
//! match always covers the whole key. `"user.*"` matches `"user.name"`
//! but not `"superuser.name"`; `"user"` matches only `"user"`.

use regex::Regex;
use tracing::warn;

/// A compiled key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    /// Compiled matcher for glob patterns; `None` for exact keys.
    regex: Option<Regex>,
}

impl KeyPattern {
    /// Compile a pattern. Patterns without `*` match by string equality.
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let regex = if raw.contains('*') {
            let anchored = format!(
                "^{}$",
                raw.split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            );
            Regex::new(&anchored)
                .map_err(|e| {
                    warn!(pattern = %raw, error = %e, "invalid key pattern, will never match");
                    e
                })
                .ok()
        } else {
            None
        };

        Self { raw, regex }
    }

    /// The pattern string as supplied by the caller.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern is an exact key (contains no `*`).
    pub fn is_exact(&self) -> bool {
        !self.raw.contains('*')
    }

    /// Test a key against this pattern.
    pub fn matches(&self, key: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(key),
            None => self.raw == key,
        }
    }
}
