//! Incremental name search over the displayed package list

use regex::{Regex, RegexBuilder};
use tracing::debug;

#[derive(Debug, Clone)]
enum SearchPattern {
    Regex(Regex),
    /// Case-insensitive prefix; stored lowercased
    Prefix(String),
}

impl SearchPattern {
    fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(name),
            Self::Prefix(prefix) => name.to_lowercase().starts_with(prefix.as_str()),
        }
    }
}

/// Search state, resumable across calls.
///
/// The cursor only knows positions; the caller hands in the displayed names
/// on each call so it always scans the current list.
#[derive(Debug, Clone, Default)]
pub struct SearchCursor {
    pattern: Option<SearchPattern>,
    /// Index of the last hit, None before the first one
    last: Option<usize>,
}

impl SearchCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new search. `use_regex` asks for a case-insensitive regex;
    /// an invalid one degrades to a prefix match.
    pub fn set_pattern(&mut self, pattern: &str, use_regex: bool) {
        let compiled = if use_regex {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some(SearchPattern::Regex(re)),
                Err(e) => {
                    debug!(pattern, error = %e, "search pattern is not a valid regex");
                    None
                }
            }
        } else {
            None
        };
        self.pattern = Some(compiled.unwrap_or_else(|| SearchPattern::Prefix(pattern.to_lowercase())));
        self.last = None;
    }

    /// Forget the pattern; the cursor then steps through the list one by one
    pub fn clear(&mut self) {
        self.pattern = None;
        self.last = None;
    }

    pub fn is_regex(&self) -> bool {
        matches!(self.pattern, Some(SearchPattern::Regex(_)))
    }

    pub fn has_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// Next index after the last hit whose name matches.
    ///
    /// Without a pattern this is a plain cursor that wraps back to the
    /// first entry after the last one.
    pub fn find_next<'a>(&mut self, len: usize, name_at: impl Fn(usize) -> &'a str) -> Option<usize> {
        let start = self.last.map_or(0, |last| last + 1);

        let Some(pattern) = &self.pattern else {
            if len == 0 {
                self.last = None;
                return None;
            }
            let next = if start >= len { 0 } else { start };
            self.last = Some(next);
            return Some(next);
        };

        let hit = (start..len).find(|&i| pattern.is_match(name_at(i)));
        if let Some(i) = hit {
            self.last = Some(i);
        }
        hit
    }
}
