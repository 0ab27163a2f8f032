//! Compiled subscription patterns.
//!
//! Types are colon-delimited (`module:audio:activated`). A pattern is the same
//! shape where a segment may be `*`, matching exactly one segment. There is no
//! multi-level wildcard: `module:*` does not match `module:a:b`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Segment separator for event types and patterns.
pub const SEPARATOR: char = ':';

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Any,
}

/// A subscription pattern compiled at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventPattern {
    raw: String,
    #[serde(skip)]
    segments: Vec<Segment>,
}

impl EventPattern {
    /// Compile a pattern, rejecting empty patterns, empty segments and
    /// segments that mix `*` with other characters.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::validation("pattern cannot be empty"));
        }
        let segments = raw
            .split(SEPARATOR)
            .map(|segment| match segment {
                "" => Err(Error::validation(format!(
                    "pattern '{}' contains an empty segment",
                    raw
                ))),
                WILDCARD => Ok(Segment::Any),
                s if s.contains('*') => Err(Error::validation(format!(
                    "pattern '{}': '*' must be a whole segment",
                    raw
                ))),
                s => Ok(Segment::Literal(s.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Whether `event_type` matches segment-for-segment.
    pub fn matches(&self, event_type: &str) -> bool {
        let mut parts = event_type.split(SEPARATOR);
        for segment in &self.segments {
            match (segment, parts.next()) {
                (_, None) => return false,
                (Segment::Any, Some(part)) => {
                    if part.is_empty() {
                        return false;
                    }
                }
                (Segment::Literal(lit), Some(part)) => {
                    if lit != part {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }

    /// Pattern without wildcards.
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for EventPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for EventPattern {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventPattern {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<EventPattern> for String {
    fn from(p: EventPattern) -> Self {
        p.raw
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete event type: non-empty segments, no wildcard.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(Error::validation("event type cannot be empty"));
    }
    for segment in event_type.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(Error::validation(format!(
                "event type '{}' contains an empty segment",
                event_type
            )));
        }
        if segment.contains('*') {
            return Err(Error::validation(format!(
                "event type '{}' cannot contain wildcards",
                event_type
            )));
        }
    }
    Ok(())
}

/// Whether `event_type` starts with the whole segments of `prefix`.
pub fn has_segment_prefix(event_type: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match event_type.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// First segment of a type (`module` for `module:audio:activated`).
pub fn root_segment(event_type: &str) -> &str {
    event_type.split(SEPARATOR).next().unwrap_or(event_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_match() {
        let p = EventPattern::parse("module:x:activated").unwrap();
        assert!(p.is_exact());
        assert!(p.matches("module:x:activated"));
        assert!(!p.matches("module:y:activated"));
    }

    #[test]
    fn test_single_wildcard() {
        let p = EventPattern::parse("module:*:activated").unwrap();
        assert!(p.matches("module:x:activated"));
        assert!(p.matches("module:audio:activated"));
        assert!(!p.matches("module:x:deactivated"));
    }

    #[test]
    fn test_wildcard_is_single_segment() {
        let p = EventPattern::parse("module:*").unwrap();
        assert!(p.matches("module:a"));
        assert!(!p.matches("module:a:b"));
        assert!(!p.matches("module"));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        assert!(EventPattern::parse("").is_err());
        assert!(EventPattern::parse("module::x").is_err());
        assert!(EventPattern::parse("module:").is_err());
        assert!(EventPattern::parse("mod*:x").is_err());
        assert!(EventPattern::parse("**").is_err());
    }

    #[test]
    fn test_event_type_validation() {
        assert!(validate_event_type("a:b").is_ok());
        assert!(validate_event_type("").is_err());
        assert!(validate_event_type("a::b").is_err());
        assert!(validate_event_type("a:*").is_err());
    }

    #[test]
    fn test_segment_prefix() {
        assert!(has_segment_prefix("module:x:activated", "module"));
        assert!(has_segment_prefix("module:x:activated", "module:x"));
        assert!(has_segment_prefix("module", "module"));
        assert!(!has_segment_prefix("modules:y", "module"));
        assert!(has_segment_prefix("anything", ""));
    }

    #[test]
    fn test_pattern_serde_round_trip_recompiles() {
        let p: EventPattern = serde_json::from_str("\"a:*:c\"").unwrap();
        assert!(p.matches("a:b:c"));
        assert!(serde_json::from_str::<EventPattern>("\"a::c\"").is_err());
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #[test]
        fn prop_exact_pattern_matches_itself(parts in prop::collection::vec(segment(), 1..5)) {
            let t = parts.join(":");
            let p = EventPattern::parse(&t).unwrap();
            prop_assert!(p.matches(&t));
        }

        #[test]
        fn prop_wildcard_matches_any_one_segment(
            parts in prop::collection::vec(segment(), 1..5),
            idx in 0usize..5,
            replacement in segment(),
        ) {
            let idx = idx % parts.len();
            let mut pattern_parts = parts.clone();
            pattern_parts[idx] = WILDCARD.to_string();
            let p = EventPattern::parse(&pattern_parts.join(":")).unwrap();

            let mut event_parts = parts.clone();
            event_parts[idx] = replacement;
            prop_assert!(p.matches(&event_parts.join(":")));
        }

        #[test]
        fn prop_segment_count_must_agree(
            parts in prop::collection::vec(segment(), 1..5),
            extra in segment(),
        ) {
            let p = EventPattern::parse(&vec![WILDCARD; parts.len()].join(":")).unwrap();
            prop_assert!(p.matches(&parts.join(":")));
            let longer = format!("{}:{}", parts.join(":"), extra);
            prop_assert!(!p.matches(&longer));
        }
    }
}
