//! Routing-key patterns.
//!
//! Event names are dot-separated segments (`item.created`). A pattern is an
//! event name where:
//! - a `*` segment matches exactly one non-empty segment
//! - a `*` inside a segment globs within that segment (`item.creat*`)
//! - a `#` segment matches zero or more segments
//!
//! These are the topic-exchange rules, so in-process resolution agrees with
//! what the broker routes to the queue.

use regex::Regex;
use std::fmt;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    /// `*` on its own
    Any,
    /// `#` on its own
    Rest,
    /// a segment with an embedded `*`
    Glob(Regex),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        match raw {
            "*" => Segment::Any,
            "#" => Segment::Rest,
            s if s.contains('*') => {
                let body = s
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join("[^.]*");
                match Regex::new(&format!("^{body}$")) {
                    Ok(regex) => Segment::Glob(regex),
                    // escaped input always compiles; fall back to exact match
                    Err(_) => Segment::Literal(s.to_string()),
                }
            }
            s => Segment::Literal(s.to_string()),
        }
    }

    fn matches(&self, part: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == part,
            Segment::Any => !part.is_empty(),
            Segment::Glob(regex) => regex.is_match(part),
            Segment::Rest => true,
        }
    }
}

/// A compiled event-name pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = raw.split('.').map(Segment::parse).collect();
        Self { raw, segments }
    }

    /// Whether `raw` contains wildcard syntax.
    pub fn is_wildcard(raw: &str) -> bool {
        raw.contains('*') || raw.split('.').any(|segment| segment == "#")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `event` is routed by this pattern.
    pub fn matches(&self, event: &str) -> bool {
        let parts: Vec<&str> = event.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> bool {
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::Rest, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((segment, rest)) => match parts.split_first() {
            Some((part, remaining)) => segment.matches(part) && match_segments(rest, remaining),
            None => false,
        },
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
