//! Declarative field-strip paths.
//!
//! Grammar, segments separated by `.` outside brackets:
//!
//! | Segment    | Meaning                                                 |
//! |------------|---------------------------------------------------------|
//! | `name`     | map field `name`                                        |
//! | `name[]`   | every element of the list at `name` (must not be last)  |
//! | `name[key]`| the single key `key` of the map at `name` (must be last)|
//!
//! Keys inside brackets may contain dots, so
//! `metadata.annotations[kubectl.kubernetes.io/last-applied-configuration]`
//! parses to two segments. Applying a path never fails: a missing or
//! non-container intermediate stops the traversal silently.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// One parsed segment of a [`StripPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    ArrayWildcard(String),
    KeyedField { field: String, key: String },
}

/// Why a strip path failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathParseError {
    Empty,
    EmptySegment { position: usize },
    UnterminatedBracket,
    TrailingAfterBracket { segment: String },
    WildcardAtEnd,
    KeyNotLast,
}

impl fmt::Display for PathParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "path is empty"),
            Self::EmptySegment { position } => write!(f, "empty segment at position {position}"),
            Self::UnterminatedBracket => write!(f, "unterminated '['"),
            Self::TrailingAfterBracket { segment } => {
                write!(f, "unexpected characters after ']' in '{segment}'")
            }
            Self::WildcardAtEnd => write!(f, "'[]' must be followed by a field"),
            Self::KeyNotLast => write!(f, "'[key]' is only allowed in the last segment"),
        }
    }
}

impl std::error::Error for PathParseError {}

/// A parsed, reusable field-strip path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripPath {
    raw: String,
    segments: Vec<Segment>,
}

impl StripPath {
    pub fn parse(raw: &str) -> Result<Self, PathParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PathParseError::Empty);
        }

        let parts = split_outside_brackets(raw)?;
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let segment = parse_segment(part, i)?;
            match &segment {
                Segment::ArrayWildcard(_) if i == last => {
                    return Err(PathParseError::WildcardAtEnd)
                }
                Segment::KeyedField { .. } if i != last => return Err(PathParseError::KeyNotLast),
                _ => {}
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Remove whatever this path addresses from `document`.
    ///
    /// Returns the number of fields removed (0 when nothing matched).
    pub fn apply(&self, document: &mut Value) -> usize {
        remove_at(document, &self.segments)
    }
}

impl FromStr for StripPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StripPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_outside_brackets(raw: &str) -> Result<Vec<&str>, PathParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in raw.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PathParseError::UnterminatedBracket);
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

fn parse_segment(part: &str, position: usize) -> Result<Segment, PathParseError> {
    let Some(open) = part.find('[') else {
        if part.is_empty() {
            return Err(PathParseError::EmptySegment { position });
        }
        return Ok(Segment::Field(part.to_string()));
    };

    let field = &part[..open];
    if field.is_empty() {
        return Err(PathParseError::EmptySegment { position });
    }
    let close = part
        .rfind(']')
        .filter(|&c| c > open)
        .ok_or(PathParseError::UnterminatedBracket)?;
    if close != part.len() - 1 {
        return Err(PathParseError::TrailingAfterBracket {
            segment: part.to_string(),
        });
    }

    let key = &part[open + 1..close];
    if key.is_empty() {
        Ok(Segment::ArrayWildcard(field.to_string()))
    } else {
        Ok(Segment::KeyedField {
            field: field.to_string(),
            key: key.to_string(),
        })
    }
}

fn remove_at(current: &mut Value, segments: &[Segment]) -> usize {
    let Some((head, rest)) = segments.split_first() else {
        return 0;
    };
    let Some(map) = current.as_object_mut() else {
        return 0;
    };

    match head {
        Segment::Field(name) if rest.is_empty() => usize::from(map.remove(name).is_some()),
        Segment::Field(name) => map.get_mut(name).map_or(0, |next| remove_at(next, rest)),
        Segment::ArrayWildcard(name) => match map.get_mut(name) {
            Some(Value::Array(items)) => items.iter_mut().map(|item| remove_at(item, rest)).sum(),
            _ => 0,
        },
        Segment::KeyedField { field, key } => match map.get_mut(field) {
            Some(Value::Object(inner)) => usize::from(inner.remove(key).is_some()),
            _ => 0,
        },
    }
}
