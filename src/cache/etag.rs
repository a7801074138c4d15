//! Entity tags and `If-None-Match` evaluation.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An opaque validator for one representation's content.
///
/// # Examples
///
/// ```
/// use respcache::cache::EntityTag;
///
/// let tag = EntityTag::from_content(b"Hello World 1");
/// assert!(!tag.is_weak());
/// assert_eq!(tag, EntityTag::from_content(b"Hello World 1"));
/// assert_ne!(tag, EntityTag::from_content(b"Hello World 2"));
///
/// let weak = EntityTag::parse("W/\"v1\"").unwrap();
/// assert!(weak.weak_eq(&EntityTag::strong("v1")));
/// assert_eq!(weak.to_string(), "W/\"v1\"");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityTag {
    weak: bool,
    opaque: String,
}

impl EntityTag {
    pub fn strong(opaque: impl Into<String>) -> Self {
        Self {
            weak: false,
            opaque: opaque.into(),
        }
    }

    pub fn weak(opaque: impl Into<String>) -> Self {
        Self {
            weak: true,
            opaque: opaque.into(),
        }
    }

    /// A strong tag derived from the body: the first 16 bytes of its SHA-256,
    /// hex encoded.
    pub fn from_content(body: &[u8]) -> Self {
        let hash = Sha256::digest(body);
        Self::strong(hex::encode(&hash[..16]))
    }

    /// Parses a single `"opaque"` or `W/"opaque"` value.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (weak, quoted) = match s.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let opaque = quoted.strip_prefix('"')?.strip_suffix('"')?;
        if opaque.contains('"') {
            return None;
        }
        Some(Self {
            weak,
            opaque: opaque.to_owned(),
        })
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn opaque(&self) -> &str {
        &self.opaque
    }

    /// Weak comparison: opaque values match, weakness ignored.
    pub fn weak_eq(&self, other: &Self) -> bool {
        self.opaque == other.opaque
    }

    /// Strong comparison: both strong and opaque values match.
    pub fn strong_eq(&self, other: &Self) -> bool {
        !self.weak && !other.weak && self.opaque == other.opaque
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            f.write_str("W/")?;
        }
        write!(f, "\"{}\"", self.opaque)
    }
}

impl TryFrom<String> for EntityTag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("malformed entity tag `{value}`"))
    }
}

impl From<EntityTag> for String {
    fn from(value: EntityTag) -> Self {
        value.to_string()
    }
}

/// A parsed `If-None-Match` precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfNoneMatch {
    /// `*`: any current representation matches.
    Any,
    Tags(Vec<EntityTag>),
}

impl IfNoneMatch {
    /// Parses every `If-None-Match` value of a request.
    ///
    /// Malformed members are skipped. Returns `None` when no value yields a
    /// usable member, in which case the precondition is treated as absent.
    pub fn parse<'a, I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tags = Vec::new();
        for value in values {
            let mut rest = value;
            loop {
                rest = rest.trim_start_matches(|c: char| c == ',' || c.is_ascii_whitespace());
                if rest.is_empty() {
                    break;
                }
                if let Some(after) = rest.strip_prefix('*')
                    && (after.trim_start().is_empty() || after.trim_start().starts_with(','))
                {
                    return Some(Self::Any);
                }
                let (member, remaining) = next_member(rest);
                if let Some(tag) = EntityTag::parse(member) {
                    tags.push(tag);
                }
                rest = remaining;
            }
        }
        (!tags.is_empty()).then_some(Self::Tags(tags))
    }

    /// Whether the current tag satisfies the precondition, using weak
    /// comparison.
    pub fn matches(&self, current: &EntityTag) -> bool {
        match self {
            Self::Any => true,
            Self::Tags(tags) => tags.iter().any(|tag| tag.weak_eq(current)),
        }
    }
}

// Splits off one list member. Quoted opaque values may contain commas.
fn next_member(s: &str) -> (&str, &str) {
    let quote_start = if s.starts_with("W/\"") {
        Some(2)
    } else if s.starts_with('"') {
        Some(0)
    } else {
        None
    };

    let end = match quote_start {
        Some(start) => match s[start + 1..].find('"') {
            Some(close) => start + 1 + close + 1,
            None => s.len(),
        },
        None => s.find(',').unwrap_or(s.len()),
    };
    (&s[..end], &s[end..])
}
