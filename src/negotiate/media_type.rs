//! Media types (`type/subtype; param=value`) and Accept media ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when a media type string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaTypeError {
    #[error("media type `{0}` is missing a `/`")]
    MissingSlash(String),

    #[error("media type `{0}` has an invalid type or subtype token")]
    InvalidToken(String),

    #[error("media type `{0}` may not contain wildcards")]
    Wildcard(String),

    #[error("media type `{0}` has a malformed parameter")]
    InvalidParameter(String),
}

/// A concrete media type a resource can produce, e.g. `text/plain; charset=utf-8`.
///
/// Type, subtype and parameter names are stored lowercase; parameter values
/// keep their case. Serializes as its string form.
///
/// # Examples
///
/// ```
/// use respcache::negotiate::MediaType;
///
/// let mt: MediaType = "Text/HTML; charset=UTF-8".parse().unwrap();
/// assert_eq!(mt.essence(), "text/html");
/// assert_eq!(mt.param("charset"), Some("UTF-8"));
/// assert_eq!(mt.to_string(), "text/html; charset=UTF-8");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaType {
    type_: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// Creates a parameterless media type. Both parts are lowercased.
    ///
    /// # Errors
    ///
    /// Fails when either part is not an RFC 9110 token or is `*`.
    pub fn new(type_: &str, subtype: &str) -> Result<Self, MediaTypeError> {
        format!("{type_}/{subtype}").parse()
    }

    /// `text/plain`.
    pub fn text_plain() -> Self {
        Self::from_static("text", "plain")
    }

    /// `text/html`.
    pub fn text_html() -> Self {
        Self::from_static("text", "html")
    }

    /// `application/json`.
    pub fn application_json() -> Self {
        Self::from_static("application", "json")
    }

    fn from_static(type_: &'static str, subtype: &'static str) -> Self {
        Self {
            type_: type_.to_owned(),
            subtype: subtype.to_owned(),
            params: Vec::new(),
        }
    }

    /// Returns the top-level type, e.g. `text`.
    pub fn type_(&self) -> &str {
        &self.type_
    }

    /// Returns the subtype, e.g. `plain`.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Returns `type/subtype` without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.type_, self.subtype)
    }

    /// Returns a parameter value by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all parameters in declaration order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = parse_parts(s)?;
        if parts.type_ == "*" || parts.subtype == "*" {
            return Err(MediaTypeError::Wildcard(s.to_owned()));
        }
        Ok(Self {
            type_: parts.type_,
            subtype: parts.subtype,
            params: parts.params,
        })
    }
}

impl TryFrom<String> for MediaType {
    type Error = MediaTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MediaType> for String {
    fn from(value: MediaType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)?;
        for (k, v) in &self.params {
            write!(f, "; {k}={v}")?;
        }
        Ok(())
    }
}

/// How closely a media range names a media type. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specificity {
    /// `*/*`
    Any,
    /// `type/*`
    Type,
    /// `type/subtype`
    Exact,
    /// `type/subtype;param=value`
    ExactWithParams,
}

/// One media range of an `Accept` header, without its `q` weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRange {
    type_: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl MediaRange {
    /// The `*/*` range.
    pub fn any() -> Self {
        Self {
            type_: "*".to_owned(),
            subtype: "*".to_owned(),
            params: Vec::new(),
        }
    }

    pub(crate) fn from_parts(type_: String, subtype: String, params: Vec<(String, String)>) -> Self {
        Self {
            type_,
            subtype,
            params,
        }
    }

    pub fn specificity(&self) -> Specificity {
        match (self.type_.as_str(), self.subtype.as_str()) {
            ("*", _) => Specificity::Any,
            (_, "*") => Specificity::Type,
            _ if self.params.is_empty() => Specificity::Exact,
            _ => Specificity::ExactWithParams,
        }
    }

    /// Returns `true` when `media_type` falls inside this range. Range
    /// parameters must all be present, with equal values, on the media type.
    pub fn matches(&self, media_type: &MediaType) -> bool {
        if self.type_ == "*" {
            return true;
        }
        if self.type_ != media_type.type_ {
            return false;
        }
        if self.subtype == "*" {
            return true;
        }
        self.subtype == media_type.subtype
            && self
                .params
                .iter()
                .all(|(k, v)| media_type.param(k).is_some_and(|mv| mv.eq_ignore_ascii_case(v)))
    }
}

impl fmt::Display for MediaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.subtype)?;
        for (k, v) in &self.params {
            write!(f, ";{k}={v}")?;
        }
        Ok(())
    }
}

pub(crate) struct Parts {
    pub(crate) type_: String,
    pub(crate) subtype: String,
    pub(crate) params: Vec<(String, String)>,
}

/// Splits `s` at every `sep` outside a quoted string. Backslash escapes
/// inside quotes are honoured.
pub(crate) fn split_unquoted(s: &str, sep: char) -> impl Iterator<Item = &str> {
    let mut rest = Some(s);
    std::iter::from_fn(move || {
        let current = rest?;
        let mut quoted = false;
        let mut escaped = false;
        for (i, c) in current.char_indices() {
            match c {
                _ if escaped => escaped = false,
                '\\' if quoted => escaped = true,
                '"' => quoted = !quoted,
                c if c == sep && !quoted => {
                    rest = Some(&current[i + c.len_utf8()..]);
                    return Some(&current[..i]);
                }
                _ => {}
            }
        }
        rest = None;
        Some(current)
    })
}

/// Splits `type/subtype;k=v;...` into lowercase type/subtype and trimmed parameters.
pub(crate) fn parse_parts(s: &str) -> Result<Parts, MediaTypeError> {
    let mut segments = split_unquoted(s, ';');
    let essence = segments.next().unwrap_or_default().trim();

    let (type_, subtype) = essence
        .split_once('/')
        .ok_or_else(|| MediaTypeError::MissingSlash(s.to_owned()))?;
    let (type_, subtype) = (type_.trim(), subtype.trim());

    if !is_token(type_) || !is_token(subtype) || (type_ == "*" && subtype != "*") {
        return Err(MediaTypeError::InvalidToken(s.to_owned()));
    }

    let mut params = Vec::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment
            .split_once('=')
            .ok_or_else(|| MediaTypeError::InvalidParameter(s.to_owned()))?;
        let name = name.trim();
        let value = value.trim().trim_matches('"');
        if !is_token(name) {
            return Err(MediaTypeError::InvalidParameter(s.to_owned()));
        }
        params.push((name.to_ascii_lowercase(), value.to_owned()));
    }

    Ok(Parts {
        type_: type_.to_ascii_lowercase(),
        subtype: subtype.to_ascii_lowercase(),
        params,
    })
}

// RFC 9110 §5.6.2 tchar.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}
