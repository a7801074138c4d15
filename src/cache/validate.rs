//! Classifies a lookup into a cache outcome.
//!
//! | stored record | conditional matches | fresh | outcome        |
//! |---------------|---------------------|-------|----------------|
//! | none          | -                   | -     | `NoVariant`    |
//! | some          | yes                 | any   | `ValidatorHit` |
//! | some          | no                  | yes   | `FreshHit`     |
//! | some          | no                  | no    | `StaleMiss`    |
//!
//! A matching validator wins over expiry: the client already holds the
//! current bytes, so a `304` is correct even for a stale record.

use std::fmt;
use std::time::SystemTime;

use super::etag::{EntityTag, IfNoneMatch};
use super::record::VariantRecord;
use crate::http::Headers;
use crate::http::headers::names;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    FreshHit,
    ValidatorHit,
    StaleMiss,
    NoVariant,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreshHit => "fresh_hit",
            Self::ValidatorHit => "validator_hit",
            Self::StaleMiss => "stale_miss",
            Self::NoVariant => "no_variant",
        }
    }

    /// Whether the handler must run to answer the request.
    pub fn needs_recompute(self) -> bool {
        matches!(self, Self::StaleMiss | Self::NoVariant)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The client's cache validators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    if_none_match: Option<IfNoneMatch>,
    if_modified_since: Option<SystemTime>,
}

impl Conditions {
    pub fn new(if_none_match: Option<IfNoneMatch>, if_modified_since: Option<SystemTime>) -> Self {
        Self {
            if_none_match,
            if_modified_since,
        }
    }

    /// Malformed validators are ignored.
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            if_none_match: IfNoneMatch::parse(headers.get_all(names::IF_NONE_MATCH)),
            if_modified_since: headers
                .get(names::IF_MODIFIED_SINCE)
                .and_then(|v| httpdate::parse_http_date(v).ok()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }

    /// Whether the client's copy is current. `If-Modified-Since` is only
    /// consulted when no `If-None-Match` was sent.
    pub fn not_modified(&self, etag: &EntityTag, last_modified: Option<SystemTime>) -> bool {
        if let Some(if_none_match) = &self.if_none_match {
            return if_none_match.matches(etag);
        }
        match (self.if_modified_since, last_modified) {
            (Some(since), Some(modified)) => modified <= since,
            _ => false,
        }
    }
}

pub fn evaluate(record: Option<&VariantRecord>, conditions: &Conditions, now: SystemTime) -> Outcome {
    let Some(record) = record else {
        return Outcome::NoVariant;
    };
    if conditions.not_modified(record.etag(), record.last_modified()) {
        Outcome::ValidatorHit
    } else if record.is_fresh(now) {
        Outcome::FreshHit
    } else {
        Outcome::StaleMiss
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use bytes::Bytes;

    use super::*;
    use crate::negotiate::MediaType;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn record() -> VariantRecord {
        VariantRecord::new(
            Bytes::from_static(b"Hello World 1"),
            MediaType::text_plain(),
            at(100),
            Duration::from_secs(2),
        )
        .with_last_modified(Some(at(90)))
    }

    fn matching() -> Conditions {
        Conditions::new(
            Some(IfNoneMatch::Tags(vec![record().etag().clone()])),
            None,
        )
    }

    #[test]
    fn only_misses_recompute() {
        assert!(!Outcome::FreshHit.needs_recompute());
        assert!(!Outcome::ValidatorHit.needs_recompute());
        assert!(Outcome::StaleMiss.needs_recompute());
        assert!(Outcome::NoVariant.needs_recompute());
    }

    #[test]
    fn no_record() {
        assert_eq!(
            evaluate(None, &Conditions::default(), at(0)),
            Outcome::NoVariant
        );
        assert_eq!(evaluate(None, &matching(), at(0)), Outcome::NoVariant);
    }

    #[test]
    fn fresh_and_stale() {
        let record = record();
        let none = Conditions::default();
        assert_eq!(evaluate(Some(&record), &none, at(101)), Outcome::FreshHit);
        assert_eq!(evaluate(Some(&record), &none, at(102)), Outcome::StaleMiss);
    }

    #[test]
    fn validator_ignores_expiry() {
        let record = record();
        assert_eq!(evaluate(Some(&record), &matching(), at(101)), Outcome::ValidatorHit);
        assert_eq!(evaluate(Some(&record), &matching(), at(500)), Outcome::ValidatorHit);
    }

    #[test]
    fn mismatched_tag_falls_through() {
        let record = record();
        let other = Conditions::new(Some(IfNoneMatch::Tags(vec![EntityTag::strong("old")])), None);
        assert_eq!(evaluate(Some(&record), &other, at(100)), Outcome::FreshHit);
        assert_eq!(evaluate(Some(&record), &other, at(200)), Outcome::StaleMiss);
    }

    #[test]
    fn if_modified_since() {
        let record = record();
        let since_after = Conditions::new(None, Some(at(95)));
        assert_eq!(evaluate(Some(&record), &since_after, at(300)), Outcome::ValidatorHit);
        let since_before = Conditions::new(None, Some(at(80)));
        assert_eq!(evaluate(Some(&record), &since_before, at(300)), Outcome::StaleMiss);
    }

    #[test]
    fn if_none_match_takes_precedence() {
        let record = record();
        let conditions = Conditions::new(
            Some(IfNoneMatch::Tags(vec![EntityTag::strong("old")])),
            Some(at(95)),
        );
        assert!(!conditions.not_modified(record.etag(), record.last_modified()));
    }

    #[test]
    fn parses_request_headers() {
        let mut headers = Headers::new();
        headers.insert("If-None-Match", "garbage");
        headers.insert("If-Modified-Since", "not a date");
        assert!(Conditions::from_headers(&headers).is_empty());

        let mut headers = Headers::new();
        headers.insert("if-none-match", "*");
        let conditions = Conditions::from_headers(&headers);
        assert!(conditions.not_modified(&EntityTag::strong("x"), None));
    }
}
