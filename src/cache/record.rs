use std::time::{Duration, SystemTime};

use bytes::Bytes;

use super::etag::EntityTag;
use crate::http::headers::names;
use crate::http::{Headers, Response};
use crate::negotiate::MediaType;

// Headers the cache derives itself or that only describe one connection.
const NOT_REPLAYED: &[&str] = &[
    names::CACHE_CONTROL,
    names::CONNECTION,
    names::CONTENT_LENGTH,
    names::CONTENT_TYPE,
    names::ETAG,
    names::LAST_MODIFIED,
    names::VARY,
    names::AGE,
];

/// One stored representation of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRecord {
    body: Bytes,
    media_type: MediaType,
    etag: EntityTag,
    created_at: SystemTime,
    max_age: Duration,
    last_modified: Option<SystemTime>,
    headers: Headers,
}

impl VariantRecord {
    /// Creates a record whose entity tag is derived from `body`.
    pub fn new(body: Bytes, media_type: MediaType, created_at: SystemTime, max_age: Duration) -> Self {
        let etag = EntityTag::from_content(&body);
        Self {
            body,
            media_type,
            etag,
            created_at,
            max_age,
            last_modified: None,
            headers: Headers::new(),
        }
    }

    /// Captures a handler's `200` response.
    ///
    /// A parsable `Content-Type`, `ETag` or `Last-Modified` set by the handler
    /// wins over the derived value. Other end-to-end headers are kept for
    /// replay on hits.
    pub fn from_response(
        response: Response,
        negotiated: &MediaType,
        max_age: Duration,
        now: SystemTime,
    ) -> Self {
        let (_, headers, body) = response.into_parts();

        let media_type = headers
            .get(names::CONTENT_TYPE)
            .and_then(|v| v.parse::<MediaType>().ok())
            .unwrap_or_else(|| negotiated.clone());
        let etag = headers
            .get(names::ETAG)
            .and_then(EntityTag::parse)
            .unwrap_or_else(|| EntityTag::from_content(&body));
        let last_modified = headers
            .get(names::LAST_MODIFIED)
            .and_then(|v| httpdate::parse_http_date(v).ok());
        let replayed = headers
            .iter()
            .filter(|(name, _)| !NOT_REPLAYED.iter().any(|skip| skip.eq_ignore_ascii_case(name)))
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();

        Self {
            body,
            media_type,
            etag,
            created_at: now,
            max_age,
            last_modified,
            headers: replayed,
        }
    }

    #[must_use]
    pub fn with_etag(mut self, etag: EntityTag) -> Self {
        self.etag = etag;
        self
    }

    #[must_use]
    pub fn with_last_modified(mut self, last_modified: Option<SystemTime>) -> Self {
        self.last_modified = last_modified;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn etag(&self) -> &EntityTag {
        &self.etag
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// End-to-end headers replayed on every hit.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Time since creation. A clock that moved backwards yields zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.created_at).unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.age(now) < self.max_age
    }

    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.max_age.saturating_sub(self.age(now))
    }

    /// When the record stops being fresh. `None` if that lies beyond what
    /// `SystemTime` can represent.
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.created_at.checked_add(self.max_age)
    }
}
