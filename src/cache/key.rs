//! Resource identities and the variant keys that select among cached
//! representations of one resource.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::http::{Headers, Request};
use crate::negotiate::MediaType;

/// The addressable resource a request targets: its normalized path.
///
/// Trailing slashes are dropped (except for `/` itself) and repeated slashes
/// collapse, so `/cache/` and `//cache` name the same resource as `/cache`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentity(String);

impl ResourceIdentity {
    pub fn new(path: &str) -> Self {
        let mut normalized = String::with_capacity(path.len() + 1);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            normalized.push('/');
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Self(normalized)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.path())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request's values for each declared vary header, in declaration order.
///
/// Header names are lowercased; values are copied verbatim. An absent header
/// contributes no values, which keeps it distinct from a header sent empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaryVector(Vec<(String, Vec<String>)>);

impl VaryVector {
    pub fn from_headers(declared: &[String], headers: &Headers) -> Self {
        Self(
            declared
                .iter()
                .map(|name| {
                    let values = headers.get_all(name).map(str::to_owned).collect();
                    (name.to_ascii_lowercase(), values)
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(name, values)| (name.as_str(), values.as_slice()))
    }
}

/// Identifies one stored variant of a resource.
///
/// Two requests share a variant exactly when they negotiate the same media
/// type, carry the same canonical query and send the same values for every
/// declared vary header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    media_type: MediaType,
    query: Option<String>,
    vary: VaryVector,
}

impl VariantKey {
    pub fn new(media_type: MediaType, query: Option<String>, vary: VaryVector) -> Self {
        Self {
            media_type,
            query,
            vary,
        }
    }

    /// Builds the key for `request` once negotiation has settled on
    /// `media_type`.
    pub fn build(media_type: MediaType, vary_declaration: &[String], request: &Request) -> Self {
        Self::new(
            media_type,
            request.canonical_query(),
            VaryVector::from_headers(vary_declaration, request.headers()),
        )
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn vary(&self) -> &VaryVector {
        &self.vary
    }

    /// A deterministic serialized form, stable across processes.
    pub fn storage_key(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
