//! Content negotiation: pick the representation a client prefers.
//!
//! [`Accept`] parses one or more `Accept` header values into weighted media
//! ranges and [`Accept::preferred`] ranks a resource's producible media types
//! against them:
//!
//! 1. every producible type takes the `q` of the most specific range naming it
//!    (`text/plain` beats `text/*` beats `*/*`);
//! 2. types with `q=0`, or named by no range, are not acceptable;
//! 3. candidates are ordered by `q` (descending), then by specificity of the
//!    matching range (descending), then by declaration order.
//!
//! Unparsable entries are skipped. A missing header, or one whose entries
//! are all unparsable, behaves as `*/*`.
//!
//! # Examples
//!
//! ```
//! use respcache::negotiate::{Accept, MediaType};
//!
//! let produces = [MediaType::text_plain(), MediaType::text_html()];
//!
//! let accept = Accept::parse(["text/html;q=0.5, text/plain"]);
//! assert_eq!(accept.preferred(&produces), Some(0));
//!
//! let accept = Accept::parse(["text/plain;q=0.5, text/html"]);
//! assert_eq!(accept.preferred(&produces), Some(1));
//!
//! let accept = Accept::parse(["application/json"]);
//! assert_eq!(accept.preferred(&produces), None);
//! ```

use std::cmp::Reverse;

use tracing::trace;

mod media_type;

pub use media_type::{MediaRange, MediaType, MediaTypeError, Specificity};

/// A `q` weight in thousandths, `0..=1000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quality(u16);

impl Quality {
    pub const MAX: Quality = Quality(1000);
    pub const ZERO: Quality = Quality(0);

    /// Parses a qvalue (`0`, `0.5`, `1.000`, …). At most three decimals.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let (int, frac) = match s.split_once('.') {
            Some((int, frac)) => (int, frac),
            None => (s, ""),
        };
        if frac.len() > 3 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let millis = match int {
            "0" => {
                let padded = format!("{frac:0<3}");
                padded.parse::<u16>().ok()?
            }
            "1" if frac.bytes().all(|b| b == b'0') => 1000,
            _ => return None,
        };
        Some(Self(millis))
    }

    pub fn as_millis(self) -> u16 {
        self.0
    }
}

/// One weighted entry of an `Accept` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptEntry {
    pub range: MediaRange,
    pub quality: Quality,
}

impl AcceptEntry {
    /// Parses `type/subtype;param=value;q=0.5;ext=...`.
    ///
    /// Parameters after `q` are accept-extensions and are dropped.
    pub fn parse(s: &str) -> Option<Self> {
        let (range_part, quality) = match find_q_param(s) {
            Some((range_part, q)) => (range_part, Quality::parse(q)?),
            None => (s, Quality::MAX),
        };
        let parts = media_type::parse_parts(range_part).ok()?;
        Some(Self {
            range: MediaRange::from_parts(parts.type_, parts.subtype, parts.params),
            quality,
        })
    }
}

// Splits an entry at its `q` parameter, returning the media range text before
// it and the raw qvalue.
fn find_q_param(s: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for segment in media_type::split_unquoted(s, ';') {
        let start = offset;
        offset += segment.len() + 1;
        if start == 0 {
            continue;
        }
        if let Some((name, value)) = segment.split_once('=')
            && name.trim().eq_ignore_ascii_case("q")
        {
            return Some((&s[..start - 1], value));
        }
    }
    None
}

/// A parsed `Accept` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    entries: Vec<AcceptEntry>,
}

impl Accept {
    /// `Accept: */*`, which is also what an absent header means.
    pub fn any() -> Self {
        Self {
            entries: vec![AcceptEntry {
                range: MediaRange::any(),
                quality: Quality::MAX,
            }],
        }
    }

    /// Parses every `Accept` header value of a request.
    ///
    /// Each value may itself be a comma-separated list. Commas inside quoted
    /// parameter values do not separate entries.
    pub fn parse<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut entries = Vec::new();
        for value in values {
            for raw in media_type::split_unquoted(value, ',') {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                match AcceptEntry::parse(raw) {
                    Some(entry) => entries.push(entry),
                    None => trace!(entry = raw, "ignoring unparsable Accept entry"),
                }
            }
        }

        if entries.is_empty() {
            Self::any()
        } else {
            Self { entries }
        }
    }

    pub fn entries(&self) -> &[AcceptEntry] {
        &self.entries
    }

    /// Weight and specificity of the most specific range naming `media_type`.
    fn weigh(&self, media_type: &MediaType) -> Option<(Quality, Specificity)> {
        self.entries
            .iter()
            .filter(|entry| entry.range.matches(media_type))
            .map(|entry| (entry.range.specificity(), entry.quality))
            .max()
            .map(|(specificity, quality)| (quality, specificity))
    }

    /// Returns the index into `producible` of the preferred media type, or
    /// `None` when nothing is acceptable.
    pub fn preferred(&self, producible: &[MediaType]) -> Option<usize> {
        producible
            .iter()
            .enumerate()
            .filter_map(|(index, media_type)| {
                let (quality, specificity) = self.weigh(media_type)?;
                (quality > Quality::ZERO).then_some((quality, specificity, Reverse(index)))
            })
            .max()
            .map(|(_, _, Reverse(index))| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produces() -> Vec<MediaType> {
        vec![MediaType::text_plain(), MediaType::text_html()]
    }

    fn pick(accept: &str) -> Option<usize> {
        Accept::parse([accept]).preferred(&produces())
    }

    #[test]
    fn quality_parsing() {
        assert_eq!(Quality::parse("1"), Some(Quality::MAX));
        assert_eq!(Quality::parse("1.000"), Some(Quality::MAX));
        assert_eq!(Quality::parse("0.5").map(Quality::as_millis), Some(500));
        assert_eq!(Quality::parse("0.05").map(Quality::as_millis), Some(50));
        assert_eq!(Quality::parse("0"), Some(Quality::ZERO));
        assert_eq!(Quality::parse("1.5"), None);
        assert_eq!(Quality::parse("0.1234"), None);
        assert_eq!(Quality::parse("abc"), None);
    }

    #[test]
    fn absent_header_takes_first_declared() {
        let accept = Accept::parse(std::iter::empty());
        assert_eq!(accept, Accept::any());
        assert_eq!(accept.preferred(&produces()), Some(0));
    }

    #[test]
    fn single_exact_type() {
        assert_eq!(pick("text/html"), Some(1));
        assert_eq!(pick("text/plain"), Some(0));
    }

    #[test]
    fn higher_quality_wins() {
        assert_eq!(pick("text/html;q=0.5, text/plain"), Some(0));
        assert_eq!(pick("text/plain;q=0.5, text/html"), Some(1));
    }

    #[test]
    fn specificity_breaks_quality_ties() {
        // Both q=1, but text/html is named exactly while text/plain only via */*.
        assert_eq!(pick("*/*, text/html"), Some(1));
    }

    #[test]
    fn declaration_order_breaks_full_ties() {
        assert_eq!(pick("text/*"), Some(0));
    }

    #[test]
    fn more_specific_range_overrides_wildcard() {
        // text/plain is explicitly refused even though text/* would allow it.
        assert_eq!(pick("text/*, text/plain;q=0"), Some(1));
    }

    #[test]
    fn all_zero_is_not_acceptable() {
        assert_eq!(pick("text/plain;q=0, text/html;q=0"), None);
        assert_eq!(pick("*/*;q=0"), None);
    }

    #[test]
    fn unmatched_is_not_acceptable() {
        assert_eq!(pick("application/json"), None);
    }

    #[test]
    fn garbage_entries_are_ignored() {
        assert_eq!(pick("garbage, text/html;q=nope, text/html;q=0.4"), Some(1));
        // Nothing parsable at all: treated as absent.
        assert_eq!(pick(";;;, ///"), Some(0));
    }

    #[test]
    fn accept_extensions_after_q_are_dropped() {
        let entry = AcceptEntry::parse("text/html;level=1;q=0.7;ext=foo").unwrap();
        assert_eq!(entry.quality.as_millis(), 700);
        assert_eq!(entry.range.to_string(), "text/html;level=1");
    }

    #[test]
    fn quoted_commas_stay_inside_their_entry() {
        let accept = Accept::parse([r#"text/plain;foo="a,b";q=0.4, text/html;q=0.5"#]);
        assert_eq!(accept.entries().len(), 2);
        assert_eq!(accept.entries()[0].range.to_string(), "text/plain;foo=a,b");
        assert_eq!(accept.entries()[0].quality.as_millis(), 400);
        assert_eq!(accept.preferred(&produces()), Some(1));
    }

    #[test]
    fn quoted_semicolons_do_not_split_parameters() {
        let accept = Accept::parse([r#"text/plain;note="x;q=0";level=1"#]);
        assert_eq!(accept.entries().len(), 1);
        assert_eq!(accept.entries()[0].quality, Quality::MAX);
    }

    #[test]
    fn multiple_header_values_are_merged() {
        let accept = Accept::parse(["text/plain;q=0.2", "text/html;q=0.9"]);
        assert_eq!(accept.entries().len(), 2);
        assert_eq!(accept.preferred(&produces()), Some(1));
    }
}
