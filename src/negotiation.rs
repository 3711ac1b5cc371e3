// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Content Negotiation
//!
//! Parses a content type expression such as
//! `application/vnd.carrot+json;q=0.8, application/json` into candidate media
//! types ordered by quality weight, the way an HTTP `Accept` header is read.
//! The serializer registry walks the candidates in that order.

use crate::errors::AmqpError;
use std::{cmp::Ordering, fmt, str::FromStr};

const DEFAULT_QUALITY: f32 = 1.0;
const VENDOR_PREFIX: &str = "vnd.";

/// Turns a content type expression into quality-ordered candidates.
pub trait ContentNegotiator: Send + Sync {
    /// Returns one entry per comma separated candidate, ordered by descending
    /// quality. Candidates with the same quality keep their original order.
    fn negotiate(&self, content_type: &str) -> Result<Vec<MediaTypeHeader>, AmqpError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContentNegotiator;

impl ContentNegotiator for DefaultContentNegotiator {
    fn negotiate(&self, content_type: &str) -> Result<Vec<MediaTypeHeader>, AmqpError> {
        let mut headers = content_type
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(MediaTypeHeader::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        // sort_by is stable, ties keep their left-to-right order
        headers.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(Ordering::Equal)
        });

        Ok(headers)
    }
}

/// A negotiated media type and its quality weight.
///
/// Equality ignores the quality: `application/json;q=0.1` and
/// `application/json` name the same media type.
#[derive(Debug, Clone)]
pub struct MediaTypeHeader {
    pub media_type: MediaType,
    pub quality: f32,
}

impl FromStr for MediaTypeHeader {
    type Err = AmqpError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut media_type = None;
        let mut quality = DEFAULT_QUALITY;

        for param in source.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(weight) = quality_param(param) {
                quality = parse_quality(weight).ok_or_else(|| {
                    AmqpError::InvalidQuality(param.to_owned())
                })?;
            } else if !param.contains('=') {
                media_type = Some(param.parse::<MediaType>()?);
            }
        }

        match media_type {
            Some(media_type) => Ok(MediaTypeHeader {
                media_type,
                quality,
            }),
            None => Err(AmqpError::InvalidMediaType(source.to_owned())),
        }
    }
}

fn quality_param(param: &str) -> Option<&str> {
    param
        .strip_prefix('q')
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::trim)
}

fn parse_quality(weight: &str) -> Option<f32> {
    weight
        .parse::<f32>()
        .ok()
        .filter(|q| q.is_finite() && *q >= 0.0)
}

impl PartialEq for MediaTypeHeader {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type
    }
}

impl Eq for MediaTypeHeader {}

impl fmt::Display for MediaTypeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};q={}", self.media_type, self.quality)
    }
}

/// A media type, e.g. `application/vnd.carrot+json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    pub kind: String,
    pub registration_tree: Option<RegistrationTree>,
}

impl FromStr for MediaType {
    type Err = AmqpError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let parts = source
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        match parts.as_slice() {
            [] => Err(AmqpError::InvalidMediaType(source.to_owned())),
            [kind] => Ok(MediaType {
                kind: (*kind).to_owned(),
                registration_tree: None,
            }),
            [kind, subtype, ..] => Ok(MediaType {
                kind: (*kind).to_owned(),
                registration_tree: Some(RegistrationTree::parse(subtype)),
            }),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registration_tree {
            Some(tree) => write!(f, "{}/{}", self.kind, tree),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl PartialEq<str> for MediaType {
    fn eq(&self, other: &str) -> bool {
        other
            .parse::<MediaType>()
            .map(|media_type| *self == media_type)
            .unwrap_or(false)
    }
}

impl PartialEq<&str> for MediaType {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

/// The subtype registration tree of a media type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationTree {
    /// `vnd.<name>[+suffix]`
    Vendor { name: String, suffix: Option<String> },
    /// `<name>[+suffix]`
    Standard { name: String, suffix: Option<String> },
}

impl RegistrationTree {
    fn parse(source: &str) -> RegistrationTree {
        let (name, suffix) = match source.split_once('+') {
            Some((name, suffix)) => (name, Some(suffix.to_owned())),
            None => (source, None),
        };

        match name.strip_prefix(VENDOR_PREFIX) {
            Some(name) => RegistrationTree::Vendor {
                name: name.to_owned(),
                suffix,
            },
            None => RegistrationTree::Standard {
                name: name.to_owned(),
                suffix,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RegistrationTree::Vendor { name, .. } | RegistrationTree::Standard { name, .. } => name,
        }
    }

    pub fn suffix(&self) -> Option<&str> {
        match self {
            RegistrationTree::Vendor { suffix, .. } | RegistrationTree::Standard { suffix, .. } => {
                suffix.as_deref()
            }
        }
    }
}

impl fmt::Display for RegistrationTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let RegistrationTree::Vendor { .. } = self {
            write!(f, "{}", VENDOR_PREFIX)?;
        }

        match self.suffix() {
            Some(suffix) => write!(f, "{}+{}", self.name(), suffix),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(content_type: &str) -> Vec<MediaTypeHeader> {
        DefaultContentNegotiator.negotiate(content_type).unwrap()
    }

    #[test]
    fn orders_candidates_by_descending_quality() {
        let headers = negotiate("text/plain;q=0.2, application/xml;q=0.9, application/json");

        let names = headers
            .iter()
            .map(|h| h.media_type.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["application/json", "application/xml", "text/plain"]);
        assert_eq!(headers[0].quality, 1.0);
        assert_eq!(headers[2].quality, 0.2);
    }

    #[test]
    fn keeps_original_order_on_equal_quality() {
        let headers = negotiate("application/xml;q=0.5, text/csv, application/json;q=0.5, text/plain");

        let names = headers
            .iter()
            .map(|h| h.media_type.to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["text/csv", "text/plain", "application/xml", "application/json"]
        );
    }

    #[test]
    fn keeps_duplicate_candidates() {
        let headers = negotiate("application/json;q=0.3, application/json");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], headers[1]);
    }

    #[test]
    fn parses_vendor_tree_with_suffix() {
        let header = negotiate("application/vnd.carrot+json").remove(0);

        assert_eq!(header.media_type.kind, "application");
        assert_eq!(
            header.media_type.registration_tree,
            Some(RegistrationTree::Vendor {
                name: "carrot".to_owned(),
                suffix: Some("json".to_owned()),
            })
        );
        assert_eq!(header.media_type.to_string(), "application/vnd.carrot+json");
    }

    #[test]
    fn parses_standard_tree() {
        let header = negotiate("image/svg+xml").remove(0);

        assert_eq!(
            header.media_type.registration_tree,
            Some(RegistrationTree::Standard {
                name: "svg".to_owned(),
                suffix: Some("xml".to_owned()),
            })
        );
    }

    #[test]
    fn ignores_non_quality_parameters() {
        let header = negotiate("application/json; charset=utf-8; q=0.7").remove(0);

        assert!(header.media_type == "application/json");
        assert_eq!(header.quality, 0.7);
    }

    #[test]
    fn media_type_starting_with_q_is_not_a_weight() {
        let header = negotiate("quux/plain").remove(0);
        assert_eq!(header.media_type.kind, "quux");
    }

    #[test]
    fn equality_ignores_quality() {
        let a: MediaTypeHeader = "application/json;q=0.1".parse().unwrap();
        let b: MediaTypeHeader = "application/json".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_quality() {
        let result = DefaultContentNegotiator.negotiate("application/json;q=high");
        assert_eq!(
            result.unwrap_err(),
            AmqpError::InvalidQuality("q=high".to_owned())
        );

        for weight in ["q=-0.5", "q=NaN", "q=inf", "q="] {
            assert!(DefaultContentNegotiator
                .negotiate(&format!("application/json;{weight}"))
                .is_err());
        }
    }

    #[test]
    fn weights_above_one_are_ranked_first() {
        let headers = negotiate("application/json, text/plain;q=1.5");

        assert_eq!(headers[0].media_type, "text/plain");
        assert_eq!(headers[0].quality, 1.5);
    }

    #[test]
    fn rejects_segment_without_media_type() {
        assert!(matches!(
            DefaultContentNegotiator.negotiate(";q=0.5"),
            Err(AmqpError::InvalidMediaType(_))
        ));
    }

    #[test]
    fn empty_expression_has_no_candidates() {
        assert!(negotiate("").is_empty());
        assert!(negotiate(" , ").is_empty());
    }
}
