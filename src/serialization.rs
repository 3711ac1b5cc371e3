// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Serialization
//!
//! Serializers convert message bodies to and from a format-neutral
//! [`serde_json::Value`]; the message binding then decodes that value into
//! the bound runtime type. The [`SerializationConfiguration`] maps negotiated
//! media types to serializers, first match wins.

use crate::{
    errors::AmqpError,
    negotiation::{ContentNegotiator, DefaultContentNegotiator, MediaTypeHeader},
};
use encoding_rs::{Encoding, REPLACEMENT, UTF_16BE, UTF_16LE};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tracing::debug;

/// Content type used when a delivery or an outbound message declares none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
/// Content encoding used when a delivery or an outbound message declares none.
pub const DEFAULT_CONTENT_ENCODING: &str = "UTF-8";

/// A body format plugin, registered per content type.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &Value, encoding: &str) -> Result<Vec<u8>, AmqpError>;

    fn deserialize(&self, body: &[u8], encoding: &str) -> Result<Value, AmqpError>;
}

/// JSON bodies in any encoding known to [`encoding_rs`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value, encoding: &str) -> Result<Vec<u8>, AmqpError> {
        let codec = resolve_encoding(encoding)?;
        let text =
            serde_json::to_string(value).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        encode_text(&text, codec)
    }

    fn deserialize(&self, body: &[u8], encoding: &str) -> Result<Value, AmqpError> {
        let text = decode_text(body, resolve_encoding(encoding)?)?;
        serde_json::from_str(&text).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// Looks up a content encoding by its WHATWG label, e.g. `UTF-8`, `UTF-16`
/// or `ISO-8859-1`.
///
/// # Parameters
/// * `label` - The content encoding as carried by the message properties
///
/// # Returns
/// * `Result<&'static Encoding, AmqpError>` - The codec, or
///   `UnsupportedEncoding` when the label names no usable encoding
pub fn resolve_encoding(label: &str) -> Result<&'static Encoding, AmqpError> {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) if encoding != REPLACEMENT => Ok(encoding),
        _ => Err(AmqpError::UnsupportedEncoding(label.to_owned())),
    }
}

/// Decodes a body into text. A leading byte order mark wins over `encoding`.
pub fn decode_text<'a>(body: &'a [u8], encoding: &'static Encoding) -> Result<Cow<'a, str>, AmqpError> {
    let (text, used, malformed) = encoding.decode(body);
    if malformed {
        return Err(AmqpError::ParsePayloadError(format!(
            "body is not valid {}",
            used.name()
        )));
    }
    Ok(text)
}

/// Encodes text into a body.
///
/// UTF-16 is written without a byte order mark. Characters the encoding
/// cannot represent are an error.
pub fn encode_text(text: &str, encoding: &'static Encoding) -> Result<Vec<u8>, AmqpError> {
    if encoding == UTF_16LE {
        return Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect());
    }
    if encoding == UTF_16BE {
        return Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect());
    }

    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        return Err(AmqpError::ParsePayloadError(format!(
            "body cannot be represented in {}",
            encoding.name()
        )));
    }
    Ok(bytes.into_owned())
}

/// Decides whether a serializer handles a negotiated media type.
pub type MediaTypePredicate = Box<dyn Fn(&MediaTypeHeader) -> bool + Send + Sync>;

/// Registry of serializers keyed by media type predicates.
///
/// Built once at configuration time and shared read-only afterwards.
pub struct SerializationConfiguration {
    negotiator: Arc<dyn ContentNegotiator>,
    serializers: Vec<(MediaTypePredicate, Arc<dyn Serializer>)>,
}

impl Default for SerializationConfiguration {
    fn default() -> Self {
        let json: MediaTypePredicate =
            Box::new(|header: &MediaTypeHeader| header.media_type == DEFAULT_CONTENT_TYPE);
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);

        SerializationConfiguration {
            negotiator: Arc::new(DefaultContentNegotiator),
            serializers: vec![(json, serializer)],
        }
    }
}

impl SerializationConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a serializer after the existing ones.
    pub fn map<P>(mut self, predicate: P, serializer: Arc<dyn Serializer>) -> Self
    where
        P: Fn(&MediaTypeHeader) -> bool + Send + Sync + 'static,
    {
        let predicate: MediaTypePredicate = Box::new(predicate);
        self.serializers.push((predicate, serializer));
        self
    }

    /// Replaces the content negotiator.
    pub fn negotiate_by(mut self, negotiator: Arc<dyn ContentNegotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Picks the serializer for a content type expression.
    ///
    /// Candidates are tried in quality order and, for each one, registrations in
    /// registration order.
    ///
    /// # Parameters
    /// * `content_type` - A content type expression, e.g. `application/json;q=0.5, text/plain`
    ///
    /// # Returns
    /// * `Result<Option<Arc<dyn Serializer>>, AmqpError>` - `Ok(None)` when nothing
    ///   matched, which the caller must check; errors only come from a malformed
    ///   expression
    pub fn create(&self, content_type: &str) -> Result<Option<Arc<dyn Serializer>>, AmqpError> {
        let candidates = self.negotiator.negotiate(content_type)?;

        let selected = candidates.iter().find_map(|header| {
            self.serializers
                .iter()
                .find(|(predicate, _)| predicate(header))
                .map(|(_, serializer)| serializer.clone())
        });

        if selected.is_none() {
            debug!(content_type = content_type, "no serializer matches content type");
        }

        Ok(selected)
    }
}
