// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Messages
//!
//! A raw [`InboundDelivery`] is classified by the message builder into an
//! [`InboundMessage`]: either a consumable message with typed content, or one
//! of the three non-consumable variants that never reach a consumer.

use crate::{
    binding::{AnyContent, Message, MessageBinding},
    reply::ReplyConfiguration,
    serialization::{DEFAULT_CONTENT_ENCODING, DEFAULT_CONTENT_TYPE},
};
use lapin::{message::Delivery, types::AMQPValue, BasicProperties};
use std::sync::Arc;
use tracing::debug;

/// Header some publishers use instead of the `content_type` property.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// One message frame received from the broker.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub consumer_tag: String,
}

impl InboundDelivery {
    pub(crate) fn from_lapin(delivery: Delivery, consumer_tag: &str) -> Self {
        InboundDelivery {
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            properties: delivery.properties,
            body: delivery.data,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            consumer_tag: consumer_tag.to_owned(),
        }
    }

    /// The wire type URN, empty when the publisher did not set one.
    pub fn message_type(&self) -> &str {
        self.properties
            .kind()
            .as_ref()
            .map(|kind| kind.as_str())
            .unwrap_or_default()
    }

    /// The `content_type` property, then the `Content-Type` header, then
    /// `application/json`.
    pub fn content_type(&self) -> String {
        if let Some(content_type) = self.properties.content_type() {
            if !content_type.as_str().is_empty() {
                return content_type.as_str().to_owned();
            }
        }

        let header = self
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(CONTENT_TYPE_HEADER).cloned());

        let from_header = match header {
            Some(AMQPValue::LongString(value)) => {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
            Some(AMQPValue::ShortString(value)) => value.as_str().to_owned(),
            Some(AMQPValue::ByteArray(value)) => {
                String::from_utf8_lossy(value.as_slice()).into_owned()
            }
            _ => String::new(),
        };

        if from_header.is_empty() {
            DEFAULT_CONTENT_TYPE.to_owned()
        } else {
            from_header
        }
    }

    pub fn content_encoding(&self) -> String {
        self.properties
            .content_encoding()
            .as_ref()
            .map(|encoding| encoding.as_str().to_owned())
            .unwrap_or_else(|| DEFAULT_CONTENT_ENCODING.to_owned())
    }
}

/// Protocol metadata of a consumed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCollection {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub reply_configuration: Option<ReplyConfiguration>,
    pub timestamp: Option<u64>,
    pub content_type: String,
    pub content_encoding: String,
    pub consumer_tag: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

impl HeaderCollection {
    pub fn parse(delivery: &InboundDelivery) -> Self {
        let props = &delivery.properties;
        let as_string = |value: &Option<lapin::types::ShortString>| {
            value.as_ref().map(|v| v.as_str().to_owned())
        };

        let reply_configuration = props.reply_to().as_ref().and_then(|reply_to| {
            reply_to
                .as_str()
                .parse::<ReplyConfiguration>()
                .map_err(|err| debug!(error = err.to_string(), "ignoring reply address"))
                .ok()
        });

        HeaderCollection {
            message_id: as_string(props.message_id()),
            correlation_id: as_string(props.correlation_id()),
            message_type: as_string(props.kind()),
            reply_configuration,
            timestamp: *props.timestamp(),
            content_type: delivery.content_type(),
            content_encoding: delivery.content_encoding(),
            consumer_tag: delivery.consumer_tag.clone(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
        }
    }
}

/// A message whose content was decoded into its bound runtime type.
#[derive(Debug)]
pub struct ConsumedMessage<T> {
    content: Arc<T>,
    headers: Arc<HeaderCollection>,
}

impl<T> Clone for ConsumedMessage<T> {
    fn clone(&self) -> Self {
        ConsumedMessage {
            content: self.content.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl<T> ConsumedMessage<T> {
    pub fn new(content: T, headers: HeaderCollection) -> Self {
        ConsumedMessage {
            content: Arc::new(content),
            headers: Arc::new(headers),
        }
    }

    pub fn content(&self) -> &T {
        &self.content
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }
}

/// A consumable message before it is handed to typed consumers.
#[derive(Clone)]
pub struct ErasedMessage {
    pub(crate) delivery: InboundDelivery,
    pub(crate) binding: Arc<MessageBinding>,
    pub(crate) content: AnyContent,
    pub(crate) headers: Arc<HeaderCollection>,
}

impl ErasedMessage {
    pub(crate) fn new(delivery: InboundDelivery, binding: Arc<MessageBinding>, content: AnyContent) -> Self {
        let headers = Arc::new(HeaderCollection::parse(&delivery));
        ErasedMessage {
            delivery,
            binding,
            content,
            headers,
        }
    }

    pub fn binding(&self) -> &MessageBinding {
        &self.binding
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    /// The typed view of this message, if `T` is the bound runtime type.
    pub fn downcast<T: Message>(&self) -> Option<ConsumedMessage<T>> {
        self.content
            .clone()
            .downcast::<T>()
            .ok()
            .map(|content| ConsumedMessage {
                content,
                headers: self.headers.clone(),
            })
    }
}

impl std::fmt::Debug for ErasedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedMessage")
            .field("binding", &self.binding)
            .field("headers", &self.headers)
            .finish()
    }
}

/// An inbound delivery after classification.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Resolved, negotiated and decoded.
    Consumable(ErasedMessage),
    /// The message type URN is unknown or missing.
    Unresolved(InboundDelivery),
    /// No serializer handles the content type.
    Unsupported(InboundDelivery),
    /// The body does not decode into the bound type.
    Corrupted(InboundDelivery),
}

impl InboundMessage {
    pub fn delivery(&self) -> &InboundDelivery {
        match self {
            InboundMessage::Consumable(message) => &message.delivery,
            InboundMessage::Unresolved(delivery)
            | InboundMessage::Unsupported(delivery)
            | InboundMessage::Corrupted(delivery) => delivery,
        }
    }

    pub fn is_consumable(&self) -> bool {
        matches!(self, InboundMessage::Consumable(_))
    }
}
