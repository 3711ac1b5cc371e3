// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Framework
//!
//! This module provides the error type shared by every layer of the crate:
//! transport calls, content negotiation, serialization, type resolution,
//! publishing and dead-lettering. Consumer application code reports its own
//! failures through [`ConsumerError`].

use std::{error::Error, sync::Arc};
use thiserror::Error;

/// Error returned by application consumers.
pub type ConsumerError = Box<dyn Error + Send + Sync>;

/// A consumer error captured during dispatch, shareable across notifications.
pub type CapturedError = Arc<dyn Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Payloads are plain strings so the error can be cloned into publish results
/// and fallback outcomes without holding on to transport internals.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel was closed while an operation was pending
    #[error("channel closed")]
    ChannelClosed,

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a publish
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// No broker confirm arrived within the configured deadline
    #[error("publish confirm timed out after {0}ms")]
    ConfirmTimeout(u128),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing the transport connection or a channel
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// A quality weight in a content type could not be parsed
    #[error("invalid quality value `{0}`")]
    InvalidQuality(String),

    /// A content type segment carries no media type token
    #[error("invalid media type `{0}`")]
    InvalidMediaType(String),

    /// No serializer is registered for the content type
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),

    /// The serializer does not handle the content encoding
    #[error("unsupported content encoding `{0}`")]
    UnsupportedEncoding(String),

    /// Error serializing or deserializing a payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// An inbound delivery does not declare a message type
    #[error("missing message type")]
    MissingMessageType,

    /// A runtime type was published without being bound to a message type
    #[error("type `{0}` is not bound to a message type")]
    UnboundMessageType(String),

    /// The same message type was registered twice
    #[error("message type `{0}` registered more than once")]
    DuplicateMessageType(String),

    /// An exchange type name not usable as a reply target
    #[error("exchange type not recognized: `{0}`")]
    UnknownExchangeType(String),

    /// A reply-to address could not be parsed
    #[error("invalid reply address `{0}`")]
    InvalidReplyAddress(String),

    /// Invalid value supplied at configuration time
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),

    /// A consumer panicked while handling a message
    #[error("consumer panicked `{0}`")]
    ConsumerPanicked(String),

    /// Dead-lettering a delivery failed, so it was left unacknowledged
    #[error("failure to apply fallback `{0}`")]
    FallbackError(String),
}
