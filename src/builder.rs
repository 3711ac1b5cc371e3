// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Message Builder
//!
//! Classifies a raw delivery. The checks run in a fixed order and the first
//! one that fails decides the outcome:
//!
//! 1. the message type URN must resolve, otherwise `Unresolved`;
//! 2. a serializer must match the content type, otherwise `Unsupported`;
//! 3. the body must decode into the bound type, otherwise `Corrupted`.

use crate::{
    binding::MessageTypeResolver,
    configs::ChannelConfiguration,
    message::{ErasedMessage, InboundDelivery, InboundMessage},
    serialization::SerializationConfiguration,
};
use std::sync::Arc;
use tracing::debug;

pub struct ConsumedMessageBuilder {
    serialization: Arc<SerializationConfiguration>,
    resolver: Arc<dyn MessageTypeResolver>,
}

impl ConsumedMessageBuilder {
    pub fn new(configuration: &ChannelConfiguration) -> Self {
        ConsumedMessageBuilder {
            serialization: configuration.serialization.clone(),
            resolver: configuration.resolver.clone(),
        }
    }

    /// Classifies a delivery.
    ///
    /// # Parameters
    /// * `delivery` - The raw delivery
    ///
    /// # Returns
    /// * `InboundMessage` - `Consumable` with the decoded content, or the first
    ///   check that failed: `Unresolved`, `Unsupported` or `Corrupted`
    pub fn build(&self, delivery: InboundDelivery) -> InboundMessage {
        let binding = match self.resolver.resolve(delivery.message_type()) {
            Ok(Some(binding)) => binding,
            Ok(None) => return InboundMessage::Unresolved(delivery),
            Err(err) => {
                debug!(error = err.to_string(), "message type resolution failed");
                return InboundMessage::Unresolved(delivery);
            }
        };

        let content_type = delivery.content_type();
        let serializer = match self.serialization.create(&content_type) {
            Ok(Some(serializer)) => serializer,
            Ok(None) => return InboundMessage::Unsupported(delivery),
            Err(err) => {
                debug!(error = err.to_string(), "content negotiation failed");
                return InboundMessage::Unsupported(delivery);
            }
        };

        let content = serializer
            .deserialize(&delivery.body, &delivery.content_encoding())
            .and_then(|value| binding.runtime_type().decode(value));

        match content {
            Ok(content) => InboundMessage::Consumable(ErasedMessage::new(delivery, binding, content)),
            Err(err) => {
                debug!(error = err.to_string(), "message body cannot be decoded");
                InboundMessage::Corrupted(delivery)
            }
        }
    }
}
