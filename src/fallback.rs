// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fallback Strategies
//!
//! A fallback strategy settles deliveries that must not be requeued: messages
//! that could not be classified as consumable, and consumer failures on a
//! redelivery. The delivery is only acknowledged once the strategy reports
//! success.

use crate::{
    errors::AmqpError,
    exchange::Exchange,
    message::InboundMessage,
    publisher::OutboundChannel,
    queue::Queue,
    results::PublishResult,
};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Outcome of a fallback strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackApplied {
    Successful,
    Failure(AmqpError),
}

impl FallbackApplied {
    pub fn success(&self) -> bool {
        matches!(self, FallbackApplied::Successful)
    }
}

/// Decides what happens to a delivery that must not be requeued.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    /// Handles a delivery that will not be requeued.
    ///
    /// # Parameters
    /// * `channel` - Channel for publishing or declaring what the strategy needs
    /// * `message` - The classified delivery
    ///
    /// # Returns
    /// * `FallbackApplied` - Only `Successful` lets the delivery be acknowledged
    async fn apply(&self, channel: &OutboundChannel, message: &InboundMessage) -> FallbackApplied;
}

/// Forwards the original delivery to a durable direct exchange derived from
/// the source queue name, `"<queue>::dle"` unless told otherwise.
pub struct DeadLetterStrategy {
    exchange: Exchange,
    declared: OnceCell<()>,
}

impl DeadLetterStrategy {
    /// Dead-letters to `"<queue>::dle"`.
    pub fn new(queue: &Queue) -> Self {
        Self::with_exchange_name(queue, |name| format!("{name}::dle"))
    }

    /// Dead-letters to an exchange named after the queue.
    ///
    /// # Parameters
    /// * `queue` - The consumed queue
    /// * `exchange_name` - Maps the queue name to the exchange name
    pub fn with_exchange_name<F>(queue: &Queue, exchange_name: F) -> Self
    where
        F: Fn(&str) -> String,
    {
        DeadLetterStrategy {
            exchange: Exchange::durable_direct(&exchange_name(queue.name())),
            declared: OnceCell::new(),
        }
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }
}

#[async_trait]
impl FallbackStrategy for DeadLetterStrategy {
    async fn apply(&self, channel: &OutboundChannel, message: &InboundMessage) -> FallbackApplied {
        if let Err(err) = self
            .declared
            .get_or_try_init(|| channel.declare_exchange(&self.exchange))
            .await
        {
            return FallbackApplied::Failure(err);
        }

        match channel.forward(message.delivery(), &self.exchange, "").await {
            PublishResult::Success(_) => {
                debug!(exchange = self.exchange.name(), "message dead-lettered");
                FallbackApplied::Successful
            }
            PublishResult::Failure(failure) => FallbackApplied::Failure(failure.error),
        }
    }
}

/// Drops the delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFallbackStrategy;

#[async_trait]
impl FallbackStrategy for NoFallbackStrategy {
    async fn apply(&self, _channel: &OutboundChannel, message: &InboundMessage) -> FallbackApplied {
        let delivery = message.delivery();
        warn!(
            message_type = delivery.message_type(),
            delivery_tag = delivery.delivery_tag,
            "dropping message without fallback"
        );
        FallbackApplied::Successful
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Confirm, MockAmqpTransport},
        testing::{configuration, confirmed, delivery},
    };
    use std::sync::Arc;

    fn corrupted() -> InboundMessage {
        InboundMessage::Corrupted(delivery("urn:message:fake", b"{not json", false))
    }

    #[tokio::test]
    async fn dead_letters_to_derived_exchange_declared_once() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_declare_exchange()
            .withf(|exchange| exchange.name() == "orders::dle" && exchange.is_durable())
            .times(1)
            .returning(|_| Ok(()));
        transport
            .expect_publish()
            .withf(|exchange, routing_key, _, body| {
                exchange == "orders::dle" && routing_key.is_empty() && body.as_slice() == b"{not json"
            })
            .times(2)
            .returning(|_, _, _, _| confirmed(Confirm::Ack));

        let channel = OutboundChannel::new(Arc::new(transport), configuration());
        let strategy = DeadLetterStrategy::new(&Queue::new("orders"));

        assert!(strategy.apply(&channel, &corrupted()).await.success());
        assert!(strategy.apply(&channel, &corrupted()).await.success());
    }

    #[test]
    fn custom_exchange_name() {
        let strategy =
            DeadLetterStrategy::with_exchange_name(&Queue::new("orders"), |name| format!("{name}.dead"));

        assert_eq!(strategy.exchange().name(), "orders.dead");
    }

    #[tokio::test]
    async fn forwarding_failure_is_reported() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("closed".to_owned())));

        let channel = OutboundChannel::new(Arc::new(transport), configuration());
        let applied = DeadLetterStrategy::new(&Queue::new("orders"))
            .apply(&channel, &corrupted())
            .await;

        assert_eq!(
            applied,
            FallbackApplied::Failure(AmqpError::PublishingError("closed".to_owned()))
        );
    }

    #[tokio::test]
    async fn declaration_failure_is_retried_on_next_apply() {
        let mut transport = MockAmqpTransport::new();
        let mut calls = 0;
        transport
            .expect_declare_exchange()
            .times(2)
            .returning(move |exchange| {
                calls += 1;
                if calls == 1 {
                    Err(AmqpError::DeclareExchangeError(exchange.name().to_owned()))
                } else {
                    Ok(())
                }
            });
        transport
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| confirmed(Confirm::Ack));

        let channel = OutboundChannel::new(Arc::new(transport), configuration());
        let strategy = DeadLetterStrategy::new(&Queue::new("orders"));

        assert!(!strategy.apply(&channel, &corrupted()).await.success());
        assert!(strategy.apply(&channel, &corrupted()).await.success());
    }

    #[tokio::test]
    async fn no_fallback_drops_the_message() {
        let mut transport = MockAmqpTransport::new();
        transport.expect_publish().never();

        let channel = OutboundChannel::new(Arc::new(transport), configuration());
        assert!(NoFallbackStrategy.apply(&channel, &corrupted()).await.success());
    }
}
