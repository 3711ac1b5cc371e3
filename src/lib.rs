// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Typed AMQP 0-9-1 messaging over RabbitMQ.
//!
//! Application types declare a wire type URN through [`binding::Message`].
//! Consumers subscribe to queues through a [`dispatcher::RabbitMQDispatcher`];
//! every delivery is classified, dispatched, answered exactly once and handed
//! to a fallback strategy when it must not be requeued. Publishing goes
//! through an [`publisher::OutboundChannel`] and always yields a
//! [`results::PublishResult`].

mod otel;
#[cfg(test)]
mod testing;

pub mod binding;
pub mod builder;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod fallback;
pub mod message;
pub mod negotiation;
pub mod publisher;
pub mod queue;
pub mod reply;
pub mod results;
pub mod serialization;

pub use binding::{Message, MessageBindingResolver};
pub use configs::{ChannelConfiguration, RabbitMQConfigs};
pub use connection::Connection;
pub use consumer::{Consumer, ConsumingContext, SubscriptionConfiguration};
pub use dispatcher::RabbitMQDispatcher;
pub use errors::AmqpError;
pub use exchange::Exchange;
pub use fallback::{DeadLetterStrategy, NoFallbackStrategy};
pub use publisher::OutboundMessage;
pub use queue::Queue;
pub use results::PublishResult;
