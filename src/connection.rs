// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! A connected [`Connection`] owns the running subscriptions and the shared
//! outbound channel. Closing it shuts down in order:
//!
//! 1. every subscription stops taking new deliveries
//! 2. in-flight deliveries are settled
//! 3. consumer channels are closed
//! 4. the outbound channel fails its pending confirms and closes
//! 5. the transport connection is closed with reply code 200
//!
//! Close failures are logged and otherwise ignored.

use crate::{
    binding::Message,
    channel::ConnectionHandle,
    dispatcher::Subscription,
    exchange::Exchange,
    publisher::{OutboundChannel, OutboundMessage},
    results::PublishResult,
};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::debug;

pub struct Connection {
    connection: Arc<dyn ConnectionHandle>,
    outbound: Arc<OutboundChannel>,
    subscriptions: Vec<Subscription>,
}

impl Connection {
    pub(crate) fn new(
        connection: Arc<dyn ConnectionHandle>,
        outbound: Arc<OutboundChannel>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Connection {
            connection,
            outbound,
            subscriptions,
        }
    }

    /// Publishes through the shared outbound channel.
    ///
    /// # Parameters
    /// * `message` - The message and its per-publish options
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key, may be empty
    ///
    /// # Returns
    /// * `PublishResult` - The outcome of the publish, never an error
    pub async fn publish<T: Message>(
        &self,
        message: &OutboundMessage<T>,
        exchange: &Exchange,
        routing_key: &str,
    ) -> PublishResult {
        self.outbound.publish(message, exchange, routing_key).await
    }

    /// The shared outbound channel, for publishers outside a consumer.
    pub fn outbound(&self) -> Arc<OutboundChannel> {
        self.outbound.clone()
    }

    /// Whether the broker connection is still up.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Shuts the connection down.
    ///
    /// Subscriptions stop taking deliveries first and the ones in flight are
    /// settled before their channels close. Pending confirms fail, then the
    /// connection itself is closed if still open. Close failures are logged at
    /// debug level and otherwise ignored.
    pub async fn close(self) {
        for subscription in &self.subscriptions {
            subscription.signal();
        }
        join_all(self.subscriptions.into_iter().map(Subscription::finish)).await;

        self.outbound.close().await;

        if !self.connection.is_open() {
            debug!("connection already closed");
            return;
        }

        if let Err(err) = self.connection.close(200, "Connection Disposed").await {
            debug!(error = err.to_string(), "ignoring connection close failure");
        }
    }
}
