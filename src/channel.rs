// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module holds the narrow transport seam the message pipeline talks
//! through ([`AmqpTransport`], [`ConnectionHandle`]), their lapin backed
//! implementations, and the connection bootstrap.
//!
//! A single AMQP channel must not interleave frames from concurrent writers,
//! so callers go through [`InboundChannel`] (acks and nacks) or the outbound
//! channel (publishes), both of which serialize access behind a lock.

use crate::{configs::RabbitMQConfigs, errors::AmqpError, exchange::Exchange, message::InboundDelivery};
use async_trait::async_trait;
use futures_util::{
    future::BoxFuture,
    stream::{BoxStream, StreamExt},
};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Broker answer to a publish made on a confirm channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack,
}

/// Resolves once the broker confirms the publish it was returned for.
///
/// On a channel without publisher confirms it resolves to [`Confirm::Ack`]
/// straight away.
pub type PendingConfirm = BoxFuture<'static, Result<Confirm, AmqpError>>;

/// Stream of deliveries from one broker consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// The operations the pipeline needs from one AMQP channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<PendingConfirm, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;
}

/// The underlying transport connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn is_open(&self) -> bool;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;
}

/// Acknowledgement side of a subscription channel, one writer at a time.
pub struct InboundChannel {
    transport: Arc<dyn AmqpTransport>,
    writer: Mutex<()>,
}

impl InboundChannel {
    pub fn new(transport: Arc<dyn AmqpTransport>) -> Self {
        InboundChannel {
            transport,
            writer: Mutex::new(()),
        }
    }

    /// Removes the delivery from the broker queue.
    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let _guard = self.writer.lock().await;
        self.transport.ack(delivery_tag).await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on this channel
    /// * `requeue` - Whether the broker should deliver it again
    pub async fn negative_acknowledge(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let _guard = self.writer.lock().await;
        self.transport.nack(delivery_tag, requeue).await
    }

    /// Closes the channel, ignoring failures of an already closing channel.
    pub async fn close(&self) {
        let _guard = self.writer.lock().await;
        if let Err(err) = self.transport.close(200, "Consumer Disposed").await {
            debug!(error = err.to_string(), "ignoring channel close failure");
        }
    }
}

/// [`AmqpTransport`] over a lapin channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel { channel }
    }

    /// Turns on publisher confirms for every later publish on this channel.
    pub async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ConfirmSelectError
            })
    }

    /// Caps the unacknowledged deliveries the broker pushes to this channel.
    pub async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    /// Starts a broker consumer on the queue.
    ///
    /// # Parameters
    /// * `queue` - Queue name
    /// * `consumer_tag` - Tag identifying the consumer on the broker
    ///
    /// # Returns
    /// * `Result<DeliveryStream, AmqpError>` - Deliveries in arrival order; the
    ///   stream ends when the channel closes
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();

        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| InboundDelivery::from_lapin(delivery, &tag))
                    .map_err(|err| AmqpError::BindingConsumerError(err.to_string()))
            })
            .boxed())
    }
}

#[async_trait]
impl AmqpTransport for LapinChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), AmqpError> {
        debug!("declaring exchange: {}", exchange.name);

        match self
            .channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exchange.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::from(exchange.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exchange.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(Confirmation::Nack(_)) => Ok(Confirm::Nack),
                Ok(_) => Ok(Confirm::Ack),
                Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            }
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(reply_code, reply_text)
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// [`ConnectionHandle`] over a lapin connection.
pub struct LapinConnection {
    connection: Connection,
}

impl LapinConnection {
    /// Opens a new channel on this connection.
    pub async fn create_channel(&self) -> Result<LapinChannel, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(LapinChannel::new(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }
    }
}

#[async_trait]
impl ConnectionHandle for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.connection
            .close(reply_code, reply_text)
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// Connects to RabbitMQ using the settings in `cfg`.
///
/// Broker initiated shutdowns are logged; subscriptions observe them as the
/// end of their delivery streams.
pub async fn new_amqp_connection(cfg: &RabbitMQConfigs) -> Result<LapinConnection, AmqpError> {
    cfg.validate()?;

    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(cfg.app_name.clone()));

    let connection = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    connection.on_error(|err| {
        warn!(error = err.to_string(), "amqp connection shut down");
    });

    Ok(LapinConnection { connection })
}
