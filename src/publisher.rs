// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! [`OutboundMessage`] wraps application content with the per-message
//! options a publisher may set. [`OutboundMessageEnvelope`] hydrates the AMQP
//! properties and serializes the body, and [`OutboundChannel`] writes it to
//! the broker.
//!
//! Publishing never returns an error: every failure becomes a
//! [`PublishResult::Failure`]. In reliable mode the result is only known
//! once the broker confirmed that very publish, see [`ConfirmTracker`].

use crate::{
    binding::Message,
    channel::{AmqpTransport, Confirm, PendingConfirm},
    configs::{ChannelConfiguration, PublishMode},
    errors::AmqpError,
    exchange::Exchange,
    message::InboundDelivery,
    otel::RabbitMQTracePropagator,
    reply::ReplyConfiguration,
    results::{FailurePublishing, PublishResult, SuccessfulPublishing},
    serialization::{DEFAULT_CONTENT_ENCODING, DEFAULT_CONTENT_TYPE},
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{sync::oneshot, task::AbortHandle, time::timeout};
use tracing::{debug, error, warn};

/// AMQP delivery mode of a message that is not written to disk.
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;
/// AMQP delivery mode of a message that survives a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Application content plus the options of one publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage<T> {
    content: T,
    durable: bool,
    message_id: Option<String>,
    correlation_id: Option<String>,
    reply: Option<ReplyConfiguration>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl<T: Message> OutboundMessage<T> {
    pub fn new(content: T) -> Self {
        OutboundMessage {
            content,
            durable: false,
            message_id: None,
            correlation_id: None,
            reply: None,
            content_type: None,
            content_encoding: None,
            headers: BTreeMap::new(),
        }
    }

    /// A message the broker persists on durable queues.
    pub fn durable(content: T) -> Self {
        OutboundMessage {
            durable: true,
            ..OutboundMessage::new(content)
        }
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    /// Where consumers should send their replies.
    pub fn with_reply(mut self, reply: ReplyConfiguration) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: &str) -> Self {
        self.content_encoding = Some(content_encoding.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn content(&self) -> &T {
        &self.content
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// A serialized message with its hydrated AMQP properties.
#[derive(Debug, Clone)]
pub struct OutboundMessageEnvelope {
    pub message_id: String,
    /// Unix time in seconds.
    pub timestamp: u64,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl OutboundMessageEnvelope {
    /// Serializes a message and hydrates its AMQP properties.
    ///
    /// Values preset on the message win; everything else is filled in from the
    /// channel configuration: a generated message id, the clock's Unix time, the
    /// default content type and encoding, and the bound type URN and expiry. The
    /// current trace context is injected into the headers.
    ///
    /// # Parameters
    /// * `message` - The message to seal
    /// * `configuration` - Resolver, serialization, id generator and clock to use
    ///
    /// # Returns
    /// * `Result<OutboundMessageEnvelope, AmqpError>` -
    ///   The envelope, or an error when the type is unbound, no serializer matches
    ///   the content type or the content cannot be encoded
    pub fn seal<T: Message>(
        message: &OutboundMessage<T>,
        configuration: &ChannelConfiguration,
    ) -> Result<Self, AmqpError> {
        let binding = configuration.resolver.resolve_message::<T>()?;

        let content_type = message
            .content_type
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let content_encoding = message
            .content_encoding
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_ENCODING);

        let serializer = configuration
            .serialization
            .create(content_type)?
            .ok_or_else(|| AmqpError::UnsupportedContentType(content_type.to_owned()))?;
        let value = serde_json::to_value(&message.content)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        let body = serializer.serialize(&value, content_encoding)?;

        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| configuration.id_generator.next());
        let timestamp = u64::try_from(configuration.clock.utc().timestamp()).unwrap_or_default();

        let mut headers = message.headers.clone();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut RabbitMQTracePropagator::new(&mut headers),
            )
        });

        let delivery_mode = if message.durable {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        };

        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(message_id.clone()))
            .with_timestamp(timestamp)
            .with_content_type(ShortString::from(content_type))
            .with_content_encoding(ShortString::from(content_encoding))
            .with_delivery_mode(delivery_mode)
            .with_type(ShortString::from(binding.raw_name()))
            .with_headers(FieldTable::from(headers));

        if let Some(expires_after) = binding.expires_after() {
            properties = properties
                .with_expiration(ShortString::from(expires_after.as_millis().to_string()));
        }

        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }

        if let Some(reply) = &message.reply {
            properties = properties.with_reply_to(ShortString::from(reply.to_string()));
        }

        Ok(OutboundMessageEnvelope {
            message_id,
            timestamp,
            properties,
            body,
        })
    }
}

/// One outstanding confirm: where its outcome lands and the task waiting on
/// the broker for it.
struct PendingEntry {
    slot: oneshot::Sender<Result<(), AmqpError>>,
    watcher: Option<AbortHandle>,
}

impl PendingEntry {
    fn resolve(self, outcome: Result<(), AmqpError>) {
        let _ = self.slot.send(outcome);
    }

    fn abandon(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
    }
}

#[derive(Default)]
struct ConfirmTable {
    last_sequence: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

/// Outstanding publisher confirms keyed by publish sequence number.
///
/// Sequence numbers start at 1 and follow the order in which publishes were
/// written, which matches the broker's delivery tags on a confirm channel.
#[derive(Default)]
pub struct ConfirmTracker {
    table: Mutex<ConfirmTable>,
}

impl ConfirmTracker {
    fn table(&self) -> std::sync::MutexGuard<'_, ConfirmTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the next sequence number.
    ///
    /// # Returns
    /// * `(u64, oneshot::Receiver<Result<(), AmqpError>>)` - The sequence
    ///   number and where its outcome lands
    pub fn track(&self) -> (u64, oneshot::Receiver<Result<(), AmqpError>>) {
        let (slot, receiver) = oneshot::channel();
        let mut table = self.table();
        table.last_sequence += 1;
        let sequence = table.last_sequence;
        table.pending.insert(
            sequence,
            PendingEntry {
                slot,
                watcher: None,
            },
        );

        (sequence, receiver)
    }

    /// Resolves a broker confirm.
    ///
    /// # Parameters
    /// * `sequence` - The confirmed sequence number
    /// * `multiple` - Whether every sequence number up to `sequence` is confirmed too
    /// * `confirm` - Ack or nack; a nack resolves to [`AmqpError::PublishNacked`]
    ///
    /// # Returns
    /// * `usize` - How many entries were resolved
    pub fn confirm(&self, sequence: u64, multiple: bool, confirm: Confirm) -> usize {
        let outcome = match confirm {
            Confirm::Ack => Ok(()),
            Confirm::Nack => Err(AmqpError::PublishNacked),
        };

        let entries = {
            let mut table = self.table();
            if multiple {
                let rest = match sequence.checked_add(1) {
                    Some(next) => table.pending.split_off(&next),
                    None => BTreeMap::new(),
                };
                std::mem::replace(&mut table.pending, rest)
                    .into_values()
                    .collect::<Vec<_>>()
            } else {
                table.pending.remove(&sequence).into_iter().collect()
            }
        };

        let resolved = entries.len();
        for entry in entries {
            entry.resolve(outcome.clone());
        }

        resolved
    }

    /// Fails one entry, e.g. when the confirm itself could not be read.
    pub fn fail(&self, sequence: u64, error: AmqpError) {
        if let Some(entry) = self.table().pending.remove(&sequence) {
            entry.resolve(Err(error));
        }
    }

    /// Drops an entry nobody waits for anymore and stops watching the broker
    /// for it.
    pub fn forget(&self, sequence: u64) {
        if let Some(entry) = self.table().pending.remove(&sequence) {
            entry.abandon();
        }
    }

    /// Fails every outstanding entry with [`AmqpError::ChannelClosed`].
    ///
    /// # Returns
    /// * `usize` - How many entries were failed
    pub fn close(&self) -> usize {
        let pending = std::mem::take(&mut self.table().pending);
        let failed = pending.len();
        for entry in pending.into_values() {
            if let Some(watcher) = &entry.watcher {
                watcher.abort();
            }
            entry.resolve(Err(AmqpError::ChannelClosed));
        }

        failed
    }

    pub fn pending(&self) -> usize {
        self.table().pending.len()
    }

    /// Tracks a written publish and resolves it once `confirm` completes.
    fn watch(self: &Arc<Self>, confirm: PendingConfirm) -> (u64, oneshot::Receiver<Result<(), AmqpError>>) {
        let (sequence, receiver) = self.track();
        let tracker = self.clone();

        let watcher = tokio::spawn(async move {
            match confirm.await {
                Ok(confirm) => {
                    tracker.confirm(sequence, false, confirm);
                }
                Err(err) => tracker.fail(sequence, err),
            }
        });

        // an entry already resolved has nothing left to abort
        if let Some(entry) = self.table().pending.get_mut(&sequence) {
            entry.watcher = Some(watcher.abort_handle());
        }

        (sequence, receiver)
    }
}

/// The channel messages are published through.
///
/// Frames are written one publish at a time; waiting for a broker confirm
/// happens outside the writer lock, so concurrent reliable publishes overlap.
pub struct OutboundChannel {
    transport: Arc<dyn AmqpTransport>,
    writer: tokio::sync::Mutex<()>,
    configuration: ChannelConfiguration,
    confirms: Option<Arc<ConfirmTracker>>,
    closed: AtomicBool,
}

impl OutboundChannel {
    /// Wraps a transport channel for publishing.
    ///
    /// In reliable mode the transport must already have publisher confirms turned
    /// on; every publish then waits for its confirm.
    ///
    /// # Parameters
    /// * `transport` - The channel publishes are written to
    /// * `configuration` - Channel configuration, including the publish mode
    pub fn new(transport: Arc<dyn AmqpTransport>, configuration: ChannelConfiguration) -> Self {
        let confirms = match configuration.publish_mode {
            PublishMode::Reliable => Some(Arc::new(ConfirmTracker::default())),
            PublishMode::FireAndForget => None,
        };

        OutboundChannel {
            transport,
            writer: tokio::sync::Mutex::new(()),
            configuration,
            confirms,
            closed: AtomicBool::new(false),
        }
    }

    pub fn configuration(&self) -> &ChannelConfiguration {
        &self.configuration
    }

    /// Publishes a message to an exchange.
    ///
    /// # Parameters
    /// * `message` - The message and its per-publish options
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key, may be empty
    ///
    /// # Returns
    /// * `PublishResult` - `Success` with the message id and timestamp once the
    ///   message was written (and, in reliable mode, acked by the broker);
    ///   `Failure` with the cause otherwise
    pub async fn publish<T: Message>(
        &self,
        message: &OutboundMessage<T>,
        exchange: &Exchange,
        routing_key: &str,
    ) -> PublishResult {
        let envelope = match OutboundMessageEnvelope::seal(message, &self.configuration) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = err.to_string(), "failure to build the outbound message");
                return failure(err);
            }
        };

        let OutboundMessageEnvelope {
            message_id,
            timestamp,
            properties,
            body,
        } = envelope;

        match self.send(exchange.name(), routing_key, properties, body).await {
            Ok(()) => PublishResult::Success(SuccessfulPublishing {
                message_id,
                timestamp,
            }),
            Err(err) => failure(err),
        }
    }

    /// Republishes an inbound delivery, properties and body untouched.
    ///
    /// # Parameters
    /// * `delivery` - The delivery to forward
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key, may be empty
    ///
    /// # Returns
    /// * `PublishResult` - As for [`OutboundChannel::publish`], carrying the
    ///   delivery's own message id and timestamp
    pub async fn forward(
        &self,
        delivery: &InboundDelivery,
        exchange: &Exchange,
        routing_key: &str,
    ) -> PublishResult {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_default();
        let timestamp = delivery.properties.timestamp().unwrap_or_else(|| {
            u64::try_from(self.configuration.clock.utc().timestamp()).unwrap_or_default()
        });

        match self
            .send(
                exchange.name(),
                routing_key,
                delivery.properties.clone(),
                delivery.body.clone(),
            )
            .await
        {
            Ok(()) => PublishResult::Success(SuccessfulPublishing {
                message_id,
                timestamp,
            }),
            Err(err) => failure(err),
        }
    }

    /// Declares an exchange on this channel.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `ChannelClosed` once the channel was closed,
    ///   otherwise the broker's answer
    pub async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), AmqpError> {
        let _guard = self.writer.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelClosed);
        }

        self.transport.declare_exchange(exchange).await
    }

    /// Confirms still awaited from the broker.
    pub fn pending_confirms(&self) -> usize {
        self.confirms
            .as_ref()
            .map(|confirms| confirms.pending())
            .unwrap_or_default()
    }

    /// Stops publishing, fails pending confirms with [`AmqpError::ChannelClosed`]
    /// and closes the channel. Later calls do nothing.
    pub async fn close(&self) {
        let _guard = self.writer.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(confirms) = &self.confirms {
            let failed = confirms.close();
            if failed > 0 {
                warn!(count = failed, "pending confirms failed on channel close");
            }
        }

        if let Err(err) = self.transport.close(200, "Channel Disposed").await {
            debug!(error = err.to_string(), "ignoring channel close failure");
        }
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        let (sequence, receiver, confirms) = {
            let _guard = self.writer.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(AmqpError::ChannelClosed);
            }

            let confirm = self
                .transport
                .publish(exchange, routing_key, properties, body)
                .await?;

            let Some(confirms) = &self.confirms else {
                return Ok(());
            };

            let (sequence, receiver) = confirms.watch(confirm);
            (sequence, receiver, confirms.clone())
        };

        let deadline = self.configuration.confirm_timeout;
        match timeout(deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AmqpError::ChannelClosed),
            Err(_) => {
                confirms.forget(sequence);
                warn!(sequence, "publish confirm timed out");
                Err(AmqpError::ConfirmTimeout(deadline.as_millis()))
            }
        }
    }
}

fn failure(error: AmqpError) -> PublishResult {
    PublishResult::Failure(FailurePublishing { error })
}
