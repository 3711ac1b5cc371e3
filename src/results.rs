// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consuming and Publishing Results
//!
//! Every delivery ends in exactly one [`AggregateConsumingResult`]. Its
//! [`ConsumingOutcome`] decides the reply sent to the broker:
//!
//! | outcome | reply |
//! |---|---|
//! | `Success` | ack |
//! | `ConsumingFailure` | nack with requeue |
//! | `ReiteratedConsumingFailure` | deferred to the fallback strategy |
//! | `UnresolvedMessage`, `UnsupportedMessage`, `CorruptedMessage` | deferred to the fallback strategy |
//!
//! Publishing never raises: it always yields a [`PublishResult`].

use crate::{
    channel::InboundChannel,
    consumer::MessageConsumer,
    errors::{AmqpError, CapturedError},
    message::InboundMessage,
};
use std::{fmt, sync::Arc};

/// What one consumer made of a delivery.
#[derive(Clone)]
pub struct ConsumingResult {
    pub(crate) consumer: Arc<dyn MessageConsumer>,
    error: Option<CapturedError>,
}

impl ConsumingResult {
    pub(crate) fn success(consumer: Arc<dyn MessageConsumer>) -> Self {
        ConsumingResult {
            consumer,
            error: None,
        }
    }

    pub(crate) fn failure(consumer: Arc<dyn MessageConsumer>, error: CapturedError) -> Self {
        ConsumingResult {
            consumer,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&CapturedError> {
        self.error.as_ref()
    }

    pub fn consumer_name(&self) -> &'static str {
        self.consumer.name()
    }

    fn notify_consuming_completion(&self) {
        if let Some(error) = &self.error {
            self.consumer.on_error(error.as_ref());
        }
        self.consumer.on_consume_completion();
    }

    fn notify_consuming_fault(&self, error: &AmqpError) {
        self.consumer.on_error(error);
    }
}

impl fmt::Debug for ConsumingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumingResult")
            .field("consumer", &self.consumer.name())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Classification of a delivery once every consumer has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumingOutcome {
    Success,
    /// First failed attempt, eligible for requeue.
    ConsumingFailure,
    /// Failed again after a redelivery, must not be requeued.
    ReiteratedConsumingFailure,
    UnresolvedMessage,
    UnsupportedMessage,
    CorruptedMessage,
}

impl ConsumingOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ConsumingOutcome::Success)
    }

    /// Only a first consumer failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsumingOutcome::ConsumingFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumingOutcome::Success => "success",
            ConsumingOutcome::ConsumingFailure => "consuming failure",
            ConsumingOutcome::ReiteratedConsumingFailure => "reiterated consuming failure",
            ConsumingOutcome::UnresolvedMessage => "unresolved message",
            ConsumingOutcome::UnsupportedMessage => "unsupported message",
            ConsumingOutcome::CorruptedMessage => "corrupted message",
        }
    }
}

/// How the delivery was answered by [`AggregateConsumingResult::reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Acknowledged,
    Requeued,
    /// Nothing was sent; the fallback strategy has to settle the delivery.
    Deferred,
}

/// The single result of processing one delivery.
#[derive(Debug, Clone)]
pub struct AggregateConsumingResult {
    outcome: ConsumingOutcome,
    message: Arc<InboundMessage>,
    results: Vec<ConsumingResult>,
}

impl AggregateConsumingResult {
    /// Aggregates the results of a consumable message.
    pub(crate) fn aggregate(message: Arc<InboundMessage>, results: Vec<ConsumingResult>) -> Self {
        let outcome = if results.iter().all(ConsumingResult::is_success) {
            ConsumingOutcome::Success
        } else if message.delivery().redelivered {
            ConsumingOutcome::ReiteratedConsumingFailure
        } else {
            ConsumingOutcome::ConsumingFailure
        };

        AggregateConsumingResult {
            outcome,
            message,
            results,
        }
    }

    /// The fixed result of a message no consumer can handle.
    pub(crate) fn non_consumable(message: Arc<InboundMessage>) -> Self {
        let outcome = match message.as_ref() {
            InboundMessage::Unresolved(_) => ConsumingOutcome::UnresolvedMessage,
            InboundMessage::Unsupported(_) => ConsumingOutcome::UnsupportedMessage,
            InboundMessage::Corrupted(_) => ConsumingOutcome::CorruptedMessage,
            InboundMessage::Consumable(_) => return Self::aggregate(message, vec![]),
        };

        AggregateConsumingResult {
            outcome,
            message,
            results: vec![],
        }
    }

    pub fn outcome(&self) -> ConsumingOutcome {
        self.outcome
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub fn results(&self) -> &[ConsumingResult] {
        &self.results
    }

    /// Errors captured from failed consumers.
    pub fn errors(&self) -> impl Iterator<Item = &CapturedError> {
        self.results.iter().filter_map(ConsumingResult::error)
    }

    /// Answers the broker for this delivery.
    ///
    /// Success acks and a first failure requeues. Every other outcome is left for
    /// the fallback strategy and nothing is sent.
    ///
    /// # Parameters
    /// * `channel` - The channel the delivery arrived on
    ///
    /// # Returns
    /// * `Result<ReplyOutcome, AmqpError>` - What was sent, or the transport error
    pub async fn reply(&self, channel: &InboundChannel) -> Result<ReplyOutcome, AmqpError> {
        let delivery_tag = self.message.delivery().delivery_tag;

        match self.outcome {
            ConsumingOutcome::Success => {
                channel.acknowledge(delivery_tag).await?;
                Ok(ReplyOutcome::Acknowledged)
            }
            ConsumingOutcome::ConsumingFailure => {
                channel.negative_acknowledge(delivery_tag, true).await?;
                Ok(ReplyOutcome::Requeued)
            }
            ConsumingOutcome::ReiteratedConsumingFailure
            | ConsumingOutcome::UnresolvedMessage
            | ConsumingOutcome::UnsupportedMessage
            | ConsumingOutcome::CorruptedMessage => Ok(ReplyOutcome::Deferred),
        }
    }

    pub(crate) fn notify_consuming_completion(&self) {
        self.results
            .iter()
            .for_each(ConsumingResult::notify_consuming_completion);
    }

    pub(crate) fn notify_consuming_fault(&self, error: &AmqpError) {
        self.results
            .iter()
            .for_each(|result| result.notify_consuming_fault(error));
    }
}

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Success(SuccessfulPublishing),
    Failure(FailurePublishing),
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishResult::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessfulPublishing {
    pub message_id: String,
    /// Unix time in seconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePublishing {
    pub error: AmqpError,
}
