// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumers
//!
//! This module holds the consumer capability applications implement, the
//! per-queue [`SubscriptionConfiguration`], and the [`ConsumingPipeline`]
//! that takes a single delivery from the broker to its reply:
//!
//! 1. classify the delivery (see the builder module)
//! 2. run every consumer subscribed to its message type, isolated from each other
//! 3. aggregate their results and reply to the broker
//! 4. hand deliveries that must not be requeued to the fallback strategy
//! 5. notify consumers of errors and completion
//!
//! Each delivery is traced with an OpenTelemetry consumer span that continues
//! the trace propagated by the publisher.

use crate::{
    binding::{Message, MessageBinding},
    builder::ConsumedMessageBuilder,
    channel::InboundChannel,
    configs::ChannelConfiguration,
    errors::{AmqpError, CapturedError, ConsumerError},
    fallback::{FallbackApplied, FallbackStrategy, NoFallbackStrategy},
    message::{ConsumedMessage, ErasedMessage, InboundDelivery, InboundMessage},
    otel,
    publisher::OutboundChannel,
    queue::Queue,
    results::{AggregateConsumingResult, ConsumingResult, ReplyOutcome},
};
use async_trait::async_trait;
use futures_util::{future::join_all, FutureExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::{type_name, Any, TypeId},
    borrow::Cow,
    error::Error,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tracing::{debug, error, warn};

/// What a consumer receives for one message.
pub struct ConsumingContext<T> {
    message: ConsumedMessage<T>,
    outbound: Arc<OutboundChannel>,
}

impl<T> ConsumingContext<T> {
    pub fn new(message: ConsumedMessage<T>, outbound: Arc<OutboundChannel>) -> Self {
        ConsumingContext { message, outbound }
    }

    pub fn message(&self) -> &ConsumedMessage<T> {
        &self.message
    }

    /// Channel for publishing replies or follow-up messages.
    pub fn outbound(&self) -> &OutboundChannel {
        &self.outbound
    }
}

/// Application logic for one message type.
///
/// A returned error marks this consumer's attempt as failed. The first failed
/// attempt of a delivery requeues it; a failure on the redelivery hands it to
/// the subscription's fallback strategy.
#[async_trait]
pub trait Consumer<T: Message>: Send + Sync {
    /// Handles one message.
    ///
    /// # Parameters
    /// * `context` - The typed message and the outbound channel
    ///
    /// # Returns
    /// * `Result<(), ConsumerError>` - Any error fails this consumer's attempt
    async fn consume(&self, context: ConsumingContext<T>) -> Result<(), ConsumerError>;

    /// Runs once per delivery after the broker was answered.
    fn on_consume_completion(&self) {}

    /// Runs for this consumer's own failure, and for a failure to answer the
    /// broker or apply the fallback.
    fn on_error(&self, _error: &(dyn Error + Send + Sync + 'static)) {}
}

#[async_trait]
pub(crate) trait MessageConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, binding: &MessageBinding) -> bool;

    async fn consume(
        &self,
        message: &ErasedMessage,
        outbound: Arc<OutboundChannel>,
    ) -> Result<(), ConsumerError>;

    fn on_consume_completion(&self);

    fn on_error(&self, error: &(dyn Error + Send + Sync + 'static));
}

struct TypedConsumer<T, C> {
    consumer: C,
    _message: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, C> MessageConsumer for TypedConsumer<T, C>
where
    T: Message,
    C: Consumer<T> + 'static,
{
    fn name(&self) -> &'static str {
        type_name::<C>()
    }

    fn accepts(&self, binding: &MessageBinding) -> bool {
        binding.runtime_type().type_id() == TypeId::of::<T>()
    }

    async fn consume(
        &self,
        message: &ErasedMessage,
        outbound: Arc<OutboundChannel>,
    ) -> Result<(), ConsumerError> {
        let message = message
            .downcast::<T>()
            .ok_or_else(|| AmqpError::UnboundMessageType(type_name::<T>().to_owned()))?;

        self.consumer
            .consume(ConsumingContext::new(message, outbound))
            .await
    }

    fn on_consume_completion(&self) {
        self.consumer.on_consume_completion();
    }

    fn on_error(&self, error: &(dyn Error + Send + Sync + 'static)) {
        self.consumer.on_error(error);
    }
}

/// Consumers and fallback strategy of one queue.
#[derive(Clone)]
pub struct SubscriptionConfiguration {
    consumers: Vec<Arc<dyn MessageConsumer>>,
    fallback: Arc<dyn FallbackStrategy>,
}

impl Default for SubscriptionConfiguration {
    fn default() -> Self {
        SubscriptionConfiguration {
            consumers: vec![],
            fallback: Arc::new(NoFallbackStrategy),
        }
    }
}

impl SubscriptionConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a consumer for messages bound to `T`.
    ///
    /// Every consumer whose type matches a delivery runs for it, concurrently.
    pub fn consumes<T, C>(mut self, consumer: C) -> Self
    where
        T: Message,
        C: Consumer<T> + 'static,
    {
        self.consumers.push(Arc::new(TypedConsumer {
            consumer,
            _message: PhantomData,
        }));
        self
    }

    /// Sets what happens to deliveries that must not be requeued, replacing
    /// [`NoFallbackStrategy`](crate::fallback::NoFallbackStrategy).
    pub fn fallback_by(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = strategy;
        self
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

/// Runs the consumers of a classified message and aggregates their results.
pub(crate) async fn dispatch(
    message: InboundMessage,
    consumers: &[Arc<dyn MessageConsumer>],
    outbound: &Arc<OutboundChannel>,
) -> AggregateConsumingResult {
    let message = Arc::new(message);

    let consumable = match message.as_ref() {
        InboundMessage::Consumable(consumable) => consumable,
        _ => return AggregateConsumingResult::non_consumable(message.clone()),
    };

    let subscribed = consumers
        .iter()
        .filter(|consumer| consumer.accepts(consumable.binding()))
        .cloned()
        .collect::<Vec<_>>();

    if subscribed.is_empty() {
        warn!(
            message_type = consumable.binding().raw_name(),
            "no consumer subscribed to message type"
        );
    }

    let results = join_all(
        subscribed
            .into_iter()
            .map(|consumer| isolated_consume(consumer, consumable, outbound.clone())),
    )
    .await;

    AggregateConsumingResult::aggregate(message, results)
}

async fn isolated_consume(
    consumer: Arc<dyn MessageConsumer>,
    message: &ErasedMessage,
    outbound: Arc<OutboundChannel>,
) -> ConsumingResult {
    let outcome = AssertUnwindSafe(consumer.consume(message, outbound))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => ConsumingResult::success(consumer),
        Ok(Err(err)) => ConsumingResult::failure(consumer, CapturedError::from(err)),
        Err(panic) => {
            let err = AmqpError::ConsumerPanicked(panic_message(&*panic));
            ConsumingResult::failure(consumer, Arc::new(err))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }

    panic
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

/// Takes deliveries of one queue from classification to reply.
pub struct ConsumingPipeline {
    queue: Queue,
    builder: ConsumedMessageBuilder,
    consumers: Vec<Arc<dyn MessageConsumer>>,
    fallback: Arc<dyn FallbackStrategy>,
    inbound: Arc<InboundChannel>,
    outbound: Arc<OutboundChannel>,
}

impl ConsumingPipeline {
    /// Creates the pipeline for one subscribed queue.
    ///
    /// # Parameters
    /// * `queue` - The consumed queue
    /// * `subscription` - Consumers and fallback strategy
    /// * `configuration` - Bindings and serialization used to classify deliveries
    /// * `inbound` - Channel the deliveries arrive on and are answered through
    /// * `outbound` - Channel handed to consumers and to the fallback
    pub fn new(
        queue: Queue,
        subscription: SubscriptionConfiguration,
        configuration: &ChannelConfiguration,
        inbound: Arc<InboundChannel>,
        outbound: Arc<OutboundChannel>,
    ) -> Self {
        ConsumingPipeline {
            queue,
            builder: ConsumedMessageBuilder::new(configuration),
            consumers: subscription.consumers,
            fallback: subscription.fallback,
            inbound,
            outbound,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Processes one delivery, replying to the broker exactly once.
    ///
    /// # Parameters
    /// * `delivery` - The raw delivery
    ///
    /// # Returns
    /// * `Result<AggregateConsumingResult, AmqpError>` - The aggregated consumer
    ///   results once the delivery was settled. An error means the delivery could
    ///   not be settled and is still unacknowledged on the broker
    pub async fn process(
        &self,
        delivery: InboundDelivery,
    ) -> Result<AggregateConsumingResult, AmqpError> {
        let tracer = global::tracer("carrot consumer");
        let (_, mut span) = otel::new_span(&delivery.properties, &tracer, delivery.message_type());

        debug!(
            queue = self.queue.name(),
            message_type = delivery.message_type(),
            exchange = delivery.exchange.as_str(),
            delivery_tag = delivery.delivery_tag,
            "message received"
        );

        let message = self.builder.build(delivery);
        self.log_classification(&message);

        let result = dispatch(message, &self.consumers, &self.outbound).await;
        for err in result.errors() {
            error!(
                error = err.to_string(),
                queue = self.queue.name(),
                "consumer failed"
            );
        }

        match self.settle(&result).await {
            Ok(()) => {
                result.notify_consuming_completion();
                if result.outcome().is_failure() {
                    span.set_status(Status::Error {
                        description: Cow::from(result.outcome().as_str()),
                    });
                } else {
                    span.set_status(Status::Ok);
                }
                Ok(result)
            }
            Err(err) => {
                result.notify_consuming_fault(&err);
                result.notify_consuming_completion();
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                Err(err)
            }
        }
    }

    async fn settle(&self, result: &AggregateConsumingResult) -> Result<(), AmqpError> {
        match result.reply(&self.inbound).await? {
            ReplyOutcome::Acknowledged | ReplyOutcome::Requeued => Ok(()),
            ReplyOutcome::Deferred => {
                match self.fallback.apply(&self.outbound, result.message()).await {
                    FallbackApplied::Successful => {
                        self.inbound
                            .acknowledge(result.message().delivery().delivery_tag)
                            .await
                    }
                    FallbackApplied::Failure(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.queue.name(),
                            "fallback failed, leaving message unacknowledged"
                        );
                        Err(AmqpError::FallbackError(err.to_string()))
                    }
                }
            }
        }
    }

    fn log_classification(&self, message: &InboundMessage) {
        let delivery = message.delivery();
        match message {
            InboundMessage::Consumable(_) => {}
            InboundMessage::Unresolved(_) => error!(
                message_type = delivery.message_type(),
                "message type cannot be resolved"
            ),
            InboundMessage::Unsupported(_) => error!(
                content_type = %delivery.content_type(),
                "content type is not supported"
            ),
            InboundMessage::Corrupted(_) => error!(
                message_type = delivery.message_type(),
                "message content corruption detected"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{Confirm, MockAmqpTransport},
        fallback::DeadLetterStrategy,
        publisher::OutboundMessage,
        results::ConsumingOutcome,
        testing::{configuration, confirmed, delivery, Bar, Foo},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Reply,
    }

    #[derive(Default)]
    struct Observed {
        consumed: AtomicUsize,
        completed: AtomicUsize,
        errors: Mutex<Vec<String>>,
        contents: Mutex<Vec<i32>>,
    }

    impl Observed {
        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    struct FooConsumer {
        behavior: Behavior,
        observed: Arc<Observed>,
    }

    #[async_trait]
    impl Consumer<Foo> for FooConsumer {
        async fn consume(&self, context: ConsumingContext<Foo>) -> Result<(), ConsumerError> {
            self.observed.consumed.fetch_add(1, Ordering::SeqCst);
            self.observed
                .contents
                .lock()
                .unwrap()
                .push(context.message().content().bar);

            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err("boom".into()),
                Behavior::Panic => panic!("consumer exploded"),
                Behavior::Reply => {
                    let reply = OutboundMessage::new(Bar {
                        text: "pong".to_owned(),
                    });
                    let exchange = crate::exchange::Exchange::new("replies");
                    match context.outbound().publish(&reply, &exchange, "").await {
                        crate::results::PublishResult::Success(_) => Ok(()),
                        crate::results::PublishResult::Failure(failure) => Err(failure.error.into()),
                    }
                }
            }
        }

        fn on_consume_completion(&self) {
            self.observed.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, error: &(dyn Error + Send + Sync + 'static)) {
            self.observed.errors.lock().unwrap().push(error.to_string());
        }
    }

    struct BarConsumer(Arc<Observed>);

    #[async_trait]
    impl Consumer<Bar> for BarConsumer {
        async fn consume(&self, _context: ConsumingContext<Bar>) -> Result<(), ConsumerError> {
            self.0.consumed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn foo_consumer(behavior: Behavior) -> (FooConsumer, Arc<Observed>) {
        let observed = Arc::new(Observed::default());
        (
            FooConsumer {
                behavior,
                observed: observed.clone(),
            },
            observed,
        )
    }

    fn pipeline(
        subscription: SubscriptionConfiguration,
        inbound: MockAmqpTransport,
        outbound: MockAmqpTransport,
    ) -> ConsumingPipeline {
        ConsumingPipeline::new(
            Queue::new("queue"),
            subscription,
            &configuration(),
            Arc::new(InboundChannel::new(Arc::new(inbound))),
            Arc::new(OutboundChannel::new(Arc::new(outbound), configuration())),
        )
    }

    fn expect_single_ack(inbound: &mut MockAmqpTransport) {
        inbound
            .expect_ack()
            .withf(|tag| *tag == 42)
            .times(1)
            .returning(|_| Ok(()));
        inbound.expect_nack().never();
    }

    fn foo_delivery(redelivered: bool) -> InboundDelivery {
        delivery("urn:message:fake", br#"{"Bar":42}"#, redelivered)
    }

    #[tokio::test]
    async fn successful_consumer_acknowledges() {
        let (consumer, observed) = foo_consumer(Behavior::Succeed);
        let mut inbound = MockAmqpTransport::new();
        expect_single_ack(&mut inbound);

        let pipeline = pipeline(
            SubscriptionConfiguration::new().consumes(consumer),
            inbound,
            MockAmqpTransport::new(),
        );
        let result = pipeline.process(foo_delivery(false)).await.unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::Success);
        assert_eq!(*observed.contents.lock().unwrap(), vec![42]);
        assert_eq!(observed.completed.load(Ordering::SeqCst), 1);
        assert!(observed.errors().is_empty());
    }

    #[tokio::test]
    async fn first_failure_requeues() {
        let (consumer, observed) = foo_consumer(Behavior::Fail);
        let mut inbound = MockAmqpTransport::new();
        inbound.expect_ack().never();
        inbound
            .expect_nack()
            .withf(|tag, requeue| *tag == 42 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let pipeline = pipeline(
            SubscriptionConfiguration::new().consumes(consumer),
            inbound,
            MockAmqpTransport::new(),
        );
        let result = pipeline.process(foo_delivery(false)).await.unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::ConsumingFailure);
        assert_eq!(observed.errors(), vec!["boom".to_owned()]);
        assert_eq!(observed.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reiterated_failure_is_dead_lettered_then_acknowledged() {
        let (consumer, _) = foo_consumer(Behavior::Fail);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut inbound = MockAmqpTransport::new();
        inbound.expect_nack().never();
        inbound.expect_ack().withf(|tag| *tag == 42).times(1).returning({
            let calls = calls.clone();
            move |_| {
                calls.lock().unwrap().push("ack");
                Ok(())
            }
        });

        let mut outbound = MockAmqpTransport::new();
        outbound
            .expect_declare_exchange()
            .withf(|exchange| exchange.name() == "queue::dle")
            .times(1)
            .returning({
                let calls = calls.clone();
                move |_| {
                    calls.lock().unwrap().push("declare");
                    Ok(())
                }
            });
        outbound
            .expect_publish()
            .withf(|exchange, _, _, body| {
                exchange == "queue::dle" && body.as_slice() == br#"{"Bar":42}"#
            })
            .times(1)
            .returning({
                let calls = calls.clone();
                move |_, _, _, _| {
                    calls.lock().unwrap().push("publish");
                    confirmed(Confirm::Ack)
                }
            });

        let pipeline = pipeline(
            SubscriptionConfiguration::new()
                .consumes(consumer)
                .fallback_by(Arc::new(DeadLetterStrategy::new(&Queue::new("queue")))),
            inbound,
            outbound,
        );
        let result = pipeline.process(foo_delivery(true)).await.unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::ReiteratedConsumingFailure);
        assert_eq!(*calls.lock().unwrap(), vec!["declare", "publish", "ack"]);
    }

    #[tokio::test]
    async fn failed_fallback_leaves_delivery_unacknowledged() {
        let (consumer, observed) = foo_consumer(Behavior::Fail);
        let mut inbound = MockAmqpTransport::new();
        inbound.expect_ack().never();
        inbound.expect_nack().never();

        let mut outbound = MockAmqpTransport::new();
        outbound.expect_declare_exchange().returning(|_| Ok(()));
        outbound
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("closed".to_owned())));

        let pipeline = pipeline(
            SubscriptionConfiguration::new()
                .consumes(consumer)
                .fallback_by(Arc::new(DeadLetterStrategy::new(&Queue::new("queue")))),
            inbound,
            outbound,
        );
        let result = pipeline.process(foo_delivery(true)).await;

        assert!(matches!(result, Err(AmqpError::FallbackError(_))));
        assert_eq!(observed.errors().len(), 2);
        assert_eq!(observed.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_consumable_message_skips_consumers() {
        let (consumer, observed) = foo_consumer(Behavior::Succeed);
        let mut inbound = MockAmqpTransport::new();
        expect_single_ack(&mut inbound);

        let pipeline = pipeline(
            SubscriptionConfiguration::new().consumes(consumer),
            inbound,
            MockAmqpTransport::new(),
        );
        let result = pipeline
            .process(delivery("urn:message:fake", b"{not json", false))
            .await
            .unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::CorruptedMessage);
        assert_eq!(observed.consumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_consumer_does_not_stop_siblings() {
        let (failing, failing_observed) = foo_consumer(Behavior::Panic);
        let (succeeding, succeeding_observed) = foo_consumer(Behavior::Succeed);
        let mut inbound = MockAmqpTransport::new();
        inbound
            .expect_nack()
            .withf(|tag, requeue| *tag == 42 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let pipeline = pipeline(
            SubscriptionConfiguration::new()
                .consumes(failing)
                .consumes(succeeding),
            inbound,
            MockAmqpTransport::new(),
        );
        let result = pipeline.process(foo_delivery(false)).await.unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::ConsumingFailure);
        assert_eq!(result.results().len(), 2);
        assert_eq!(succeeding_observed.consumed.load(Ordering::SeqCst), 1);
        assert_eq!(
            failing_observed.errors(),
            vec!["consumer panicked `consumer exploded`".to_owned()]
        );
        assert!(succeeding_observed.errors().is_empty());
    }

    #[tokio::test]
    async fn dispatches_only_to_matching_message_type() {
        let (foo, foo_observed) = foo_consumer(Behavior::Succeed);
        let bar_observed = Arc::new(Observed::default());
        let mut inbound = MockAmqpTransport::new();
        expect_single_ack(&mut inbound);

        let pipeline = pipeline(
            SubscriptionConfiguration::new()
                .consumes(foo)
                .consumes(BarConsumer(bar_observed.clone())),
            inbound,
            MockAmqpTransport::new(),
        );
        let result = pipeline.process(foo_delivery(false)).await.unwrap();

        assert_eq!(result.results().len(), 1);
        assert_eq!(foo_observed.consumed.load(Ordering::SeqCst), 1);
        assert_eq!(bar_observed.consumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn message_without_consumer_is_acknowledged() {
        let mut inbound = MockAmqpTransport::new();
        expect_single_ack(&mut inbound);

        let pipeline = pipeline(SubscriptionConfiguration::new(), inbound, MockAmqpTransport::new());
        let result = pipeline.process(foo_delivery(false)).await.unwrap();

        assert_eq!(result.outcome(), ConsumingOutcome::Success);
        assert!(result.results().is_empty());
    }

    #[tokio::test]
    async fn consumer_replies_through_outbound_channel() {
        let (consumer, _) = foo_consumer(Behavior::Reply);
        let mut inbound = MockAmqpTransport::new();
        expect_single_ack(&mut inbound);

        let mut outbound = MockAmqpTransport::new();
        outbound
            .expect_publish()
            .withf(|exchange, _, properties, _| {
                exchange == "replies"
                    && properties.kind().as_ref().map(|k| k.as_str()) == Some("urn:message:bar")
            })
            .times(1)
            .returning(|_, _, _, _| confirmed(Confirm::Ack));

        let pipeline = pipeline(
            SubscriptionConfiguration::new().consumes(consumer),
            inbound,
            outbound,
        );

        let result = pipeline.process(foo_delivery(false)).await.unwrap();
        assert_eq!(result.outcome(), ConsumingOutcome::Success);
    }

    #[tokio::test]
    async fn reply_failure_is_reported_to_consumers() {
        let (consumer, observed) = foo_consumer(Behavior::Succeed);
        let mut inbound = MockAmqpTransport::new();
        inbound
            .expect_ack()
            .returning(|_| Err(AmqpError::AckMessageError));

        let pipeline = pipeline(
            SubscriptionConfiguration::new().consumes(consumer),
            inbound,
            MockAmqpTransport::new(),
        );

        assert_eq!(
            pipeline.process(foo_delivery(false)).await.unwrap_err(),
            AmqpError::AckMessageError
        );
        assert_eq!(observed.errors().len(), 1);
        assert_eq!(observed.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_owned()), "owned");
        assert_eq!(panic_message(&42), "unknown panic payload");
    }
}
