// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! [`RabbitMQDispatcher`] collects queue subscriptions and, on
//! [`RabbitMQDispatcher::connect`], opens the broker connection, the shared
//! outbound channel and one channel per subscribed queue.
//!
//! Every subscription runs a consume loop on its own task. Deliveries are
//! processed concurrently, each on a task of its own; the loop keeps track of
//! them so a shutdown can wait for in-flight deliveries to be settled.

use crate::{
    channel::{new_amqp_connection, ConnectionHandle, InboundChannel, LapinConnection},
    configs::{ChannelConfiguration, PublishMode, RabbitMQConfigs},
    connection::Connection,
    consumer::{ConsumingPipeline, SubscriptionConfiguration},
    errors::AmqpError,
    message::InboundDelivery,
    publisher::OutboundChannel,
    queue::Queue,
};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error};

/// Registers queue subscriptions and connects them to the broker.
pub struct RabbitMQDispatcher {
    configs: RabbitMQConfigs,
    configuration: ChannelConfiguration,
    subscriptions: Vec<(Queue, SubscriptionConfiguration)>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher with no subscriptions.
    ///
    /// # Parameters
    /// * `configs` - Broker connection settings
    /// * `configuration` - Bindings, serialization and publish options shared by
    ///   every channel
    pub fn new(configs: RabbitMQConfigs, configuration: ChannelConfiguration) -> Self {
        RabbitMQDispatcher {
            configs,
            configuration,
            subscriptions: vec![],
        }
    }

    /// Consumes `queue` with the given consumers once connected.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume; it must already exist on the broker
    /// * `subscription` - Consumers and fallback strategy for the queue
    ///
    /// # Returns
    /// * `Self` - The dispatcher, for chaining
    pub fn subscribe(mut self, queue: Queue, subscription: SubscriptionConfiguration) -> Self {
        self.subscriptions.push((queue, subscription));
        self
    }

    /// Number of registered subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Connects and starts consuming every subscribed queue.
    ///
    /// Settings and subscriptions are validated before anything is opened. If a
    /// channel cannot be set up, the connection is closed again.
    ///
    /// # Returns
    /// * `Result<Connection, AmqpError>` - The running connection, or the first
    ///   validation, connection or channel error
    pub async fn connect(self) -> Result<Connection, AmqpError> {
        self.validate()?;

        let connection = Arc::new(new_amqp_connection(&self.configs).await?);

        match self.start(&connection).await {
            Ok((outbound, subscriptions)) => Ok(Connection::new(connection, outbound, subscriptions)),
            Err(err) => {
                error!(error = err.to_string(), "failure to start subscriptions");
                if let Err(err) = connection.close(200, "Connection Disposed").await {
                    debug!(error = err.to_string(), "ignoring connection close failure");
                }
                Err(err)
            }
        }
    }

    fn validate(&self) -> Result<(), AmqpError> {
        self.configs.validate()?;

        for (index, (queue, _)) in self.subscriptions.iter().enumerate() {
            if queue.name().is_empty() {
                return Err(AmqpError::InvalidConfiguration(
                    "subscription to an unnamed queue".to_owned(),
                ));
            }

            if self.subscriptions[..index].iter().any(|(other, _)| other == queue) {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "queue `{}` subscribed more than once",
                    queue.name()
                )));
            }
        }

        Ok(())
    }

    async fn start(
        self,
        connection: &LapinConnection,
    ) -> Result<(Arc<OutboundChannel>, Vec<Subscription>), AmqpError> {
        let outbound_channel = connection.create_channel().await?;
        if self.configuration.publish_mode() == PublishMode::Reliable {
            outbound_channel.confirm_select().await?;
        }
        let outbound = Arc::new(OutboundChannel::new(
            Arc::new(outbound_channel),
            self.configuration.clone(),
        ));

        let mut subscriptions = vec![];
        for (queue, subscription) in self.subscriptions {
            let channel = connection.create_channel().await?;
            if let Some(prefetch_count) = self.configs.prefetch_count {
                channel.qos(prefetch_count).await?;
            }

            let consumer_tag = format!("{}-{}", self.configs.app_name, queue.name());
            let deliveries = channel.consume(queue.name(), &consumer_tag).await?;
            debug!(queue = queue.name(), "consumer started");

            let inbound = Arc::new(InboundChannel::new(Arc::new(channel)));
            let pipeline = ConsumingPipeline::new(
                queue,
                subscription,
                &self.configuration,
                inbound.clone(),
                outbound.clone(),
            );

            subscriptions.push(Subscription::start(deliveries, pipeline, inbound));
        }

        Ok((outbound, subscriptions))
    }
}

/// A running consume loop and the channel it acknowledges on.
pub(crate) struct Subscription {
    queue: String,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    inbound: Arc<InboundChannel>,
}

impl Subscription {
    pub(crate) fn start<S>(
        deliveries: S,
        pipeline: ConsumingPipeline,
        inbound: Arc<InboundChannel>,
    ) -> Self
    where
        S: Stream<Item = Result<InboundDelivery, AmqpError>> + Unpin + Send + 'static,
    {
        let (shutdown, stop) = watch::channel(false);
        let queue = pipeline.queue().name().to_owned();
        let worker = tokio::spawn(run_consumer(deliveries, Arc::new(pipeline), stop));

        Subscription {
            queue,
            shutdown,
            worker,
            inbound,
        }
    }

    /// Stops taking new deliveries.
    pub(crate) fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for in-flight deliveries, then closes the channel.
    pub(crate) async fn finish(self) {
        self.signal();
        if let Err(err) = self.worker.await {
            error!(error = err.to_string(), queue = self.queue.as_str(), "consume loop failed");
        }

        self.inbound.close().await;
        debug!(queue = self.queue.as_str(), "consumer disposed");
    }
}

/// Feeds deliveries to the pipeline until the stream ends or `stop` fires,
/// then waits for the deliveries still being processed.
pub(crate) async fn run_consumer<S>(
    mut deliveries: S,
    pipeline: Arc<ConsumingPipeline>,
    mut stop: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<InboundDelivery, AmqpError>> + Unpin + Send,
{
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    let pipeline = pipeline.clone();
                    in_flight.spawn(async move {
                        if let Err(err) = pipeline.process(delivery).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    });
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    debug!(queue = pipeline.queue().name(), "delivery stream ended");
                    break;
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    error!(error = err.to_string(), "delivery task failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(error = err.to_string(), "delivery task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpTransport,
        consumer::{Consumer, ConsumingContext},
        errors::ConsumerError,
        testing::{configuration, delivery, Foo},
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Consumer<Foo> for Counting {
        async fn consume(&self, _context: ConsumingContext<Foo>) -> Result<(), ConsumerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline(inbound: MockAmqpTransport, consumed: Arc<AtomicUsize>) -> Arc<ConsumingPipeline> {
        Arc::new(ConsumingPipeline::new(
            Queue::new("queue"),
            SubscriptionConfiguration::new().consumes(Counting(consumed)),
            &configuration(),
            Arc::new(InboundChannel::new(Arc::new(inbound))),
            Arc::new(OutboundChannel::new(
                Arc::new(MockAmqpTransport::new()),
                configuration(),
            )),
        ))
    }

    #[tokio::test]
    async fn processes_every_delivery_until_the_stream_ends() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let mut inbound = MockAmqpTransport::new();
        inbound.expect_ack().times(2).returning(|_| Ok(()));

        let deliveries = stream::iter(vec![
            Ok(delivery("urn:message:fake", br#"{"Bar":1}"#, false)),
            Err(AmqpError::BindingConsumerError("queue".to_owned())),
            Ok(delivery("urn:message:fake", br#"{"Bar":2}"#, false)),
        ]);
        let (_shutdown, stop) = watch::channel(false);

        run_consumer(deliveries, pipeline(inbound, consumed.clone()), stop).await;

        assert_eq!(consumed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_on_shutdown_signal() {
        let mut inbound = MockAmqpTransport::new();
        inbound.expect_ack().never();

        let (shutdown, stop) = watch::channel(false);
        let worker = tokio::spawn(run_consumer(
            stream::pending::<Result<InboundDelivery, AmqpError>>(),
            pipeline(inbound, Arc::new(AtomicUsize::new(0))),
            stop,
        ));

        shutdown.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn finished_subscription_closes_its_channel() {
        let mut inbound = MockAmqpTransport::new();
        inbound
            .expect_close()
            .withf(|code, text| *code == 200 && text == "Consumer Disposed")
            .times(1)
            .returning(|_, _| Ok(()));
        let inbound = Arc::new(InboundChannel::new(Arc::new(inbound)));

        let pipeline = ConsumingPipeline::new(
            Queue::new("queue"),
            SubscriptionConfiguration::new(),
            &configuration(),
            inbound.clone(),
            Arc::new(OutboundChannel::new(
                Arc::new(MockAmqpTransport::new()),
                configuration(),
            )),
        );

        Subscription::start(
            stream::pending::<Result<InboundDelivery, AmqpError>>(),
            pipeline,
            inbound,
        )
        .finish()
        .await;
    }

    #[tokio::test]
    async fn rejects_duplicate_subscriptions_before_connecting() {
        let dispatcher = RabbitMQDispatcher::new(RabbitMQConfigs::default(), configuration())
            .subscribe(Queue::new("orders"), SubscriptionConfiguration::new())
            .subscribe(Queue::new("orders"), SubscriptionConfiguration::new());

        assert_eq!(dispatcher.subscriptions(), 2);
        assert!(matches!(
            dispatcher.connect().await,
            Err(AmqpError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_connection_settings_before_connecting() {
        let configs = RabbitMQConfigs {
            prefetch_count: Some(0),
            ..RabbitMQConfigs::default()
        };

        assert!(matches!(
            RabbitMQDispatcher::new(configs, configuration()).connect().await,
            Err(AmqpError::InvalidConfiguration(_))
        ));
    }
}
