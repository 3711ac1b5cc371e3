// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Shared fixtures for unit tests.

use crate::{
    binding::{Message, MessageBindingResolver, MessageTypeResolver},
    channel::{AmqpTransport, Confirm, PendingConfirm},
    configs::{ChannelConfiguration, MessageIdGenerator},
    errors::AmqpError,
    exchange::Exchange,
    message::InboundDelivery,
};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use futures_util::{future, FutureExt};
use lapin::{types::ShortString, BasicProperties};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Foo {
    #[serde(rename = "Bar")]
    pub bar: i32,
}

impl Message for Foo {
    const MESSAGE_TYPE: &'static str = "urn:message:fake";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(default)]
    pub text: String,
}

impl Message for Bar {
    const MESSAGE_TYPE: &'static str = "urn:message:bar";
    const EXPIRES_AFTER: Option<Duration> = Some(Duration::from_secs(18));
}

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_2015() -> Self {
        FixedClock(Utc.with_ymd_and_hms(2015, 1, 2, 3, 4, 5).unwrap())
    }
}

impl Clock for FixedClock {
    fn local(&self) -> DateTime<Local> {
        self.0.with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        self.0
    }
}

pub struct FixedIdGenerator(pub &'static str);

impl MessageIdGenerator for FixedIdGenerator {
    fn next(&self) -> String {
        self.0.to_owned()
    }
}

pub fn resolver() -> Arc<dyn MessageTypeResolver> {
    Arc::new(
        MessageBindingResolver::builder()
            .register::<Foo>()
            .register::<Bar>()
            .build()
            .unwrap(),
    )
}

pub fn configuration() -> ChannelConfiguration {
    ChannelConfiguration::new(resolver())
        .generates_message_id_by(Arc::new(FixedIdGenerator("one-id")))
        .clock(Arc::new(FixedClock::at_2015()))
}

pub fn delivery(message_type: &str, body: &[u8], redelivered: bool) -> InboundDelivery {
    InboundDelivery {
        exchange: "source_exchange".to_owned(),
        routing_key: "".to_owned(),
        properties: BasicProperties::default()
            .with_type(ShortString::from(message_type))
            .with_content_type(ShortString::from("application/json")),
        body: body.to_vec(),
        delivery_tag: 42,
        redelivered,
        consumer_tag: "consumer-1".to_owned(),
    }
}

/// A publish the broker answers straight away.
pub fn confirmed(confirm: Confirm) -> Result<PendingConfirm, AmqpError> {
    let outcome: Result<Confirm, AmqpError> = Ok(confirm);
    Ok(future::ready(outcome).boxed())
}

/// A publish the broker never answers.
pub fn never_confirmed() -> Result<PendingConfirm, AmqpError> {
    Ok(future::pending().boxed())
}

/// A transport that holds every call for a moment, recording the calls in
/// order and the most calls ever in progress at once.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn record(&self, call: String) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AmqpTransport for RecordingTransport {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), AmqpError> {
        self.record(format!("declare {}", exchange.name())).await;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        _properties: BasicProperties,
        _body: Vec<u8>,
    ) -> Result<PendingConfirm, AmqpError> {
        self.record(format!("publish {exchange}")).await;
        confirmed(Confirm::Ack)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(format!("ack {delivery_tag}")).await;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(format!("nack {delivery_tag} {requeue}")).await;
        Ok(())
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.record(format!("close {reply_code} {reply_text}")).await;
        Ok(())
    }
}
