// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! [`RabbitMQConfigs`] holds the broker connection settings. It can be
//! deserialized from any serde source or read from `RABBITMQ_*` environment
//! variables.
//!
//! [`ChannelConfiguration`] holds everything the message pipeline needs at
//! runtime: type resolution, serialization, id generation, the clock used
//! for timestamps and the publish mode. It is built once and shared.

use crate::{
    binding::MessageTypeResolver, errors::AmqpError, serialization::SerializationConfiguration,
};
use mockable::{Clock, DefaultClock};
use serde::Deserialize;
use std::{env, sync::Arc, time::Duration};
use uuid::Uuid;

/// Default deadline for a broker confirm in reliable mode.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub prefetch_count: Option<u16>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "carrot".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            prefetch_count: None,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads `APP_NAME`, `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST` and `RABBITMQ_PREFETCH_COUNT`,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, AmqpError> {
        let defaults = RabbitMQConfigs::default();

        let port = match env::var("RABBITMQ_PORT") {
            Ok(port) => port
                .parse::<u16>()
                .map_err(|_| AmqpError::InvalidConfiguration(format!("RABBITMQ_PORT={port}")))?,
            Err(_) => defaults.port,
        };

        let prefetch_count = match env::var("RABBITMQ_PREFETCH_COUNT") {
            Ok(count) => Some(count.parse::<u16>().map_err(|_| {
                AmqpError::InvalidConfiguration(format!("RABBITMQ_PREFETCH_COUNT={count}"))
            })?),
            Err(_) => defaults.prefetch_count,
        };

        let configs = RabbitMQConfigs {
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port,
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
            prefetch_count,
        };

        configs.validate()?;
        Ok(configs)
    }

    /// Rejects settings no broker connection can be made with.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.is_empty() {
            return Err(AmqpError::InvalidConfiguration("empty host".to_owned()));
        }

        if self.prefetch_count == Some(0) {
            return Err(AmqpError::InvalidConfiguration(
                "prefetch count must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// The `amqp://` URI for these settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Generates ids for outbound messages.
pub trait MessageIdGenerator: Send + Sync {
    fn next(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidMessageIdGenerator;

impl MessageIdGenerator for UuidMessageIdGenerator {
    fn next(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// How the outbound channel reports publish results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// The result is known once the frame is written.
    #[default]
    FireAndForget,
    /// The result waits for the broker confirm of that publish.
    Reliable,
}

/// Runtime configuration shared by the inbound and outbound pipelines.
#[derive(Clone)]
pub struct ChannelConfiguration {
    pub(crate) resolver: Arc<dyn MessageTypeResolver>,
    pub(crate) serialization: Arc<SerializationConfiguration>,
    pub(crate) id_generator: Arc<dyn MessageIdGenerator>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) publish_mode: PublishMode,
    pub(crate) confirm_timeout: Duration,
}

impl ChannelConfiguration {
    pub fn new(resolver: Arc<dyn MessageTypeResolver>) -> Self {
        ChannelConfiguration {
            resolver,
            serialization: Arc::new(SerializationConfiguration::default()),
            id_generator: Arc::new(UuidMessageIdGenerator),
            clock: Arc::new(DefaultClock),
            publish_mode: PublishMode::default(),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn configure_serialization(mut self, serialization: SerializationConfiguration) -> Self {
        self.serialization = Arc::new(serialization);
        self
    }

    pub fn generates_message_id_by(mut self, generator: Arc<dyn MessageIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Waits for broker confirms before reporting publish results.
    pub fn reliable(mut self) -> Self {
        self.publish_mode = PublishMode::Reliable;
        self
    }

    /// Sets how long a reliable publish waits for its broker confirm.
    ///
    /// # Parameters
    /// * `timeout` - The deadline, 30 seconds unless set
    ///
    /// # Returns
    /// * `Result<Self, AmqpError>` - `InvalidConfiguration` for a zero timeout
    pub fn confirm_timeout(mut self, timeout: Duration) -> Result<Self, AmqpError> {
        if timeout.is_zero() {
            return Err(AmqpError::InvalidConfiguration(
                "confirm timeout must be greater than zero".to_owned(),
            ));
        }

        self.confirm_timeout = timeout;
        Ok(self)
    }

    pub fn resolver(&self) -> &Arc<dyn MessageTypeResolver> {
        &self.resolver
    }

    pub fn serialization(&self) -> &SerializationConfiguration {
        &self.serialization
    }

    pub fn publish_mode(&self) -> PublishMode {
        self.publish_mode
    }
}
