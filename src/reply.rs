// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reply Targets
//!
//! RPC style messages carry where the answer should be published in the
//! `reply_to` property, formatted as a publication address:
//! `<exchange type>://<exchange>/<routing key>`.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// Where a reply to a message should be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyConfiguration {
    Direct { exchange: String, routing_key: String },
    Topic { exchange: String, routing_key: String },
    Fanout { exchange: String },
}

impl ReplyConfiguration {
    /// Builds a reply target from an exchange type name.
    ///
    /// # Parameters
    /// * `exchange_type` - `direct`, `topic` or `fanout`, any case
    /// * `exchange` - Exchange the reply goes to
    /// * `routing_key` - Routing key, ignored for fanout
    ///
    /// # Returns
    /// * `Result<ReplyConfiguration, AmqpError>` - `UnknownExchangeType` for any
    ///   other exchange type
    pub fn new(exchange_type: &str, exchange: &str, routing_key: &str) -> Result<Self, AmqpError> {
        match exchange_type.to_lowercase().as_str() {
            "direct" => Ok(ReplyConfiguration::Direct {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            }),
            "topic" => Ok(ReplyConfiguration::Topic {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            }),
            "fanout" => Ok(ReplyConfiguration::Fanout {
                exchange: exchange.to_owned(),
            }),
            _ => Err(AmqpError::UnknownExchangeType(exchange_type.to_owned())),
        }
    }

    pub fn exchange_type(&self) -> &'static str {
        match self {
            ReplyConfiguration::Direct { .. } => "direct",
            ReplyConfiguration::Topic { .. } => "topic",
            ReplyConfiguration::Fanout { .. } => "fanout",
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            ReplyConfiguration::Direct { exchange, .. }
            | ReplyConfiguration::Topic { exchange, .. }
            | ReplyConfiguration::Fanout { exchange } => exchange,
        }
    }

    /// Fanout replies ignore the routing key, so it is empty.
    pub fn routing_key(&self) -> &str {
        match self {
            ReplyConfiguration::Direct { routing_key, .. }
            | ReplyConfiguration::Topic { routing_key, .. } => routing_key,
            ReplyConfiguration::Fanout { .. } => "",
        }
    }
}

impl fmt::Display for ReplyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.exchange_type(),
            self.exchange(),
            self.routing_key()
        )
    }
}

impl FromStr for ReplyConfiguration {
    type Err = AmqpError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let invalid = || AmqpError::InvalidReplyAddress(source.to_owned());

        let (exchange_type, rest) = source.split_once("://").ok_or_else(invalid)?;
        let (exchange, routing_key) = rest.split_once('/').unwrap_or((rest, ""));

        ReplyConfiguration::new(exchange_type, exchange, routing_key).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_publication_address() {
        let direct = ReplyConfiguration::new("direct", "reply_exchange", "reply_to_queue").unwrap();
        assert_eq!(direct.to_string(), "direct://reply_exchange/reply_to_queue");

        let fanout = ReplyConfiguration::new("FANOUT", "broadcast", "ignored").unwrap();
        assert_eq!(fanout.to_string(), "fanout://broadcast/");
    }

    #[test]
    fn parses_publication_address() {
        assert_eq!(
            "topic://events/order.*".parse::<ReplyConfiguration>(),
            Ok(ReplyConfiguration::Topic {
                exchange: "events".to_owned(),
                routing_key: "order.*".to_owned(),
            })
        );
        assert_eq!(
            "fanout://broadcast".parse::<ReplyConfiguration>(),
            Ok(ReplyConfiguration::Fanout {
                exchange: "broadcast".to_owned(),
            })
        );
    }

    #[test]
    fn rejects_unknown_exchange_types() {
        assert_eq!(
            ReplyConfiguration::new("headers", "x", "y"),
            Err(AmqpError::UnknownExchangeType("headers".to_owned()))
        );
        assert!("reply_queue".parse::<ReplyConfiguration>().is_err());
        assert!("headers://x/y".parse::<ReplyConfiguration>().is_err());
    }
}
