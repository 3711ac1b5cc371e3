// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Addressing
//!
//! Queues are declared outside of this crate. A [`Queue`] names the queue a
//! subscription consumes from and seeds the dead-letter exchange name.

use std::hash::Hash;

/// A queue consumed by a subscription.
///
/// Identity is the queue name; durability is informational.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl Queue {
    /// Creates a new non-durable queue reference with the given name.
    pub fn new(name: &str) -> Queue {
        Queue {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Marks the queue as durable.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Queue {}

impl Hash for Queue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
