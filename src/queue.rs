// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types describing queues, their bindings and the consumer prefetch window.
//! Dead-letter arguments live here because rejected messages reach the
//! dead-letter exchange purely through queue configuration.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Queues are durable by default. Extra arguments such as TTL, max length or the
/// dead-letter target are collected into the declaration's argument table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter: Option<(String, String)>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive queue definition.
    ///
    /// # Parameters
    /// * `name` - The queue name
    ///
    /// # Returns
    /// A new QueueDefinition
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the queue transient, dropped on broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when the last consumer leaves.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the queue passive, checking for existence without creating it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Declares without waiting for the broker's reply.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - Message lifetime in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum total size of the messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    ///
    /// This is where a dropped message ends up once the retry budget is spent.
    ///
    /// # Parameters
    /// * `exchange` - The dead-letter exchange
    /// * `routing_key` - The routing key used for dead-lettered messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some((exchange.to_owned(), routing_key.to_owned()));
        self
    }

    /// Adds a single raw argument to the declaration.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = self.params.clone();

        if let Some((exchange, routing_key)) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        FieldTable::from(args)
    }
}

/// A queue ↔ exchange binding with its routing key.
///
/// An empty routing key is the unkeyed binding used for fanout exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates an unkeyed binding of `queue`.
    ///
    /// # Parameters
    /// * `queue` - The queue to bind
    ///
    /// # Returns
    /// A new QueueBinding
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange the queue is bound to.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the binding's routing key.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// Consumer prefetch window applied through `basic.qos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosDefinition {
    /// Maximum unacknowledged bytes, 0 means unlimited
    pub prefetch_size: u32,
    /// Maximum unacknowledged messages
    pub prefetch_count: u16,
    /// Apply to the whole channel instead of each consumer
    pub global: bool,
}

impl Default for QosDefinition {
    fn default() -> Self {
        QosDefinition {
            prefetch_size: 0,
            prefetch_count: 1,
            global: false,
        }
    }
}
