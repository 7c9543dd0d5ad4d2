// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges a process publishes to or binds its queues against.
//! Definitions are owned values so they can be stored in the topology registry and
//! replayed on every (re)declaration.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type provided by the delayed message exchange plugin
pub const AMQP_DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: exact routing-key match
/// - Fanout: every bound queue, routing key ignored
/// - Topic: wildcard pattern match
/// - Headers: header value match
/// - XMessageDelayed: delayed delivery (plugin required), wraps one of the above
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    /// Name of the kind as understood by the broker.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => AMQP_DELAYED_EXCHANGE_KIND,
        }
    }
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => Ok(lapin::ExchangeKind::Custom(
                AMQP_DELAYED_EXCHANGE_KIND.to_owned(),
            )),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with chained setters. Exchanges are durable by default because the
/// orchestration layer only deals with long-lived topology.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a durable direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    ///
    /// # Returns
    /// A new ExchangeDefinition
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: true,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The routing behaviour of the exchange.
    ///
    /// For delayed exchanges this is the wrapped kind from `x-delayed-type`, which is
    /// what decides whether unkeyed bindings apply.
    pub fn routing_kind(&self) -> ExchangeKind {
        if self.kind != ExchangeKind::XMessageDelayed {
            return self.kind.clone();
        }

        match self.params.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE) {
            Some(AMQPValue::LongString(v)) => match String::from_utf8_lossy(v.as_bytes()).as_ref() {
                "fanout" => ExchangeKind::Fanout,
                "topic" => ExchangeKind::Topic,
                "headers" => ExchangeKind::Headers,
                _ => ExchangeKind::Direct,
            },
            _ => ExchangeKind::Direct,
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Turns the exchange into a delayed exchange routing like `kind`.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Parameters
    /// * `kind` - The routing behaviour written to `x-delayed-type`
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delayed(mut self, kind: ExchangeKind) -> Self {
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(kind.as_str())),
        );
        self.kind = ExchangeKind::XMessageDelayed;
        self
    }

    /// Sets the exchange parameters.
    ///
    /// # Parameters
    /// * `params` - A map of exchange parameters
    ///
    /// # Returns
    /// Self for method chaining
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single parameter to the exchange.
    ///
    /// # Parameters
    /// * `key` - The parameter name
    /// * `value` - The parameter value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange transient, dropped on broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
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

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}
