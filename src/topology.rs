// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry
//!
//! The static set of producers and consumers a process knows about. Producers are keyed by
//! exchange name and consumers by queue name; the registry is built once at startup and
//! shared read-only by the publisher, the consumer loop and the `init` command.
//!
//! The main components are:
//! - `ProducerDefinition`: the exchange a producer publishes to
//! - `ConsumerDefinition`: a queue, its binding, consumption settings and handler
//! - `Topology`: the registry, able to pre-declare everything it holds

use crate::{
    channel::{AmqpChannel, ConsumeOptions},
    declaration::DeclarationCache,
    dispatcher::RetryPolicy,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    queue::{QosDefinition, QueueDefinition},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

/// An exchange some code of this process publishes to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerDefinition {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
    pub(crate) mandatory: bool,
}

impl ProducerDefinition {
    pub fn new(exchange: ExchangeDefinition) -> Self {
        ProducerDefinition {
            exchange,
            routing_key: String::new(),
            mandatory: false,
        }
    }

    /// Default routing key, overridable per message.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Publishes with the mandatory flag so unroutable messages are returned.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.exchange.name
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }
}

/// A queue consumed by this process.
///
/// Defaults: QoS prefetch of one message, retries disabled with three attempts, requeue on
/// `Nack`/`Requeue`, unlimited consumption, enabled.
#[derive(Clone)]
pub struct ConsumerDefinition {
    pub(crate) queue: QueueDefinition,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_keys: Vec<String>,
    pub(crate) qos: Option<QosDefinition>,
    pub(crate) retry: RetryPolicy,
    pub(crate) requeue: bool,
    pub(crate) max_consumption: u64,
    pub(crate) options: ConsumeOptions,
    pub(crate) heartbeat: Option<u16>,
    pub(crate) enabled: bool,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl ConsumerDefinition {
    /// Creates a consumer of `queue` bound to `exchange`.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume
    /// * `exchange` - The exchange the queue is bound to
    /// * `handler` - Business logic invoked for each delivery
    pub fn new(
        queue: QueueDefinition,
        exchange: ExchangeDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        let options = ConsumeOptions {
            consumer_tag: format!("consumer_{}_{}", queue.name, Uuid::new_v4().simple()),
            ..ConsumeOptions::default()
        };

        ConsumerDefinition {
            queue,
            exchange,
            routing_keys: vec![],
            qos: Some(QosDefinition::default()),
            retry: RetryPolicy::default(),
            requeue: true,
            max_consumption: 0,
            options,
            heartbeat: None,
            enabled: true,
            handler,
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    pub fn routing_keys(mut self, keys: &[&str]) -> Self {
        self.routing_keys
            .extend(keys.iter().map(|key| (*key).to_owned()));
        self
    }

    /// Replaces the QoS settings; `None` leaves the broker's defaults in place.
    pub fn qos(mut self, qos: Option<QosDefinition>) -> Self {
        self.qos = qos;
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        let qos = self.qos.unwrap_or_default();
        self.qos = Some(QosDefinition {
            prefetch_count: count,
            ..qos
        });
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    /// Stops the consumer after this many deliveries; zero means unlimited.
    pub fn max_consumption(mut self, max: u64) -> Self {
        self.max_consumption = max;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.options.consumer_tag = tag.to_owned();
        self
    }

    pub fn no_local(mut self) -> Self {
        self.options.no_local = true;
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.options.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.options.exclusive = true;
        self
    }

    /// Heartbeat interval in seconds used instead of the consumer default.
    pub fn heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat = Some(secs);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }
}

/// Registry of the producers and consumers of a process.
#[derive(Clone, Default)]
pub struct Topology {
    producers: BTreeMap<String, ProducerDefinition>,
    consumers: BTreeMap<String, ConsumerDefinition>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn producer(mut self, def: ProducerDefinition) -> Self {
        self.producers.insert(def.name().to_owned(), def);
        self
    }

    pub fn consumer(mut self, def: ConsumerDefinition) -> Self {
        self.consumers.insert(def.name().to_owned(), def);
        self
    }

    pub fn get_producer(&self, exchange: &str) -> Result<&ProducerDefinition, AmqpError> {
        self.producers
            .get(exchange)
            .ok_or_else(|| AmqpError::ProducerNotFound(exchange.to_owned()))
    }

    pub fn get_consumer(&self, queue: &str) -> Result<&ConsumerDefinition, AmqpError> {
        self.consumers
            .get(queue)
            .ok_or_else(|| AmqpError::ConsumerNotFound(queue.to_owned()))
    }

    pub fn has_producer(&self, exchange: &str) -> bool {
        self.producers.contains_key(exchange)
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.consumers.contains_key(queue)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerDefinition> {
        self.producers.values()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerDefinition> {
        self.consumers.values()
    }

    /// Clears the declaration cache and declares every exchange, queue and binding.
    ///
    /// Disabled consumers are skipped. Any broker rejection aborts the installation.
    pub async fn install(
        &self,
        channel: &dyn AmqpChannel,
        cache: &DeclarationCache,
    ) -> Result<(), AmqpError> {
        cache.clear().await?;

        for producer in self.producers() {
            debug!("declaring producer exchange: {}", producer.name());
            cache.declare_exchange(channel, &producer.exchange).await?;
        }

        for consumer in self.consumers() {
            if !consumer.enabled {
                info!(queue = consumer.name(), "consumer disabled, skipping");
                continue;
            }

            debug!("declaring consumer queue: {}", consumer.name());
            cache.declare_exchange(channel, &consumer.exchange).await?;
            cache
                .declare_queue(
                    channel,
                    &consumer.queue,
                    &consumer.exchange,
                    &consumer.routing_keys,
                )
                .await?;
        }

        info!(
            producers = self.producers.len(),
            consumers = self.consumers.len(),
            "topology installed"
        );
        Ok(())
    }
}
