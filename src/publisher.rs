// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages to the exchanges registered as producers. The exchange is declared
//! through the [`DeclarationCache`] before the first publish, publisher confirms are
//! awaited as a per-publish completion future, and the OpenTelemetry context of the
//! caller travels in the message headers.

use crate::{
    channel::AmqpChannel,
    config::Role,
    declaration::{DeclarationCache, EntityKind},
    errors::AmqpError,
    message::OutboundMessage,
    otel,
    supervisor::ConnectionSupervisor,
    topology::{ProducerDefinition, Topology},
};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Default time to wait for a publisher confirm
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call options of [`Publisher::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub delay_secs: u64,
    pub confirm: bool,
    pub timeout: Duration,
    pub message_id: Option<String>,
    pub routing_key: Option<String>,
    pub kind: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            delay_secs: 0,
            confirm: false,
            timeout: DEFAULT_CONFIRM_TIMEOUT,
            message_id: None,
            routing_key: None,
            kind: None,
        }
    }
}

impl SendOptions {
    /// Delays delivery, only honoured by delayed message exchanges.
    ///
    /// # Parameters
    /// * `secs` - Delay in seconds, sent as `x-delay` in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delay(mut self, secs: u64) -> Self {
        self.delay_secs = secs;
        self
    }

    /// Waits for the broker to confirm the publish.
    ///
    /// # Parameters
    /// * `timeout` - How long to wait for the ack
    ///
    /// # Returns
    /// Self for method chaining
    pub fn confirm(mut self, timeout: Duration) -> Self {
        self.confirm = true;
        self.timeout = timeout;
        self
    }

    /// Sets the message id instead of a random UUID.
    ///
    /// # Parameters
    /// * `id` - The message id, also the retry key on the consumer side
    ///
    /// # Returns
    /// Self for method chaining
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Overrides the producer's routing key.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    ///
    /// # Parameters
    /// * `kind` - The message type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }
}

/// Publishes to registered producers.
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    cache: Arc<DeclarationCache>,
    topology: Arc<Topology>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `supervisor` - Owner of the connection used to publish
    /// * `cache` - Declaration cache consulted before publishing
    /// * `topology` - Registered producers and consumers
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        cache: Arc<DeclarationCache>,
        topology: Arc<Topology>,
    ) -> Self {
        Publisher {
            supervisor,
            cache,
            topology,
        }
    }

    /// Publishes `message` to the producer registered for `exchange`.
    ///
    /// With `confirm`, waits up to `timeout` for the broker to settle the publish and
    /// returns whether it was acked without being nacked or returned. Without it the
    /// publish is fire-and-forget and reported as successful.
    ///
    /// When the broker reports a missing exchange or queue this process registered, the
    /// cache entry is invalidated before the error is returned.
    pub async fn produce(
        &self,
        exchange: &str,
        message: OutboundMessage,
        confirm: bool,
        timeout: Duration,
    ) -> Result<bool, AmqpError> {
        let producer = self.topology.get_producer(exchange)?;

        let result = self.publish(producer, message, confirm, timeout).await;
        if let Err(err) = &result {
            self.invalidate_missing(err).await;
        }

        result
    }

    /// Serializes `payload` as JSON, publishes it and reports success as a flag.
    ///
    /// Failures are logged, never returned.
    pub async fn send<T>(&self, exchange: &str, payload: &T, options: SendOptions) -> bool
    where
        T: Serialize + ?Sized,
    {
        let mut message = match OutboundMessage::json(payload) {
            Ok(message) => message,
            Err(err) => {
                error!(error = err.to_string(), exchange, "failure to serialize payload");
                return false;
            }
        };

        if let Some(id) = &options.message_id {
            message = message.message_id(id);
        }
        if let Some(key) = &options.routing_key {
            message = message.routing_key(key);
        }
        if let Some(kind) = &options.kind {
            message = message.kind(kind);
        }
        if options.delay_secs > 0 {
            message = message.delay_secs(options.delay_secs);
        }

        let message_id = message.id().to_owned();
        match self
            .produce(exchange, message, options.confirm, options.timeout)
            .await
        {
            Ok(true) => {
                info!(exchange, message_id, routing_key = ?options.routing_key, "producer success");
                true
            }
            Ok(false) => {
                warn!(exchange, message_id, "message was not confirmed by the broker");
                false
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, message_id, "producer failure"
                );
                false
            }
        }
    }

    async fn publish(
        &self,
        producer: &ProducerDefinition,
        mut message: OutboundMessage,
        confirm: bool,
        timeout: Duration,
    ) -> Result<bool, AmqpError> {
        let channel = if confirm {
            self.supervisor.acquire_confirm().await?
        } else {
            self.supervisor.acquire(Role::Producer).await?
        };

        self.ensure_exchange(channel.as_ref(), producer).await?;

        otel::inject_context(&Context::current(), &mut message.headers);
        message.mandatory |= producer.mandatory;
        let routing_key = message
            .routing_key
            .clone()
            .unwrap_or_else(|| producer.routing_key.clone());

        debug!(
            exchange = producer.name(),
            routing_key,
            message_id = message.id(),
            "publishing message"
        );

        let confirmation = channel
            .basic_publish(producer.name(), &routing_key, &message)
            .await?;

        if !confirm {
            return Ok(true);
        }

        let settled = tokio::time::timeout(timeout, confirmation)
            .await
            .map_err(|_| {
                error!(timeout = ?timeout, message_id = message.id(), "publish confirm timed out");
                AmqpError::ConfirmTimeout
            })??;

        if !settled.is_success() {
            warn!(
                message_id = message.id(),
                acked = settled.acked,
                nacked = settled.nacked,
                returned = settled.returned,
                "publish was not confirmed"
            );
        }

        Ok(settled.is_success())
    }

    async fn ensure_exchange(
        &self,
        channel: &dyn AmqpChannel,
        producer: &ProducerDefinition,
    ) -> Result<(), AmqpError> {
        let present = self
            .cache
            .exists(EntityKind::Exchange, producer.name(), self.supervisor.as_ref())
            .await;

        if present {
            return Ok(());
        }

        self.cache.declare_exchange(channel, &producer.exchange).await
    }

    async fn invalidate_missing(&self, err: &AmqpError) {
        let not_found = match err {
            AmqpError::ExchangeNotFound(_) | AmqpError::QueueNotFound(_) => Some(err.clone()),
            other => AmqpError::from_broker(&other.broker_text()),
        };

        match not_found {
            Some(AmqpError::ExchangeNotFound(name)) if self.topology.has_producer(&name) => {
                self.cache.invalidate(EntityKind::Exchange, &name).await;
            }
            Some(AmqpError::QueueNotFound(name)) if self.topology.has_consumer(&name) => {
                self.cache.invalidate(EntityKind::Queue, &name).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            AmqpConnection, MockAmqpChannel, MockAmqpConnection, MockAmqpConnector,
            PublishConfirm,
        },
        config::AmqpConfig,
        declaration::MockBrokerProbe,
        exchange::ExchangeDefinition,
        store::MemoryStore,
    };
    use futures_util::FutureExt;
    use serde_json::json;

    fn channel() -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().returning(|| true);
        channel.expect_confirm_select().returning(|| Ok(()));
        channel.expect_close().returning(|| Ok(()));
        channel
    }

    fn supervisor(channel: MockAmqpChannel) -> Arc<ConnectionSupervisor> {
        let channel = Arc::new(channel);

        let mut conn = MockAmqpConnection::new();
        conn.expect_is_connected().returning(|| true);
        conn.expect_open_channel()
            .returning(move || Ok(channel.clone() as Arc<dyn AmqpChannel>));
        conn.expect_close().returning(|| Ok(()));
        let conn = Arc::new(conn);

        let mut connector = MockAmqpConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(conn.clone() as Arc<dyn AmqpConnection>));

        Arc::new(ConnectionSupervisor::new(
            Arc::new(connector),
            AmqpConfig::default(),
        ))
    }

    fn cache() -> Arc<DeclarationCache> {
        Arc::new(DeclarationCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(3600),
        ))
    }

    fn topology() -> Arc<Topology> {
        Arc::new(
            Topology::new().producer(
                ProducerDefinition::new(ExchangeDefinition::new("orders").topic())
                    .routing_key("orders.created"),
            ),
        )
    }

    async fn known(cache: Arc<DeclarationCache>) -> Arc<DeclarationCache> {
        cache.mark(EntityKind::Exchange, "orders", true).await;
        cache
    }

    #[tokio::test]
    async fn nack_before_ack_reports_failure() {
        let mut channel = channel();
        channel.expect_basic_publish().times(1).returning(|_, _, _| {
            Ok(async {
                Ok(PublishConfirm {
                    acked: true,
                    nacked: true,
                    returned: false,
                })
            }
            .boxed())
        });

        let publisher = Publisher::new(supervisor(channel), known(cache()).await, topology());
        let ok = publisher
            .produce("orders", OutboundMessage::new(vec![]), true, DEFAULT_CONFIRM_TIMEOUT)
            .await
            .unwrap();

        assert!(!ok);
    }

    #[tokio::test]
    async fn acked_publish_uses_producer_routing_key() {
        let mut channel = channel();
        channel
            .expect_basic_publish()
            .withf(|exchange, key, _| exchange == "orders" && key == "orders.created")
            .times(1)
            .returning(|_, _, _| Ok(async { Ok(PublishConfirm::ack()) }.boxed()));

        let publisher = Publisher::new(supervisor(channel), known(cache()).await, topology());
        let ok = publisher
            .produce("orders", OutboundMessage::new(vec![]), true, DEFAULT_CONFIRM_TIMEOUT)
            .await
            .unwrap();

        assert!(ok);
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_confirm_times_out() {
        let mut channel = channel();
        channel
            .expect_basic_publish()
            .returning(|_, _, _| Ok(futures_util::future::pending().boxed()));

        let publisher = Publisher::new(supervisor(channel), known(cache()).await, topology());
        let err = publisher
            .produce("orders", OutboundMessage::new(vec![]), true, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::ConfirmTimeout);
    }

    #[tokio::test]
    async fn unknown_exchange_is_declared_before_first_publish() {
        let mut channel = channel();
        channel
            .expect_exchange_exists()
            .times(1)
            .returning(|name| Err(AmqpError::ExchangeNotFound(name.to_owned())));
        channel
            .expect_exchange_declare()
            .withf(|def| def.name == "orders")
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_basic_publish()
            .times(2)
            .returning(|_, _, _| Ok(async { Ok(PublishConfirm::ack()) }.boxed()));

        let publisher = Publisher::new(supervisor(channel), cache(), topology());
        for _ in 0..2 {
            assert!(publisher
                .produce("orders", OutboundMessage::new(vec![]), false, DEFAULT_CONFIRM_TIMEOUT)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn missing_exchange_invalidates_cache_entry() {
        let mut channel = channel();
        channel.expect_basic_publish().times(1).returning(|_, _, _| {
            Err(AmqpError::PublishingError(
                "NOT_FOUND - no exchange 'orders' in vhost '/'".to_owned(),
            ))
        });

        let cache = cache();
        let mut probe = MockBrokerProbe::new();
        probe.expect_probe().times(2).returning(|_, _| true);
        assert!(cache.exists(EntityKind::Exchange, "orders", &probe).await);

        let publisher = Publisher::new(supervisor(channel), cache.clone(), topology());
        let err = publisher
            .produce("orders", OutboundMessage::new(vec![]), false, DEFAULT_CONFIRM_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::PublishingError(_)));
        assert_eq!(cache.cached(EntityKind::Exchange, "orders").await, None);
        assert!(cache.exists(EntityKind::Exchange, "orders", &probe).await);
    }

    #[tokio::test]
    async fn unregistered_names_are_not_invalidated() {
        let mut channel = channel();
        channel
            .expect_basic_publish()
            .times(1)
            .returning(|_, _, _| Err(AmqpError::QueueNotFound("billing".to_owned())));

        let cache = known(cache()).await;
        cache.mark(EntityKind::Queue, "billing", true).await;

        let publisher = Publisher::new(supervisor(channel), cache.clone(), topology());
        assert!(publisher
            .produce("orders", OutboundMessage::new(vec![]), false, DEFAULT_CONFIRM_TIMEOUT)
            .await
            .is_err());

        assert_eq!(cache.cached(EntityKind::Queue, "billing").await, Some(true));
    }

    #[tokio::test]
    async fn send_builds_the_message_and_swallows_errors() {
        let mut channel = channel();
        channel
            .expect_basic_publish()
            .withf(|_, key, message| {
                key == "orders.priority"
                    && message.id() == "order-1"
                    && message.payload() == br#"{"id":1}"#
                    && message.headers.contains_key("x-delay")
            })
            .times(1)
            .returning(|_, _, _| Ok(async { Ok(PublishConfirm::ack()) }.boxed()));

        let publisher = Publisher::new(supervisor(channel), known(cache()).await, topology());
        let options = SendOptions::default()
            .message_id("order-1")
            .routing_key("orders.priority")
            .delay(5);

        assert!(publisher.send("orders", &json!({"id": 1}), options).await);
        assert!(
            !publisher
                .send("billing", &json!({"id": 1}), SendOptions::default())
                .await
        );
    }
}
