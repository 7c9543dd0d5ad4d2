// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! Drives the consumption of one queue: declares it through the declaration cache,
//! applies QoS, registers the consumer and processes deliveries strictly one at a time.
//!
//! Each delivery runs inside an OpenTelemetry span continued from the producer's context.
//! Handler failures become retry/drop decisions in the [`ResultDispatcher`]; they never
//! stop the loop. Transport failures and a lost heartbeat go through the supervisor's
//! reconnect path instead, and the consumer is registered again on the fresh channel.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    config::{ConnectionParams, Role},
    declaration::{DeclarationCache, EntityKind},
    dispatcher::ResultDispatcher,
    errors::AmqpError,
    message::DeliveryContext,
    otel,
    supervisor::ConnectionSupervisor,
    topology::{ConsumerDefinition, Topology},
};
use anyhow::anyhow;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a consumer loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested
    Cancelled,
    /// The configured maximum number of deliveries was handled
    MaxConsumption,
    /// The broker stopped delivering on a healthy channel
    ChannelClosed,
}

enum Event {
    Shutdown,
    LivenessLost,
    Delivery(Option<Result<DeliveryContext, AmqpError>>),
}

/// Consumes the queues registered in a [`Topology`].
pub struct ConsumerLoop {
    supervisor: Arc<ConnectionSupervisor>,
    cache: Arc<DeclarationCache>,
    topology: Arc<Topology>,
    dispatcher: ResultDispatcher,
    shutdown: CancellationToken,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Marks a queue as consumed for as long as it lives.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    queue: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.queue);
        }
    }
}

impl ConsumerLoop {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        cache: Arc<DeclarationCache>,
        topology: Arc<Topology>,
        dispatcher: ResultDispatcher,
        shutdown: CancellationToken,
    ) -> Self {
        ConsumerLoop {
            supervisor,
            cache,
            topology,
            dispatcher,
            shutdown,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Token that stops every loop of this consumer when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consumes `queue` until shutdown, the consumption cap, the end of the delivery
    /// stream, or an unrecoverable error.
    ///
    /// # Parameters
    /// * `queue` - Name of a queue registered as consumer in the topology
    ///
    /// # Returns
    /// The reason the loop stopped, or the error that ended it
    pub async fn consume(&self, queue: &str) -> Result<StopReason, AmqpError> {
        let consumer = self.topology.get_consumer(queue)?;
        let _guard = self.activate(queue)?;

        info!(queue, "starting consumer");
        let result = self.run(consumer).await;

        if let Err(err) = &result {
            error!(error = err.to_string(), queue, "consumer stopped on error");
            self.invalidate_missing(err).await;
        }

        result
    }

    fn activate(&self, queue: &str) -> Result<ActiveGuard, AmqpError> {
        let mut active = self.active.lock().map_err(|_| AmqpError::InternalError)?;

        if !active.insert(queue.to_owned()) {
            return Err(AmqpError::AlreadyConsuming(queue.to_owned()));
        }

        Ok(ActiveGuard {
            active: self.active.clone(),
            queue: queue.to_owned(),
        })
    }

    fn params(&self, consumer: &ConsumerDefinition) -> ConnectionParams {
        let defaults = &self.supervisor.config().consumer;
        ConnectionParams {
            heartbeat: consumer.heartbeat.unwrap_or(defaults.heartbeat),
            ..defaults.clone()
        }
    }

    async fn run(&self, consumer: &ConsumerDefinition) -> Result<StopReason, AmqpError> {
        let channel = self.supervisor.acquire_with(self.params(consumer)).await?;
        self.ensure_queue(channel.as_ref(), consumer).await?;

        let mut deliveries = self.register(channel.as_ref(), consumer).await?;
        let mut channel = channel;
        let mut epoch = self.supervisor.epoch().await;
        let mut liveness = self.supervisor.liveness();
        let tracer = global::tracer("amqp consumer");
        let mut handled: u64 = 0;

        loop {
            if consumer.max_consumption > 0 && handled >= consumer.max_consumption {
                info!(queue = consumer.name(), handled, "maximum consumption reached");
                return Ok(StopReason::MaxConsumption);
            }

            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                _ = liveness_lost(&mut liveness) => Event::LivenessLost,
                next = deliveries.next() => Event::Delivery(next),
            };

            let failure = match event {
                Event::Shutdown => {
                    info!(queue = consumer.name(), "shutdown requested, stopping consumer");
                    return Ok(StopReason::Cancelled);
                }
                Event::LivenessLost => {
                    AmqpError::ConnectionError("connection liveness lost".to_owned())
                }
                Event::Delivery(Some(Ok(delivery))) => {
                    handled += 1;
                    let ctx = delivery.with_epoch(epoch);

                    match self
                        .process(channel.as_ref(), consumer, ctx, &tracer)
                        .await
                    {
                        Ok(()) => continue,
                        Err(err) if err.is_transport() => err,
                        Err(err) => return Err(err),
                    }
                }
                Event::Delivery(Some(Err(err))) if err.is_transport() => err,
                Event::Delivery(Some(Err(err))) => return Err(err),
                Event::Delivery(None) => {
                    if channel.is_open() {
                        info!(queue = consumer.name(), "channel stopped consuming");
                        return Ok(StopReason::ChannelClosed);
                    }
                    AmqpError::ChannelError("delivery stream ended".to_owned())
                }
            };

            warn!(
                error = failure.to_string(),
                queue = consumer.name(),
                "transport failure, reconnecting..."
            );

            (channel, deliveries) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(queue = consumer.name(), "shutdown requested while reconnecting");
                    return Ok(StopReason::Cancelled);
                }
                recovered = self.recover(consumer) => recovered?,
            };
            epoch = self.supervisor.epoch().await;
        }
    }

    /// Reconnects and registers the consumer again.
    ///
    /// A transport failure while registering counts as one more failed attempt against the
    /// reconnect budget. A queue that vanished with the old connection is declared again.
    async fn recover(
        &self,
        consumer: &ConsumerDefinition,
    ) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), AmqpError> {
        let max_attempts = self.supervisor.config().retry.max_attempts;
        let mut failures = 0;

        loop {
            let channel = self
                .supervisor
                .reconnect(Role::Consumer, consumer.qos.as_ref())
                .await?;

            let registered = match channel
                .basic_consume(consumer.name(), &consumer.options)
                .await
            {
                Ok(deliveries) => Ok((channel, deliveries)),
                Err(err) if is_missing_queue(&err) => self.redeclare(consumer).await,
                Err(err) => Err(err),
            };

            match registered {
                Ok(registered) => return Ok(registered),
                Err(err) if err.is_transport() => {
                    failures += 1;
                    if failures >= max_attempts {
                        error!(max_attempts, "failure to register the consumer again");
                        return Err(AmqpError::ReconnectExhausted(max_attempts));
                    }
                    warn!(
                        error = err.to_string(),
                        queue = consumer.name(),
                        failures,
                        "failure to register the consumer, reconnecting..."
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Declares the queue again after the broker forgot it, then registers the consumer.
    async fn redeclare(
        &self,
        consumer: &ConsumerDefinition,
    ) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), AmqpError> {
        warn!(queue = consumer.name(), "queue is gone after reconnecting, declaring it again");
        self.cache.invalidate(EntityKind::Queue, consumer.name()).await;

        let channel = self.supervisor.acquire_with(self.params(consumer)).await?;
        self.ensure_queue(channel.as_ref(), consumer).await?;
        let deliveries = self.register(channel.as_ref(), consumer).await?;

        Ok((channel, deliveries))
    }

    async fn ensure_queue(
        &self,
        channel: &dyn AmqpChannel,
        consumer: &ConsumerDefinition,
    ) -> Result<(), AmqpError> {
        let present = self
            .cache
            .exists(EntityKind::Queue, consumer.name(), self.supervisor.as_ref())
            .await;

        if present {
            return Ok(());
        }

        self.cache
            .declare_exchange(channel, &consumer.exchange)
            .await?;
        self.cache
            .declare_queue(
                channel,
                &consumer.queue,
                &consumer.exchange,
                &consumer.routing_keys,
            )
            .await
    }

    async fn register(
        &self,
        channel: &dyn AmqpChannel,
        consumer: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        if let Some(qos) = &consumer.qos {
            channel.basic_qos(qos).await?;
        }

        debug!(
            queue = consumer.name(),
            tag = %consumer.options.consumer_tag,
            "registering consumer"
        );
        channel
            .basic_consume(consumer.name(), &consumer.options)
            .await
    }

    async fn process(
        &self,
        channel: &dyn AmqpChannel,
        consumer: &ConsumerDefinition,
        ctx: DeliveryContext,
        tracer: &BoxedTracer,
    ) -> Result<(), AmqpError> {
        let (_, mut span) = otel::new_span(&ctx.headers, tracer, consumer.name());

        info!(
            queue = consumer.name(),
            delivery_tag = ctx.delivery_tag,
            message_id = ?ctx.message_id,
            "--- start ---"
        );

        let result = AssertUnwindSafe(consumer.handler.handle(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow!("handler panicked")));

        info!(queue = consumer.name(), ok = result.is_ok(), "--- end ---");

        if consumer.options.no_ack {
            return Ok(());
        }

        if ctx.epoch != self.supervisor.epoch().await {
            warn!(
                delivery_tag = ctx.delivery_tag,
                "delivery belongs to a closed channel, leaving it to redelivery"
            );
            return Ok(());
        }

        match self
            .dispatcher
            .dispatch(channel, &ctx, result, &consumer.retry, consumer.requeue)
            .await
        {
            Ok(settlement) => {
                debug!(?settlement, "delivery settled");
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to settle delivery"),
                });
                Err(err)
            }
        }
    }

    async fn invalidate_missing(&self, err: &AmqpError) {
        let not_found = match err {
            AmqpError::ExchangeNotFound(_) | AmqpError::QueueNotFound(_) => Some(err.clone()),
            other => AmqpError::from_broker(&other.broker_text()),
        };

        match not_found {
            Some(AmqpError::QueueNotFound(name)) if self.topology.has_consumer(&name) => {
                self.cache.invalidate(EntityKind::Queue, &name).await;
            }
            Some(AmqpError::ExchangeNotFound(name)) if self.topology.has_producer(&name) => {
                self.cache.invalidate(EntityKind::Exchange, &name).await;
            }
            _ => {}
        }
    }
}

fn is_missing_queue(err: &AmqpError) -> bool {
    match err {
        AmqpError::QueueNotFound(_) => true,
        other => matches!(
            AmqpError::from_broker(&other.broker_text()),
            Some(AmqpError::QueueNotFound(_))
        ),
    }
}

/// Resolves once the liveness flag turns false; never resolves if the supervisor is gone.
async fn liveness_lost(liveness: &mut watch::Receiver<bool>) {
    if liveness.wait_for(|alive| !*alive).await.is_err() {
        futures_util::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{AmqpConnection, MockAmqpChannel, MockAmqpConnection, MockAmqpConnector},
        config::AmqpConfig,
        dispatcher::RetryPolicy,
        exchange::ExchangeDefinition,
        handler::ConsumerHandler,
        message::Outcome,
        queue::QueueDefinition,
        retry::RetryLedger,
        store::MemoryStore,
        topology::ConsumerDefinition,
    };
    use async_trait::async_trait;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Fails the first `failures` deliveries, acknowledges the rest.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Flaky {
                calls: AtomicUsize::new(0),
                failures,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConsumerHandler for Flaky {
        async fn handle(&self, _: &DeliveryContext) -> Result<Outcome, anyhow::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("boom"));
            }
            Ok(Outcome::Ack)
        }
    }

    fn delivery(tag: u64) -> Result<DeliveryContext, AmqpError> {
        Ok(DeliveryContext::new("orders", tag, b"{}".to_vec()).with_message_id(&format!("m-{tag}")))
    }

    fn stream(items: Vec<Result<DeliveryContext, AmqpError>>) -> DeliveryStream {
        futures_util::stream::iter(items).boxed()
    }

    struct Harness {
        consumer: ConsumerLoop,
        connects: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    }

    fn harness(channel: MockAmqpChannel, consumer: ConsumerDefinition) -> Harness {
        harness_refusing_after(channel, consumer, usize::MAX)
    }

    /// Harness whose broker refuses every connection after the first `accepted` ones.
    fn harness_refusing_after(
        channel: MockAmqpChannel,
        consumer: ConsumerDefinition,
        accepted: usize,
    ) -> Harness {
        let channel = Arc::new(channel);

        let mut conn = MockAmqpConnection::new();
        conn.expect_is_connected().returning(|| true);
        conn.expect_open_channel()
            .returning(move || Ok(channel.clone() as Arc<dyn AmqpChannel>));
        conn.expect_close().returning(|| Ok(()));
        let conn = Arc::new(conn);

        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let mut connector = MockAmqpConnector::new();
        connector.expect_connect().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) >= accepted {
                return Err(AmqpError::ConnectionError("connection refused".to_owned()));
            }
            Ok(conn.clone() as Arc<dyn AmqpConnection>)
        });

        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(DeclarationCache::new(store.clone(), Duration::from_secs(3600)));
        let ledger = RetryLedger::new(store, Duration::from_secs(86400));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(connector),
            AmqpConfig::default(),
        ));

        let shutdown = CancellationToken::new();
        let consumer = ConsumerLoop::new(
            supervisor,
            cache,
            Arc::new(Topology::new().consumer(consumer)),
            ResultDispatcher::new(ledger),
            shutdown.clone(),
        );

        Harness {
            consumer,
            connects,
            shutdown,
        }
    }

    fn orders(handler: Arc<dyn ConsumerHandler>) -> ConsumerDefinition {
        ConsumerDefinition::new(
            QueueDefinition::new("orders"),
            ExchangeDefinition::new("orders"),
            handler,
        )
        .routing_key("orders")
    }

    fn base_channel() -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().returning(|| true);
        channel.expect_close().returning(|| Ok(()));
        channel
    }

    async fn declared(harness: &Harness) {
        harness
            .consumer
            .cache
            .mark(EntityKind::Queue, "orders", true)
            .await;
    }

    #[tokio::test]
    async fn stops_after_max_consumption() {
        let mut channel = base_channel();
        channel.expect_basic_qos().times(1).returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .times(1)
            .returning(|_, _| Ok(stream(vec![delivery(1), delivery(2), delivery(3)])));
        channel.expect_basic_ack().times(2).returning(|_| Ok(()));

        let handler = Flaky::new(0);
        let harness = harness(channel, orders(handler.clone()).max_consumption(2));
        declared(&harness).await;

        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::MaxConsumption);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_loop() {
        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .times(1)
            .returning(|_, _| Ok(stream(vec![delivery(1), delivery(2)])));
        channel
            .expect_basic_reject()
            .with(mockall::predicate::eq(1), mockall::predicate::eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        channel
            .expect_basic_ack()
            .with(mockall::predicate::eq(2))
            .times(1)
            .returning(|_| Ok(()));

        let handler = Flaky::new(1);
        let harness = harness(channel, orders(handler.clone()));
        declared(&harness).await;

        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::ChannelClosed);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn retried_failures_are_nacked() {
        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .returning(|_, _| Ok(stream(vec![delivery(1)])));
        channel
            .expect_basic_nack()
            .with(mockall::predicate::eq(1), mockall::predicate::eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let consumer = orders(Flaky::new(1))
            .retry(RetryPolicy::attempts(3))
            .requeue(false);
        let harness = harness(channel, consumer);
        declared(&harness).await;

        harness.consumer.consume("orders").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_reconnect_and_reregister() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let counter = registrations.clone();

        let mut channel = base_channel();
        channel.expect_basic_qos().times(2).returning(|_| Ok(()));
        channel.expect_basic_consume().times(2).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(stream(vec![Err(AmqpError::ConnectionError(
                    "connection reset".to_owned(),
                ))]))
            } else {
                Ok(stream(vec![delivery(7)]))
            }
        });
        channel
            .expect_basic_ack()
            .with(mockall::predicate::eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let handler = Flaky::new(0);
        let harness = harness(channel, orders(handler.clone()));
        declared(&harness).await;

        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::ChannelClosed);
        assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
        assert_eq!(registrations.load(Ordering::SeqCst), 2);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_reconnect_in_backoff() {
        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel.expect_basic_consume().times(1).returning(|_, _| {
            Ok(stream(vec![Err(AmqpError::ConnectionError(
                "connection reset".to_owned(),
            ))]))
        });

        let harness = harness_refusing_after(channel, orders(Flaky::new(0)), 1);
        declared(&harness).await;

        let token = harness.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let started = tokio::time::Instant::now();
        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(harness.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_after_reconnect_reconnects_again() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let counter = registrations.clone();

        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .times(3)
            .returning(move |_, _| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(stream(vec![Err(AmqpError::ConnectionError(
                    "connection reset".to_owned(),
                ))])),
                1 => Err(AmqpError::ConnectionError("reset again".to_owned())),
                _ => Ok(stream(vec![delivery(7)])),
            });
        channel
            .expect_basic_ack()
            .with(mockall::predicate::eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let harness = harness(channel, orders(Flaky::new(0)));
        declared(&harness).await;

        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::ChannelClosed);
        assert_eq!(harness.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_lost_with_the_connection_is_declared_again() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let counter = registrations.clone();

        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .times(3)
            .returning(move |queue, _| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(stream(vec![Err(AmqpError::ConnectionError(
                    "connection reset".to_owned(),
                ))])),
                1 => Err(AmqpError::QueueNotFound(queue.to_owned())),
                _ => Ok(stream(vec![delivery(7)])),
            });
        channel
            .expect_queue_exists()
            .times(1)
            .returning(|name| Err(AmqpError::QueueNotFound(name.to_owned())));
        channel.expect_exchange_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_bind().times(1).returning(|_| Ok(()));
        channel
            .expect_basic_ack()
            .with(mockall::predicate::eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let harness = harness(channel, orders(Flaky::new(0)));
        declared(&harness).await;

        let stop = harness.consumer.consume("orders").await.unwrap();

        assert_eq!(stop, StopReason::ChannelClosed);
        assert_eq!(
            harness
                .consumer
                .cache
                .cached(EntityKind::Queue, "orders")
                .await,
            Some(true)
        );
    }

    #[tokio::test]
    async fn undeclared_queue_is_declared_and_bound() {
        let mut channel = base_channel();
        channel
            .expect_queue_exists()
            .times(1)
            .returning(|name| Err(AmqpError::QueueNotFound(name.to_owned())));
        channel.expect_exchange_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .withf(|b| b.queue_name == "orders" && b.routing_key == "orders")
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .returning(|_, _| Ok(stream(vec![])));

        let harness = harness(channel, orders(Flaky::new(0)));
        harness.consumer.consume("orders").await.unwrap();

        assert_eq!(
            harness
                .consumer
                .cache
                .cached(EntityKind::Queue, "orders")
                .await,
            Some(true)
        );
    }

    #[tokio::test]
    async fn shutdown_stops_an_idle_consumer() {
        let mut channel = base_channel();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .returning(|_, _| Ok(futures_util::stream::pending::<Result<DeliveryContext, AmqpError>>().boxed()));

        let harness = harness(channel, orders(Flaky::new(0)));
        declared(&harness).await;
        harness.shutdown.cancel();

        let stop = harness.consumer.consume("orders").await.unwrap();
        assert_eq!(stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let harness = harness(base_channel(), orders(Flaky::new(0)));

        let err = harness.consumer.consume("billing").await.unwrap_err();
        assert_eq!(err, AmqpError::ConsumerNotFound("billing".to_owned()));
    }

    #[test]
    fn one_loop_per_queue() {
        let harness = harness(base_channel(), orders(Flaky::new(0)));

        let guard = harness.consumer.activate("orders").unwrap();
        assert_eq!(
            harness.consumer.activate("orders").err(),
            Some(AmqpError::AlreadyConsuming("orders".to_owned()))
        );

        drop(guard);
        assert!(harness.consumer.activate("orders").is_ok());
    }
}
