// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Command Entry Points
//!
//! Process-level operations meant to back a binary's subcommands: installing the logging
//! subscriber, pre-declaring the registered topology, and running a consumer until it stops
//! with an exit code.

use crate::{
    config::Role,
    consumer::{ConsumerLoop, StopReason},
    declaration::DeclarationCache,
    errors::AmqpError,
    supervisor::ConnectionSupervisor,
    topology::Topology,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by `filter` when it is unset.
///
/// Calling it more than once keeps the first subscriber.
pub fn init_logging(filter: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .try_init();

    if installed.is_err() {
        warn!("a tracing subscriber is already installed");
    }
}

/// Clears the declaration cache and declares every exchange, queue and binding of `topology`.
pub async fn init(
    supervisor: &ConnectionSupervisor,
    cache: &DeclarationCache,
    topology: &Topology,
) -> Result<(), AmqpError> {
    info!("initializing amqp topology...");

    let channel = supervisor.acquire(Role::Producer).await?;
    let installed = topology.install(channel.as_ref(), cache).await;

    if let Err(err) = &installed {
        error!(error = err.to_string(), "failure to initialize topology");
    }

    installed
}

/// Consumes `queue` until it stops, then closes the connection.
///
/// SIGINT, SIGTERM and SIGHUP request a graceful stop.
///
/// # Returns
/// The process exit code: `0` when the loop stopped cleanly, `1` on an unrecoverable error
pub async fn consume(consumer: &ConsumerLoop, supervisor: &ConnectionSupervisor, queue: &str) -> i32 {
    let listener = shutdown_on_signal(consumer.shutdown_token());

    let code = match consumer.consume(queue).await {
        Ok(reason) => {
            let reason = match reason {
                StopReason::Cancelled => "shutdown requested",
                StopReason::MaxConsumption => "maximum consumption reached",
                StopReason::ChannelClosed => "channel closed",
            };
            info!(queue, reason, "consumer stopped");
            0
        }
        Err(err) => {
            error!(error = err.to_string(), queue, "consumer failed");
            1
        }
    };

    listener.abort();
    supervisor.shutdown().await;
    code
}

/// Cancels `token` on the first termination signal.
pub fn shutdown_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = wait_for_signal() => {
                info!(signal, "received signal, shutting down...");
                token.cancel();
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );

    match signals {
        (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) => {
            tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
            }
        }
        _ => {
            warn!("failure to install signal handlers, falling back to ctrl-c");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if tokio::signal::ctrl_c().await.is_err() {
        futures_util::future::pending::<()>().await;
    }
    "ctrl-c"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            AmqpChannel, AmqpConnection, DeliveryStream, MockAmqpChannel, MockAmqpConnection,
            MockAmqpConnector,
        },
        config::AmqpConfig,
        declaration::EntityKind,
        dispatcher::ResultDispatcher,
        exchange::ExchangeDefinition,
        handler::EventRouter,
        queue::QueueDefinition,
        retry::RetryLedger,
        store::MemoryStore,
        topology::{ConsumerDefinition, ProducerDefinition},
    };
    use futures_util::StreamExt;
    use std::{sync::Arc, time::Duration};

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

    fn topology() -> Topology {
        Topology::new()
            .producer(ProducerDefinition::new(ExchangeDefinition::new("orders").topic()))
            .consumer(
                ConsumerDefinition::new(
                    QueueDefinition::new("orders.created"),
                    ExchangeDefinition::new("orders").topic(),
                    Arc::new(EventRouter::new()),
                )
                .routing_key("orders.created"),
            )
    }

    fn cache() -> Arc<DeclarationCache> {
        Arc::new(DeclarationCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn init_declares_the_topology_from_a_clean_cache() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().returning(|| true);
        channel.expect_close().returning(|| Ok(()));
        channel.expect_exchange_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_declare().times(1).returning(|_| Ok(()));
        channel.expect_queue_bind().times(1).returning(|_| Ok(()));

        let supervisor = supervisor(channel);
        let cache = cache();
        cache.mark(EntityKind::Queue, "orders.created", true).await;

        init(&supervisor, &cache, &topology()).await.unwrap();

        assert_eq!(cache.cached(EntityKind::Exchange, "orders").await, Some(true));
        assert_eq!(cache.cached(EntityKind::Queue, "orders.created").await, Some(true));
    }

    fn consumer_loop(supervisor: Arc<ConnectionSupervisor>) -> ConsumerLoop {
        let store = Arc::new(MemoryStore::new());
        ConsumerLoop::new(
            supervisor,
            cache(),
            Arc::new(topology()),
            ResultDispatcher::new(RetryLedger::new(store, Duration::from_secs(86400))),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn clean_stop_exits_with_zero() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().returning(|| true);
        channel.expect_close().returning(|| Ok(()));
        channel.expect_queue_exists().returning(|_| Ok(()));
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel.expect_basic_consume().returning(|_, _| {
            let empty: DeliveryStream = futures_util::stream::empty().boxed();
            Ok(empty)
        });

        let supervisor = supervisor(channel);
        let consumer = consumer_loop(supervisor.clone());

        assert_eq!(consume(&consumer, &supervisor, "orders.created").await, 0);
    }

    #[tokio::test]
    async fn unrecoverable_error_exits_with_one() {
        let supervisor = supervisor(MockAmqpChannel::new());
        let consumer = consumer_loop(supervisor.clone());

        assert_eq!(consume(&consumer, &supervisor, "billing").await, 1);
    }

    #[tokio::test]
    async fn listener_ends_once_the_token_is_cancelled() {
        let token = CancellationToken::new();
        let listener = shutdown_on_signal(token.clone());

        token.cancel();
        listener.await.unwrap();
    }
}
