// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_orchestrator::{
    channel::LapinConnector,
    commands,
    config::AmqpConfig,
    consumer::ConsumerLoop,
    declaration::DeclarationCache,
    dispatcher::{ResultDispatcher, RetryPolicy},
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{EventHandler, EventRouter},
    message::DeliveryContext,
    publisher::{Publisher, SendOptions},
    queue::QueueDefinition,
    retry::RetryLedger,
    store::{MemoryStore, RedisStore, SharedStore},
    supervisor::ConnectionSupervisor,
    topology::{ConsumerDefinition, ProducerDefinition, Topology},
};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

const ORDERS_EXCHANGE: &str = "orders";
const ORDERS_QUEUE: &str = "orders.created";

#[derive(Parser)]
#[command(name = "orders", about = "Order events over RabbitMQ")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare every exchange, queue and binding
    Init,
    /// Consume a queue until interrupted
    Consume {
        #[arg(default_value = ORDERS_QUEUE)]
        queue: String,
    },
    /// Publish an `order.created` event
    Send {
        order_id: String,
        /// Delay in seconds, needs the delayed message plugin
        #[arg(long, default_value_t = 0)]
        delay: u64,
        /// Wait for the broker to confirm the publish
        #[arg(long)]
        confirm: bool,
    },
}

struct OrderCreated;

#[async_trait]
impl EventHandler for OrderCreated {
    async fn handle(&self, data: &Value, ctx: &DeliveryContext) -> Result<bool, anyhow::Error> {
        let order_id = data
            .get("order_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("order_id missing"))?;

        info!(order_id, redelivered = ctx.redelivered, "order created");
        Ok(true)
    }
}

fn topology() -> Topology {
    let exchange = ExchangeDefinition::new(ORDERS_EXCHANGE).delayed(ExchangeKind::Topic);
    let router = EventRouter::new().route("order.created", Arc::new(OrderCreated));

    Topology::new()
        .producer(ProducerDefinition::new(exchange.clone()).routing_key(ORDERS_QUEUE))
        .consumer(
            ConsumerDefinition::new(
                QueueDefinition::new(ORDERS_QUEUE).with_dead_letter("orders.dlx", ORDERS_QUEUE),
                exchange,
                Arc::new(router),
            )
            .routing_key(ORDERS_QUEUE)
            .retry(RetryPolicy::attempts(3)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::init_logging(&cli.log);

    let cfg = AmqpConfig::from_env()?;
    let store: Arc<dyn SharedStore> = match &cfg.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let cache = Arc::new(DeclarationCache::new(store.clone(), cfg.cache_ttl()));
    let ledger = RetryLedger::new(store, cfg.retry_ttl());
    let topology = Arc::new(topology());
    let supervisor = Arc::new(ConnectionSupervisor::new(
        Arc::new(LapinConnector::new(cfg.clone())),
        cfg,
    ));

    match cli.command {
        Command::Init => {
            commands::init(&supervisor, &cache, &topology).await?;
            supervisor.shutdown().await;
        }
        Command::Consume { queue } => {
            let consumer = ConsumerLoop::new(
                supervisor.clone(),
                cache,
                topology,
                ResultDispatcher::new(ledger),
                CancellationToken::new(),
            );

            let code = commands::consume(&consumer, &supervisor, &queue).await;
            std::process::exit(code);
        }
        Command::Send {
            order_id,
            delay,
            confirm,
        } => {
            let publisher = Publisher::new(supervisor.clone(), cache, topology);

            let mut options = SendOptions::default().delay(delay);
            if confirm {
                options = options.confirm(Duration::from_secs(5));
            }

            let payload = json!({ "event": "order.created", "order_id": order_id });
            let sent = publisher.send(ORDERS_EXCHANGE, &payload, options).await;
            supervisor.shutdown().await;

            anyhow::ensure!(sent, "failure to publish order {order_id}");
        }
    }

    Ok(())
}
