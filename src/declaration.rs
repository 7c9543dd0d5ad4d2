// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Declaration Cache
//!
//! Avoids redundant `exchange.declare`/`queue.declare` calls by remembering which entities
//! are known to exist. Lookups go through three tiers in order:
//!
//! 1. an in-process map,
//! 2. a hash in the shared store (one namespace per entity kind, TTL set only if absent),
//! 3. a passive declaration against the broker.
//!
//! Whatever a later tier answers is written back into the earlier ones. The in-process map
//! only remembers entities that exist, so an absence recorded in the shared store expires
//! with it and a declaration made by another process becomes visible. Entries are removed,
//! not negated, when the broker reports an entity missing, so the next lookup re-probes.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    store::SharedStore,
};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Shared-store namespace of declared exchanges
pub const DECLARED_EXCHANGES_KEY: &str = "amqp:exchange";
/// Shared-store namespace of declared queues
pub const DECLARED_QUEUES_KEY: &str = "amqp:queue";

/// Kind of broker entity tracked by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Exchange,
    Queue,
}

impl EntityKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            EntityKind::Exchange => DECLARED_EXCHANGES_KEY,
            EntityKind::Queue => DECLARED_QUEUES_KEY,
        }
    }
}

/// Last tier of the lookup chain: asks the broker whether an entity exists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Returns true when a passive declaration of the entity succeeds.
    async fn probe(&self, kind: EntityKind, name: &str) -> bool;
}

/// Three-tier existence cache for exchanges and queues.
pub struct DeclarationCache {
    local: Mutex<HashSet<(EntityKind, String)>>,
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl DeclarationCache {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        DeclarationCache {
            local: Mutex::new(HashSet::new()),
            store,
            ttl,
        }
    }

    /// Checks whether an entity exists, consulting each tier in turn.
    pub async fn exists(&self, kind: EntityKind, name: &str, probe: &dyn BrokerProbe) -> bool {
        if let Some(known) = self.cached(kind, name).await {
            return known;
        }

        debug!(name, ?kind, "cache miss, probing the broker");
        let present = probe.probe(kind, name).await;
        self.mark(kind, name, present).await;
        present
    }

    /// Answer of the in-process and shared tiers, without touching the broker.
    pub async fn cached(&self, kind: EntityKind, name: &str) -> Option<bool> {
        if self.local_has(kind, name) {
            return Some(true);
        }

        match self.store.hget(kind.namespace(), name).await {
            Ok(Some(flag)) => {
                let present = flag != 0;
                self.local_set(kind, name, present);
                Some(present)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = err.to_string(), name, "shared declaration cache unavailable");
                None
            }
        }
    }

    /// Records the entity as present or absent in both cached tiers.
    pub async fn mark(&self, kind: EntityKind, name: &str, present: bool) {
        self.local_set(kind, name, present);

        let namespace = kind.namespace();
        let stored = match self.store.hset(namespace, name, i64::from(present)).await {
            Ok(()) => self.store.expire_nx(namespace, self.ttl).await,
            Err(err) => Err(err),
        };

        if let Err(err) = stored {
            warn!(error = err.to_string(), name, "failure to update the declaration cache");
        }
    }

    /// Forgets everything known about an entity so the next lookup probes the broker.
    pub async fn invalidate(&self, kind: EntityKind, name: &str) {
        info!(name, ?kind, "invalidating declaration cache entry");

        if let Ok(mut local) = self.local.lock() {
            local.remove(&(kind, name.to_owned()));
        }

        if let Err(err) = self.store.hdel(kind.namespace(), name).await {
            warn!(error = err.to_string(), name, "failure to invalidate the declaration cache");
        }
    }

    /// Drops the in-process map and both shared namespaces.
    pub async fn clear(&self) -> Result<(), AmqpError> {
        if let Ok(mut local) = self.local.lock() {
            local.clear();
        }

        self.store.del(DECLARED_EXCHANGES_KEY).await?;
        self.store.del(DECLARED_QUEUES_KEY).await
    }

    /// Declares an exchange unless a cached tier already reports it present.
    ///
    /// A rejected declaration is cached as absent and the error is returned.
    pub async fn declare_exchange(
        &self,
        channel: &dyn AmqpChannel,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        if self.cached(EntityKind::Exchange, &def.name).await == Some(true) {
            return Ok(());
        }

        info!(name = def.name, "exchange not declared yet, declaring...");
        match channel.exchange_declare(def).await {
            Ok(()) => {
                self.mark(EntityKind::Exchange, &def.name, true).await;
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare exchange");
                self.mark(EntityKind::Exchange, &def.name, false).await;
                Err(err)
            }
        }
    }

    /// Declares a queue and binds it to `exchange`, unless a cached tier already reports it.
    ///
    /// Every routing key gets its own binding. With no routing keys a fanout exchange gets a
    /// single unkeyed binding; other exchange kinds get none.
    pub async fn declare_queue(
        &self,
        channel: &dyn AmqpChannel,
        def: &QueueDefinition,
        exchange: &ExchangeDefinition,
        routing_keys: &[String],
    ) -> Result<(), AmqpError> {
        if self.cached(EntityKind::Queue, &def.name).await == Some(true) {
            return Ok(());
        }

        info!(name = def.name, "queue not declared yet, declaring...");
        let declared = async {
            channel.queue_declare(def).await?;

            for binding in bindings(def, exchange, routing_keys) {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    binding.queue_name, binding.exchange_name, binding.routing_key
                );
                channel.queue_bind(&binding).await?;
            }

            Ok::<(), AmqpError>(())
        }
        .await;

        match declared {
            Ok(()) => {
                self.mark(EntityKind::Queue, &def.name, true).await;
                debug!("queue: {} was created", def.name);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                self.mark(EntityKind::Queue, &def.name, false).await;
                Err(err)
            }
        }
    }

    fn local_has(&self, kind: EntityKind, name: &str) -> bool {
        self.local
            .lock()
            .map(|local| local.contains(&(kind, name.to_owned())))
            .unwrap_or(false)
    }

    fn local_set(&self, kind: EntityKind, name: &str, present: bool) {
        if let Ok(mut local) = self.local.lock() {
            let key = (kind, name.to_owned());
            if present {
                local.insert(key);
            } else {
                local.remove(&key);
            }
        }
    }
}

/// Bindings needed for a queue on `exchange`.
pub fn bindings(
    def: &QueueDefinition,
    exchange: &ExchangeDefinition,
    routing_keys: &[String],
) -> Vec<QueueBinding> {
    if routing_keys.is_empty() {
        if exchange.routing_kind() == ExchangeKind::Fanout {
            return vec![QueueBinding::new(&def.name).exchange(&exchange.name)];
        }
        return vec![];
    }

    routing_keys
        .iter()
        .map(|key| {
            QueueBinding::new(&def.name)
                .exchange(&exchange.name)
                .routing_key(key)
        })
        .collect()
}
