// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Key-Value Store
//!
//! The declaration cache and the retry ledger persist their state in a store shared by
//! every producer and consumer process. This module defines the small command surface they
//! need and provides a Redis backend plus an in-process backend for single-process
//! deployments and tests.

use crate::errors::AmqpError;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::debug;

/// Commands the orchestrator issues against the shared store.
///
/// None of them needs compare-and-set semantics: a stale read only costs a redundant,
/// idempotent broker declaration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Reads an integer hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, AmqpError>;

    /// Writes an integer hash field.
    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), AmqpError>;

    /// Removes a hash field.
    async fn hdel(&self, key: &str, field: &str) -> Result<(), AmqpError>;

    /// Sets a TTL on `key` only if it has none (`EXPIRE key ttl NX`).
    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<(), AmqpError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, AmqpError>;

    /// Writes an integer with a TTL (`SETEX`).
    async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), AmqpError>;

    async fn del(&self, key: &str) -> Result<(), AmqpError>;
}

/// Redis-backed store.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, AmqpError> {
        debug!("connecting to redis...");
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("redis connected");
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, AmqpError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, AmqpError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs())
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), AmqpError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug)]
enum Entry {
    Value(i64),
    Hash(HashMap<String, i64>),
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store with the same TTL semantics as the Redis commands.
///
/// Only shared by the tasks of one process, so cache tiers backed by it do not
/// coordinate across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
        let now = Instant::now();
        if slots.get(key).is_some_and(|s| s.expired(now)) {
            slots.remove(key);
        }
        slots.get_mut(key)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<i64>, AmqpError> {
        let mut slots = self.slots.lock().await;
        Ok(match MemoryStore::live(&mut slots, key) {
            Some(Slot {
                entry: Entry::Hash(fields),
                ..
            }) => fields.get(field).copied(),
            _ => None,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), AmqpError> {
        let mut slots = self.slots.lock().await;
        match MemoryStore::live(&mut slots, key) {
            Some(Slot {
                entry: Entry::Hash(fields),
                ..
            }) => {
                fields.insert(field.to_owned(), value);
                Ok(())
            }
            Some(_) => Err(AmqpError::StoreError(format!("`{key}` is not a hash"))),
            None => {
                slots.insert(
                    key.to_owned(),
                    Slot {
                        entry: Entry::Hash(HashMap::from([(field.to_owned(), value)])),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), AmqpError> {
        let mut slots = self.slots.lock().await;
        if let Some(Slot {
            entry: Entry::Hash(fields),
            ..
        }) = MemoryStore::live(&mut slots, key)
        {
            fields.remove(field);
        }
        Ok(())
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<(), AmqpError> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = MemoryStore::live(&mut slots, key) {
            if slot.expires_at.is_none() {
                slot.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, AmqpError> {
        let mut slots = self.slots.lock().await;
        Ok(match MemoryStore::live(&mut slots, key) {
            Some(Slot {
                entry: Entry::Value(v),
                ..
            }) => Some(*v),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), AmqpError> {
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_owned(),
            Slot {
                entry: Entry::Value(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), AmqpError> {
        self.slots.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_fields_roundtrip_and_delete() {
        let store = MemoryStore::new();

        store.hset("amqp:queue", "orders", 1).await.unwrap();
        assert_eq!(store.hget("amqp:queue", "orders").await.unwrap(), Some(1));
        assert_eq!(store.hget("amqp:queue", "billing").await.unwrap(), None);

        store.hdel("amqp:queue", "orders").await.unwrap();
        assert_eq!(store.hget("amqp:queue", "orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_nx_keeps_first_ttl() {
        let store = MemoryStore::new();

        store.hset("amqp:exchange", "orders", 1).await.unwrap();
        store
            .expire_nx("amqp:exchange", Duration::from_millis(5))
            .await
            .unwrap();
        store
            .expire_nx("amqp:exchange", Duration::from_secs(3600))
            .await
            .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.hget("amqp:exchange", "orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_ex_values_expire() {
        let store = MemoryStore::new();

        store
            .set_ex("amqp:retry:count:m-1", 2, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(store.get("amqp:retry:count:m-1").await.unwrap(), Some(2));

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.get("amqp:retry:count:m-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hset_on_plain_value_fails() {
        let store = MemoryStore::new();
        store
            .set_ex("key", 1, Duration::from_secs(60))
            .await
            .unwrap();

        let err = store.hset("key", "field", 1).await.unwrap_err();
        assert!(matches!(err, AmqpError::StoreError(_)));
    }
}
