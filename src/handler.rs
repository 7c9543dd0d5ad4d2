// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Business logic plugs into a consumer through [`ConsumerHandler`]. Consumers that carry
//! several kinds of events on one queue can use [`EventRouter`], a mapping from event key
//! to handler built once at startup.

use crate::message::{DeliveryContext, Outcome};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// Payload field holding the event key
pub const EVENT_FIELD: &str = "event";

/// Processes one delivery.
///
/// Returning an error counts as a handler failure; the dispatcher decides between retry
/// and drop from the consumer's retry policy.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<Outcome, anyhow::Error>;
}

/// Handler of a single routed event.
///
/// `true` acknowledges the delivery and `false` negatively acknowledges it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: &Value, ctx: &DeliveryContext) -> Result<bool, anyhow::Error>;
}

/// Static routing table from event key to handler.
///
/// The event key is read from the payload's `event` field, falling back to the AMQP
/// `type` property. Unknown keys are acknowledged so they do not block the queue; deliveries
/// without any key go to the fallback handler.
#[derive(Default, Clone)]
pub struct EventRouter {
    routes: HashMap<String, Arc<dyn EventHandler>>,
    fallback: Option<Arc<dyn ConsumerHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        EventRouter::default()
    }

    pub fn route(mut self, event: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(event.to_owned(), handler);
        self
    }

    pub fn fallback(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn event_key(data: &Value, ctx: &DeliveryContext) -> Option<String> {
        data.get(EVENT_FIELD)
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .map(str::to_owned)
            .or_else(|| ctx.kind.clone().filter(|k| !k.is_empty()))
    }
}

#[async_trait]
impl ConsumerHandler for EventRouter {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<Outcome, anyhow::Error> {
        let data: Value = serde_json::from_slice(&ctx.body).unwrap_or(Value::Null);

        let Some(event) = EventRouter::event_key(&data, ctx) else {
            return match &self.fallback {
                Some(fallback) => fallback.handle(ctx).await,
                None => Err(anyhow!("no event key and no fallback handler")),
            };
        };

        let Some(handler) = self.routes.get(&event) else {
            warn!(event, queue = ctx.queue, "unsupported event, removing message from queue");
            return Ok(Outcome::Ack);
        };

        debug!(event, "routing message");
        handler.handle(&data, ctx).await.map(Outcome::from)
    }
}
