// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! Outbound messages built by producers, the per-delivery context handed to handlers,
//! and the outcome a handler reports back.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortString};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header read by the delayed message exchange plugin, in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// AMQP delivery mode of a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    NonPersistent,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Result a handler reports for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed, remove from the queue
    Ack,
    /// Negative acknowledgement, requeued per the consumer's requeue flag
    Nack,
    /// Reject, requeued per the consumer's requeue flag
    Requeue,
    /// Reject without requeue, dead-lettered if the queue has a DLX
    Drop,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Ack
        } else {
            Outcome::Nack
        }
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) content_type: String,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) message_id: String,
    pub(crate) kind: Option<String>,
    pub(crate) routing_key: Option<String>,
    pub(crate) mandatory: bool,
    pub(crate) headers: BTreeMap<ShortString, AMQPValue>,
}

impl OutboundMessage {
    /// Creates a persistent message with a random message id.
    pub fn new(payload: Vec<u8>) -> OutboundMessage {
        OutboundMessage {
            payload,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            delivery_mode: DeliveryMode::Persistent,
            message_id: Uuid::new_v4().to_string(),
            kind: None,
            routing_key: None,
            mandatory: false,
            headers: BTreeMap::default(),
        }
    }

    /// Serializes `data` as JSON into a new message.
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<OutboundMessage, AmqpError> {
        let payload =
            serde_json::to_vec(data).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))?;
        Ok(OutboundMessage::new(payload))
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = id.to_owned();
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets the AMQP `type` property, used as a fallback event key by consumers.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Asks the broker to return the message when it cannot be routed.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    /// Delays delivery through the delayed message exchange plugin.
    pub fn delay_secs(self, secs: u64) -> Self {
        let millis = secs.saturating_mul(1000).min(i64::MAX as u64) as i64;
        self.header(
            AMQP_HEADERS_DELAY,
            AMQPValue::LongLongInt(LongLongInt::from(millis)),
        )
    }

    pub fn id(&self) -> &str {
        &self.message_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn header_table(&self) -> FieldTable {
        FieldTable::from(self.headers.clone())
    }
}

/// Everything known about one inbound delivery.
///
/// The delivery tag is only meaningful on the channel that produced it, identified
/// here by `epoch`; the dispatcher refuses to settle a delivery from an older epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub kind: Option<String>,
    pub queue: String,
    pub epoch: u64,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl DeliveryContext {
    /// Creates a context for `body` with no properties set.
    pub fn new(queue: &str, delivery_tag: u64, body: Vec<u8>) -> DeliveryContext {
        DeliveryContext {
            delivery_tag,
            message_id: None,
            body,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            kind: None,
            queue: queue.to_owned(),
            epoch: 0,
            headers: BTreeMap::default(),
        }
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Message id usable as a retry key; empty ids count as missing.
    pub fn retry_key(&self) -> Option<&str> {
        self.message_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|e| AmqpError::ParsePayloadError(e.to_string()))
    }
}
