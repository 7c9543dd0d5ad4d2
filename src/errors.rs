// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Orchestration Layer
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! The `AmqpError` enum groups failures by how callers are expected to react:
//! transport errors lead to a reconnect, declaration errors are propagated to the
//! caller of initialization, not-found errors invalidate the declaration cache,
//! and confirm timeouts are reported as publish failures.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ orchestration.
///
/// Variants carry the broker or driver message as a plain string so the enum
/// stays comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Reconnection gave up after the given number of attempts
    #[error("reconnection exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// The broker rejected an exchange declaration
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// The broker rejected a queue declaration
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The broker reported that an exchange does not exist
    #[error("no exchange `{0}`")]
    ExchangeNotFound(String),

    /// The broker reported that a queue does not exist
    #[error("no queue `{0}`")]
    QueueNotFound(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// No ack, nack or return arrived within the confirm window
    #[error("publisher confirm timed out")]
    ConfirmTimeout,

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// No consumer definition is registered for the queue
    #[error("consumer not found for queue `{0}`")]
    ConsumerNotFound(String),

    /// Another consumer loop of this process is already running on the queue
    #[error("queue `{0}` is already being consumed")]
    AlreadyConsuming(String),

    /// No producer definition is registered for the exchange
    #[error("producer not found for exchange `{0}`")]
    ProducerNotFound(String),

    /// The shared key-value store failed
    #[error("store failure: {0}")]
    StoreError(String),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

fn exchange_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"no exchange '([^']+?)'").ok())
        .as_ref()
}

fn queue_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"no queue '([^']+?)'").ok())
        .as_ref()
}

/// Extracts the exchange name from a broker `no exchange '<name>'` message.
pub fn missing_exchange(text: &str) -> Option<String> {
    exchange_pattern()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Extracts the queue name from a broker `no queue '<name>'` message.
pub fn missing_queue(text: &str) -> Option<String> {
    queue_pattern()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

impl AmqpError {
    /// Maps broker `no exchange '<x>'` / `no queue '<x>'` replies to the not-found variants.
    pub fn from_broker(text: &str) -> Option<AmqpError> {
        missing_exchange(text)
            .map(AmqpError::ExchangeNotFound)
            .or_else(|| missing_queue(text).map(AmqpError::QueueNotFound))
    }

    /// Returns true for failures of the connection or channel itself.
    ///
    /// These are the errors the consumer loop routes to the reconnect path
    /// instead of treating them as per-message failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
                | AmqpError::RejectMessageError
        )
    }

    /// Message text of the underlying broker error, when the variant carries one.
    pub fn broker_text(&self) -> String {
        match self {
            AmqpError::ConnectionError(t)
            | AmqpError::ChannelError(t)
            | AmqpError::PublishingError(t)
            | AmqpError::BindingConsumerError(t)
            | AmqpError::QoSDeclarationError(t)
            | AmqpError::DeclareExchangeError(_, t)
            | AmqpError::DeclareQueueError(_, t) => t.clone(),
            other => other.to_string(),
        }
    }
}

impl From<lapin::Error> for AmqpError {
    /// Classifies a driver error, recognising broker "not found" replies.
    fn from(err: lapin::Error) -> Self {
        let text = err.to_string();

        if let Some(not_found) = AmqpError::from_broker(&text) {
            return not_found;
        }

        match err {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
                AmqpError::ConnectionError(text)
            }
            _ => AmqpError::ChannelError(text),
        }
    }
}

impl From<redis::RedisError> for AmqpError {
    fn from(err: redis::RedisError) -> Self {
        AmqpError::StoreError(err.to_string())
    }
}
