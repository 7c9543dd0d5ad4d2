// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport Seam
//!
//! Traits over the connection and channel operations the orchestrator issues, plus the
//! `lapin` implementation used in production. Everything above this module talks to the
//! broker only through these traits, so the supervision, caching and dispatch logic can be
//! exercised without a running broker.

use crate::{
    config::{AmqpConfig, ConnectionParams},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{DeliveryContext, OutboundMessage},
    queue::{QosDefinition, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Stream of deliveries registered by `basic_consume`.
pub type DeliveryStream = BoxStream<'static, Result<DeliveryContext, AmqpError>>;

/// One-shot settlement of a single publish.
pub type ConfirmFuture = BoxFuture<'static, Result<PublishConfirm, AmqpError>>;

/// How the broker settled a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishConfirm {
    pub acked: bool,
    pub nacked: bool,
    pub returned: bool,
}

impl PublishConfirm {
    pub fn ack() -> Self {
        PublishConfirm {
            acked: true,
            ..PublishConfirm::default()
        }
    }

    pub fn nack() -> Self {
        PublishConfirm {
            nacked: true,
            ..PublishConfirm::default()
        }
    }

    /// Accepted, not rejected and not returned as unroutable.
    pub fn is_success(&self) -> bool {
        self.acked && !self.nacked && !self.returned
    }
}

/// Flags for `basic.consume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub nowait: bool,
}

/// Channel-level AMQP operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Passive exchange declaration; fails when the exchange does not exist.
    async fn exchange_exists(&self, name: &str) -> Result<(), AmqpError>;

    /// Passive queue declaration; fails when the queue does not exist.
    async fn queue_exists(&self, name: &str) -> Result<(), AmqpError>;

    async fn basic_qos(&self, qos: &QosDefinition) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message. The returned future settles once the broker confirms it;
    /// on channels without confirm mode it resolves to an ack immediately.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<ConfirmFuture, AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Connection-level AMQP operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Factory for new connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// Opens `lapin` connections from an [`AmqpConfig`].
pub struct LapinConnector {
    cfg: AmqpConfig,
}

impl LapinConnector {
    pub fn new(cfg: AmqpConfig) -> Self {
        LapinConnector { cfg }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(
            host = self.cfg.host,
            heartbeat = params.heartbeat,
            "creating amqp connection..."
        );

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.app_name.clone()));
        let uri = self.cfg.uri(params);
        let timeout = params.connection_timeout().max(Duration::from_secs(1));

        let conn = match tokio::time::timeout(timeout, Connection::connect(&uri, options)).await {
            Err(_) => {
                error!(timeout = ?timeout, "connection attempt timed out");
                Err(AmqpError::ConnectionError("connection timed out".to_owned()))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Ok(Ok(c)) => Ok(c),
        }?;

        debug!("amqp connected");
        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!(id = c.id(), "channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(200, "shutdown")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    inner: Channel,
}

/// Keeps not-found and connection failures recognisable, wraps everything else.
fn declare_error(err: lapin::Error, wrap: impl FnOnce(String) -> AmqpError) -> AmqpError {
    match AmqpError::from(err) {
        e @ (AmqpError::ExchangeNotFound(_)
        | AmqpError::QueueNotFound(_)
        | AmqpError::ConnectionError(_)) => e,
        other => wrap(other.broker_text()),
    }
}

fn publish_error(err: lapin::Error) -> AmqpError {
    declare_error(err, AmqpError::PublishingError)
}

fn delivery_context(queue: &str, delivery: Delivery) -> DeliveryContext {
    let props = &delivery.properties;

    let message_id = props.message_id().as_ref().map(|id| id.to_string());
    let kind = props.kind().as_ref().map(|k| k.to_string());
    let headers = props
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();

    DeliveryContext {
        delivery_tag: delivery.delivery_tag,
        message_id,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        kind,
        queue: queue.to_owned(),
        epoch: 0,
        headers,
        body: delivery.data,
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let kind: lapin::ExchangeKind = def.kind.clone().try_into()?;

        self.inner
            .exchange_declare(
                &def.name,
                kind,
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                declare_error(err, |text| {
                    AmqpError::DeclareExchangeError(def.name.clone(), text)
                })
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                declare_error(err, |text| AmqpError::DeclareQueueError(def.name.clone(), text))
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                declare_error(err, |_| {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })
            })
    }

    async fn exchange_exists(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| declare_error(err, |_| AmqpError::ExchangeNotFound(name.to_owned())))
    }

    async fn queue_exists(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| declare_error(err, |_| AmqpError::QueueNotFound(name.to_owned())))
    }

    async fn basic_qos(&self, qos: &QosDefinition) -> Result<(), AmqpError> {
        if qos.prefetch_size > 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch size is not supported by the client, only the count is applied"
            );
        }

        self.inner
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<ConfirmFuture, AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.clone()))
            .with_delivery_mode(message.delivery_mode.as_u8())
            .with_message_id(ShortString::from(message.message_id.clone()))
            .with_headers(message.header_table());

        if let Some(kind) = &message.kind {
            props = props.with_kind(ShortString::from(kind.clone()));
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    immediate: false,
                },
                &message.payload,
                props,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                publish_error(err)
            })?;

        Ok(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => Ok(PublishConfirm {
                    acked: true,
                    nacked: false,
                    returned: returned.is_some(),
                }),
                Ok(Confirmation::Nack(returned)) => Ok(PublishConfirm {
                    acked: false,
                    nacked: true,
                    returned: returned.is_some(),
                }),
                Ok(Confirmation::NotRequested) => Ok(PublishConfirm::ack()),
                Err(err) => Err(publish_error(err)),
            }
        }
        .boxed())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.nowait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                declare_error(err, AmqpError::BindingConsumerError)
            })?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(delivery_context(&queue, delivery)),
                Err(err) => Err(AmqpError::from(err)),
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(200, "closing channel")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
