// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the process' single AMQP connection and the channels opened on it. Callers ask
//! for a channel by role; the supervisor connects lazily, reuses the channel while it is
//! healthy and reconnects with bounded exponential backoff when asked to.
//!
//! A heartbeat task runs beside the consumer's receive loop and flips a liveness flag
//! when the connection goes away, so a consumer blocked on an idle queue still notices.

use crate::{
    channel::{AmqpChannel, AmqpConnection, AmqpConnector},
    config::{AmqpConfig, ConnectionParams, Role},
    declaration::{BrokerProbe, EntityKind},
    errors::AmqpError,
    queue::QosDefinition,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// Connected at last check but the heartbeat lost track of it
    Degraded,
}

/// Liveness flag shared with the heartbeat task.
struct Liveness {
    alive: watch::Sender<bool>,
    last_seen: StdMutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        let (alive, _) = watch::channel(false);
        Liveness {
            alive,
            last_seen: StdMutex::new(Instant::now()),
        }
    }

    fn refresh(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    fn elapsed(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed())
            .unwrap_or_default()
    }

    fn reset(&self) {
        self.refresh();
        self.alive.send_replace(true);
    }

    fn lost(&self) {
        self.alive.send_replace(false);
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }
}

#[derive(Default)]
struct Inner {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    confirm: Option<Arc<dyn AmqpChannel>>,
    params: Option<ConnectionParams>,
    heartbeat: Option<CancellationToken>,
    epoch: u64,
}

impl Inner {
    fn connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }
}

/// Single owner of the AMQP connection of a process.
///
/// Share it behind an `Arc` between the publisher and the consumer loop.
pub struct ConnectionSupervisor {
    connector: Arc<dyn AmqpConnector>,
    cfg: AmqpConfig,
    inner: Mutex<Inner>,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn AmqpConnector>, cfg: AmqpConfig) -> Self {
        ConnectionSupervisor {
            connector,
            cfg,
            inner: Mutex::new(Inner::default()),
            liveness: Arc::new(Liveness::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.cfg
    }

    /// Returns the open channel, connecting with the role's parameters when needed.
    pub async fn acquire(&self, role: Role) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.acquire_with(self.cfg.params(role).clone()).await
    }

    /// Like [`acquire`](Self::acquire) with explicit connection parameters, e.g. a
    /// consumer's heartbeat override.
    pub async fn acquire_with(
        &self,
        params: ConnectionParams,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut inner = self.inner.lock().await;

        if let Some(channel) = self.healthy_channel(&inner) {
            return Ok(channel);
        }

        self.connect(&mut inner, params).await
    }

    /// Returns the publisher-confirm channel, opening it on the current connection when
    /// it is missing or closed.
    pub async fn acquire_confirm(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut inner = self.inner.lock().await;

        if self.healthy_channel(&inner).is_none() {
            let params = self.params_for(&inner, Role::Producer);
            self.connect(&mut inner, params).await?;
        }

        if let Some(confirm) = inner.confirm.as_ref().filter(|c| c.is_open()) {
            return Ok(confirm.clone());
        }

        let connection = inner.connection.clone().ok_or(AmqpError::InternalError)?;
        let confirm = connection.open_channel().await?;
        confirm.confirm_select().await?;
        debug!("confirm channel opened");

        inner.confirm = Some(confirm.clone());
        Ok(confirm)
    }

    /// Opens a short-lived channel for passive declarations.
    ///
    /// A failed passive declaration closes the channel on the broker side, so probes never
    /// run on the shared channel.
    pub async fn probe_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut inner = self.inner.lock().await;

        if !inner.connected() {
            let params = self.params_for(&inner, Role::Producer);
            self.connect(&mut inner, params).await?;
        }

        let connection = inner.connection.clone().ok_or(AmqpError::InternalError)?;
        connection.open_channel().await
    }

    /// Replaces the connection and channel, waiting `backoff_base^n` seconds before
    /// attempt `n`. QoS is reapplied to the fresh channel when given.
    pub async fn reconnect(
        &self,
        role: Role,
        qos: Option<&QosDefinition>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let max_attempts = self.cfg.retry.max_attempts;

        for attempt in 1..=max_attempts {
            let delay = self.cfg.retry.backoff(attempt);
            warn!(attempt, max_attempts, delay = ?delay, "reconnecting to the broker...");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(AmqpError::ConnectionError("supervisor is shut down".to_owned()))
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut inner = self.inner.lock().await;
            let params = self.params_for(&inner, role);

            let channel = match self.connect(&mut inner, params).await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(error = err.to_string(), attempt, "reconnect attempt failed");
                    continue;
                }
            };

            if let Some(qos) = qos {
                if let Err(err) = channel.basic_qos(qos).await {
                    error!(error = err.to_string(), attempt, "failure to reapply qos");
                    continue;
                }
            }

            info!(attempt, epoch = inner.epoch, "reconnected");
            return Ok(channel);
        }

        error!(max_attempts, "reconnect attempts exhausted");
        Err(AmqpError::ReconnectExhausted(max_attempts))
    }

    /// Stops the heartbeat and closes the channels then the connection.
    ///
    /// Failures of each step are logged and do not stop the following ones.
    pub async fn shutdown(&self) {
        info!("shutting down amqp connection...");
        self.shutdown.cancel();

        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        self.liveness.lost();
    }

    pub async fn state(&self) -> ConnectionState {
        let inner = self.inner.lock().await;

        if inner.connection.is_none() {
            return ConnectionState::Disconnected;
        }

        if !inner.connected() || !self.liveness.is_alive() {
            return ConnectionState::Degraded;
        }

        ConnectionState::Connected
    }

    /// Number of connections opened so far; delivery tags are only valid within one epoch.
    pub async fn epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    /// Watches the liveness flag; `false` means the consumer should reconnect.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.alive.subscribe()
    }

    fn healthy_channel(&self, inner: &Inner) -> Option<Arc<dyn AmqpChannel>> {
        if !inner.connected() || !self.liveness.is_alive() {
            return None;
        }

        inner.channel.as_ref().filter(|c| c.is_open()).cloned()
    }

    fn params_for(&self, inner: &Inner, role: Role) -> ConnectionParams {
        inner
            .params
            .clone()
            .unwrap_or_else(|| self.cfg.params(role).clone())
    }

    async fn connect(
        &self,
        inner: &mut Inner,
        params: ConnectionParams,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::ConnectionError("supervisor is shut down".to_owned()));
        }

        self.teardown(inner).await;

        let connection = self.connector.connect(&params).await?;
        let channel = connection.open_channel().await?;

        inner.epoch += 1;
        inner.connection = Some(connection.clone());
        inner.channel = Some(channel.clone());
        inner.heartbeat = self.start_heartbeat(connection, params.heartbeat);
        inner.params = Some(params);
        self.liveness.reset();

        debug!(epoch = inner.epoch, "amqp channel ready");
        Ok(channel)
    }

    async fn teardown(&self, inner: &mut Inner) {
        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.cancel();
        }

        if let Some(confirm) = inner.confirm.take() {
            if let Err(err) = confirm.close().await {
                warn!(error = err.to_string(), "failure to close the confirm channel");
            }
        }

        if let Some(channel) = inner.channel.take() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close the channel");
            }
        }

        if let Some(connection) = inner.connection.take() {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "failure to close the connection");
            }
        }
    }

    fn start_heartbeat(
        &self,
        connection: Arc<dyn AmqpConnection>,
        heartbeat: u16,
    ) -> Option<CancellationToken> {
        if heartbeat == 0 {
            return None;
        }

        let token = self.shutdown.child_token();
        let period = Duration::from_secs(u64::from(heartbeat).div_ceil(4));
        let window = Duration::from_secs(u64::from(heartbeat));

        tokio::spawn(watch_liveness(
            connection,
            self.liveness.clone(),
            period,
            window,
            token.clone(),
        ));

        Some(token)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn watch_liveness(
    connection: Arc<dyn AmqpConnection>,
    liveness: Arc<Liveness>,
    period: Duration,
    window: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if connection.is_connected() {
                    liveness.refresh();
                }

                if !connection.is_connected() || liveness.elapsed() > window {
                    warn!(window = ?window, "connection liveness lost");
                    liveness.lost();
                    break;
                }
            }
        }
    }

    debug!("heartbeat stopped");
}

#[async_trait]
impl BrokerProbe for ConnectionSupervisor {
    async fn probe(&self, kind: EntityKind, name: &str) -> bool {
        let channel = match self.probe_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = err.to_string(), name, "failure to open a probe channel");
                return false;
            }
        };

        let found = match kind {
            EntityKind::Exchange => channel.exchange_exists(name).await,
            EntityKind::Queue => channel.queue_exists(name).await,
        };

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "probe channel already closed");
        }

        found.is_ok()
    }
}
