// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Result Dispatcher
//!
//! Turns the result of a handler into exactly one broker acknowledgement for the delivery.
//! Handler failures are counted in the [`RetryLedger`] and become a negative
//! acknowledgement until the consumer's attempt budget is spent, after which the message
//! is rejected without requeue so the queue's dead-letter exchange receives it.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    message::{DeliveryContext, Outcome},
    retry::RetryLedger,
};
use tracing::{debug, error, warn};

/// Handler retry policy of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Failures allowed before the message is dropped
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: false,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        RetryPolicy {
            enabled: true,
            max_attempts,
        }
    }
}

/// Terminal broker action for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// Maps handler results to acknowledgements.
#[derive(Clone)]
pub struct ResultDispatcher {
    ledger: RetryLedger,
}

impl ResultDispatcher {
    pub fn new(ledger: RetryLedger) -> Self {
        ResultDispatcher { ledger }
    }

    /// Decides the terminal action for a delivery, updating the retry ledger on the way.
    ///
    /// # Parameters
    /// * `ctx` - The delivery being settled
    /// * `result` - What the handler returned
    /// * `policy` - The consumer's retry policy
    /// * `requeue` - The consumer's requeue flag, applied to `Nack` and `Requeue`
    pub async fn decide(
        &self,
        ctx: &DeliveryContext,
        result: Result<Outcome, anyhow::Error>,
        policy: &RetryPolicy,
        requeue: bool,
    ) -> Settlement {
        let Some(message_id) = ctx.retry_key() else {
            warn!(
                delivery_tag = ctx.delivery_tag,
                queue = ctx.queue,
                "message without message id, retries cannot be tracked"
            );
            return Settlement::Reject { requeue: false };
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    error = format!("{err:#}"),
                    message_id,
                    queue = ctx.queue,
                    "failure to handle message"
                );
                self.on_failure(message_id, ctx, policy).await
            }
        };

        match outcome {
            Outcome::Ack => {
                self.ledger.clear(message_id).await;
                Settlement::Ack
            }
            Outcome::Nack => Settlement::Nack { requeue },
            Outcome::Requeue => Settlement::Reject { requeue },
            Outcome::Drop => Settlement::Reject { requeue: false },
        }
    }

    async fn on_failure(
        &self,
        message_id: &str,
        ctx: &DeliveryContext,
        policy: &RetryPolicy,
    ) -> Outcome {
        if !policy.enabled {
            return Outcome::Drop;
        }

        let failures = self.ledger.get(message_id).await.saturating_add(1);
        if failures >= policy.max_attempts {
            warn!(
                message_id,
                failures,
                queue = ctx.queue,
                "too many attempts, dropping to the dead-letter exchange"
            );
            self.ledger.clear(message_id).await;
            return Outcome::Drop;
        }

        self.ledger.increment(message_id).await;
        Outcome::Nack
    }

    /// Issues the broker call for a settlement.
    pub async fn settle(
        channel: &dyn AmqpChannel,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> Result<(), AmqpError> {
        debug!(delivery_tag, ?settlement, "settling delivery");

        match settlement {
            Settlement::Ack => channel.basic_ack(delivery_tag).await,
            Settlement::Nack { requeue } => channel.basic_nack(delivery_tag, requeue).await,
            Settlement::Reject { requeue } => channel.basic_reject(delivery_tag, requeue).await,
        }
    }

    /// Decides and settles one delivery.
    pub async fn dispatch(
        &self,
        channel: &dyn AmqpChannel,
        ctx: &DeliveryContext,
        result: Result<Outcome, anyhow::Error>,
        policy: &RetryPolicy,
        requeue: bool,
    ) -> Result<Settlement, AmqpError> {
        let settlement = self.decide(ctx, result, policy, requeue).await;
        ResultDispatcher::settle(channel, ctx.delivery_tag, settlement).await?;
        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAmqpChannel, store::MemoryStore};
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use std::{sync::Arc, time::Duration};

    fn dispatcher() -> (ResultDispatcher, RetryLedger) {
        let ledger = RetryLedger::new(Arc::new(MemoryStore::new()), Duration::from_secs(86400));
        (ResultDispatcher::new(ledger.clone()), ledger)
    }

    fn delivery() -> DeliveryContext {
        DeliveryContext::new("orders", 42, b"{}".to_vec()).with_message_id("m-1")
    }

    /// Mock channel accepting one call of the given settlement; any other call panics.
    fn expecting(settlement: Settlement) -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();

        match settlement {
            Settlement::Ack => {
                channel
                    .expect_basic_ack()
                    .with(eq(42))
                    .times(1)
                    .returning(|_| Ok(()));
            }
            Settlement::Nack { requeue } => {
                channel
                    .expect_basic_nack()
                    .with(eq(42), eq(requeue))
                    .times(1)
                    .returning(|_, _| Ok(()));
            }
            Settlement::Reject { requeue } => {
                channel
                    .expect_basic_reject()
                    .with(eq(42), eq(requeue))
                    .times(1)
                    .returning(|_, _| Ok(()));
            }
        }

        channel
    }

    #[tokio::test]
    async fn ack_acknowledges_and_clears_retries() {
        let (dispatcher, ledger) = dispatcher();
        ledger.increment("m-1").await;

        let channel = expecting(Settlement::Ack);
        let settled = dispatcher
            .dispatch(&channel, &delivery(), Ok(Outcome::Ack), &RetryPolicy::attempts(3), true)
            .await
            .unwrap();

        assert_eq!(settled, Settlement::Ack);
        assert_eq!(ledger.get("m-1").await, 0);
    }

    #[tokio::test]
    async fn requeue_rejects_with_consumer_flag() {
        let (dispatcher, _) = dispatcher();

        let channel = expecting(Settlement::Reject { requeue: true });
        dispatcher
            .dispatch(&channel, &delivery(), Ok(Outcome::Requeue), &RetryPolicy::default(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nack_uses_consumer_flag() {
        let (dispatcher, _) = dispatcher();

        let channel = expecting(Settlement::Nack { requeue: false });
        dispatcher
            .dispatch(&channel, &delivery(), Ok(Outcome::Nack), &RetryPolicy::default(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drop_rejects_without_requeue() {
        let (dispatcher, _) = dispatcher();

        let channel = expecting(Settlement::Reject { requeue: false });
        dispatcher
            .dispatch(&channel, &delivery(), Ok(Outcome::Drop), &RetryPolicy::default(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_message_id_is_rejected_without_touching_ledger() {
        let (dispatcher, ledger) = dispatcher();
        ledger.increment("").await;

        let ctx = DeliveryContext::new("orders", 42, vec![]);
        let channel = expecting(Settlement::Reject { requeue: false });
        dispatcher
            .dispatch(&channel, &ctx, Err(anyhow!("boom")), &RetryPolicy::attempts(3), true)
            .await
            .unwrap();

        let ctx = DeliveryContext::new("orders", 42, vec![]).with_message_id("");
        let channel = expecting(Settlement::Reject { requeue: false });
        dispatcher
            .dispatch(&channel, &ctx, Ok(Outcome::Ack), &RetryPolicy::attempts(3), true)
            .await
            .unwrap();

        assert_eq!(ledger.get("").await, 1);
    }

    #[tokio::test]
    async fn failures_without_retry_are_dropped() {
        let (dispatcher, ledger) = dispatcher();

        let channel = expecting(Settlement::Reject { requeue: false });
        dispatcher
            .dispatch(&channel, &delivery(), Err(anyhow!("boom")), &RetryPolicy::default(), true)
            .await
            .unwrap();

        assert_eq!(ledger.get("m-1").await, 0);
    }

    #[tokio::test]
    async fn third_failure_of_three_is_dropped() {
        let (dispatcher, ledger) = dispatcher();
        let policy = RetryPolicy::attempts(3);

        for expected in 1..=2 {
            let channel = expecting(Settlement::Nack { requeue: true });
            dispatcher
                .dispatch(&channel, &delivery(), Err(anyhow!("boom")), &policy, true)
                .await
                .unwrap();
            assert_eq!(ledger.get("m-1").await, expected);
        }

        let channel = expecting(Settlement::Reject { requeue: false });
        dispatcher
            .dispatch(&channel, &delivery(), Err(anyhow!("boom")), &policy, true)
            .await
            .unwrap();
        assert_eq!(ledger.get("m-1").await, 0);
    }

    #[tokio::test]
    async fn broker_failure_while_settling_is_reported() {
        let (dispatcher, _) = dispatcher();

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_ack()
            .times(1)
            .returning(|_| Err(AmqpError::AckMessageError));

        let err = dispatcher
            .dispatch(&channel, &delivery(), Ok(Outcome::Ack), &RetryPolicy::default(), true)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
