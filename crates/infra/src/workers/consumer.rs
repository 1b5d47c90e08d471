//! Event consumer worker pool.
//!
//! - Joins the handler's consumer group on a subscriber
//! - Runs at most `workers` handler invocations at once
//! - Bounds each invocation with a timeout
//! - Settles every delivery: ack on success, nack on retryable failure or
//!   timeout, dead-letter on fatal failure

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tradeflow_events::{
    Delivery, DeliveryError, EventHandler, EventSubscriber, HandlerOutcome, Subscription,
};

use super::{WorkerHandle, shutdown_requested};
use crate::config::InfraConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Maximum concurrent handler invocations.
    pub workers: usize,
    pub handler_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&InfraConfig> for ConsumerConfig {
    fn from(config: &InfraConfig) -> Self {
        Self {
            workers: config.consumer_workers,
            handler_timeout: config.handler_timeout,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
    DeadLettered,
}

#[derive(Debug)]
pub struct EventConsumer;

impl EventConsumer {
    /// Subscribe `handler` and spawn its consumption loop.
    pub async fn spawn<H, S>(
        handler: Arc<H>,
        subscriber: &S,
        config: ConsumerConfig,
    ) -> Result<WorkerHandle, DeliveryError>
    where
        H: EventHandler + 'static,
        S: EventSubscriber + ?Sized,
    {
        let subscription = subscriber
            .subscribe(handler.name(), handler.subscriptions())
            .await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = handler.name();

        info!(
            consumer = name,
            workers = config.workers,
            event_types = ?handler.subscriptions(),
            "starting event consumer"
        );
        let join = tokio::spawn(consume(handler, subscription, config, shutdown_rx));
        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }
}

async fn consume<H>(
    handler: Arc<H>,
    mut subscription: Subscription,
    config: ConsumerConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    H: EventHandler + 'static,
{
    let name = handler.name();
    let permits = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        // Take a permit before pulling a message. A saturated pool stops
        // draining the subscription, which stalls a bounded transport reader.
        let permit = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let delivery = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            delivery = subscription.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    info!(consumer = name, "subscription closed");
                    break;
                }
            },
        };

        let handler = handler.clone();
        let timeout = config.handler_timeout;
        tasks.spawn(async move {
            let _permit = permit;
            process(handler.as_ref(), delivery, timeout).await
        });

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(consumer = name, error = %e, "handler task panicked");
            }
        }
    }

    debug!(consumer = name, in_flight = tasks.len(), "draining event consumer");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(consumer = name, error = %e, "handler task panicked");
        }
    }
    info!(consumer = name, "event consumer stopped");
}

/// Run one delivery through `handler` and settle it.
pub async fn process<H>(handler: &H, delivery: Delivery, timeout: Duration) -> Settlement
where
    H: EventHandler + ?Sized,
{
    let consumer = handler.name();
    let event_id = delivery.envelope().event_id();
    let event_type = delivery.envelope().event_type().to_string();
    let attempt = delivery.attempt();

    let result = tokio::time::timeout(timeout, handler.handle(delivery.envelope())).await;

    let (settlement, settled) = match result {
        Ok(Ok(outcome)) => {
            match &outcome {
                HandlerOutcome::Applied => {
                    debug!(consumer, %event_id, %event_type, "event applied")
                }
                HandlerOutcome::Duplicate => {
                    debug!(consumer, %event_id, %event_type, "duplicate delivery")
                }
                HandlerOutcome::Rejected(reason) => {
                    info!(consumer, %event_id, %event_type, %reason, "event rejected")
                }
                HandlerOutcome::Ignored => {}
            }
            (Settlement::Acked, delivery.ack().await)
        }
        Ok(Err(e)) if e.is_retryable() => {
            warn!(consumer, %event_id, %event_type, attempt, error = %e, "handler failed, requeueing");
            (Settlement::Nacked, delivery.nack(&e.to_string()).await)
        }
        Ok(Err(e)) => {
            error!(consumer, %event_id, %event_type, attempt, error = %e, "handler failed, dead-lettering");
            (Settlement::DeadLettered, delivery.dead_letter(&e.to_string()).await)
        }
        Err(_) => {
            warn!(consumer, %event_id, %event_type, attempt, ?timeout, "handler timed out, requeueing");
            (Settlement::Nacked, delivery.nack("handler timed out").await)
        }
    };

    if let Err(e) = settled {
        warn!(consumer, %event_id, error = %e, "failed to settle delivery");
    }
    settlement
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tradeflow_core::{EventId, OrderId};
    use tradeflow_events::{
        EventEnvelope, EventMetadata, EventPublisherExt, HandlerError, InMemoryEventBus,
        IntegrationEvent, StockDebited,
    };

    /// Fails `failures` times with the given error, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        fatal: bool,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: u32, fatal: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                fatal,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn subscriptions(&self) -> &'static [&'static str] {
            &[StockDebited::EVENT_TYPE]
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> Result<HandlerOutcome, HandlerError> {
            tokio::time::sleep(self.delay).await;
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(if self.fatal {
                    HandlerError::fatal("corrupt")
                } else {
                    HandlerError::transient("db down")
                });
            }
            Ok(HandlerOutcome::Applied)
        }
    }

    fn debited() -> StockDebited {
        StockDebited {
            metadata: EventMetadata::new(Utc::now(), None),
            order_id: OrderId::new(),
            source_event_id: EventId::new(),
            lines: vec![],
        }
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered_until_success() {
        let bus = InMemoryEventBus::new();
        let handler = Flaky::new(2, false);
        let mut sub = bus.subscribe("flaky", handler.subscriptions()).await.unwrap();
        bus.publish(&debited()).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(process(&handler, next(&mut sub).await, timeout).await, Settlement::Nacked);
        assert_eq!(process(&handler, next(&mut sub).await, timeout).await, Settlement::Nacked);

        let third = next(&mut sub).await;
        assert_eq!(third.attempt(), 3);
        assert_eq!(process(&handler, third, timeout).await, Settlement::Acked);
        assert_eq!(bus.in_flight("flaky"), 0);
    }

    #[tokio::test]
    async fn fatal_failures_go_straight_to_dead_letter() {
        let bus = InMemoryEventBus::new();
        let handler = Flaky::new(1, true);
        let mut sub = bus.subscribe("flaky", handler.subscriptions()).await.unwrap();
        bus.publish(&debited()).await.unwrap();

        let settlement = process(&handler, next(&mut sub).await, Duration::from_secs(1)).await;
        assert_eq!(settlement, Settlement::DeadLettered);
        assert_eq!(bus.dead_letters().len(), 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_handlers_time_out_and_are_requeued() {
        let bus = InMemoryEventBus::new();
        let mut handler = Flaky::new(0, false);
        handler.delay = Duration::from_millis(200);
        let mut sub = bus.subscribe("flaky", handler.subscriptions()).await.unwrap();
        bus.publish(&debited()).await.unwrap();

        let settlement = process(&handler, next(&mut sub).await, Duration::from_millis(10)).await;
        assert_eq!(settlement, Settlement::Nacked);
        assert_eq!(next(&mut sub).await.attempt(), 2);
    }

    #[tokio::test]
    async fn spawned_consumer_drains_and_stops() {
        let bus = Arc::new(InMemoryEventBus::new());
        let handler = Arc::new(Flaky::new(0, false));
        let consumer = EventConsumer::spawn(handler.clone(), &bus, ConsumerConfig::default())
            .await
            .unwrap();

        for _ in 0..10 {
            bus.publish(&debited()).await.unwrap();
        }
        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 10 && bus.in_flight("flaky") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
        assert_eq!(bus.in_flight("flaky"), 0);
        consumer.shutdown().await;
    }
}
