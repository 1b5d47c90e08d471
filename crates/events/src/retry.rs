//! Bounded backoff for transient publish failures.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::{EventPublisher, PublishError};
use crate::envelope::EventEnvelope;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 behaves like 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow `attempt` failed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Publisher decorator that retries transient transport failures.
///
/// Serialization and permanent transport failures are returned immediately.
/// When attempts run out the last error is returned so the caller can decide
/// between dead-lettering and failing the operation.
#[derive(Debug, Clone)]
pub struct RetryingPublisher<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P> RetryingPublisher<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<P> EventPublisher for RetryingPublisher<P>
where
    P: EventPublisher,
{
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.publish_envelope(envelope.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(
                            event_id = %envelope.event_id(),
                            attempt,
                            "publish succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(err) if err.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        event_id = %envelope.event_id(),
                        event_type = envelope.event_type(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        event_id = %envelope.event_id(),
                        event_type = envelope.event_type(),
                        attempt,
                        error = %err,
                        "publish failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventPublisherExt;
    use crate::event::EventMetadata;
    use crate::in_memory_bus::InMemoryEventBus;
    use crate::integration::StockDebited;
    use chrono::Utc;
    use tradeflow_core::{EventId, OrderId};

    fn event() -> StockDebited {
        StockDebited {
            metadata: EventMetadata::new(Utc::now(), None),
            order_id: OrderId::new(),
            source_event_id: EventId::new(),
            lines: vec![],
        }
    }

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(300))
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes([PublishError::transient("down"), PublishError::transient("down")]);
        let publisher = RetryingPublisher::new(
            bus.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        );

        publisher.publish(&event()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failures_fail_fast() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes([PublishError::permanent("rejected"), PublishError::transient("x")]);
        let publisher = RetryingPublisher::new(
            bus.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        );

        let err = publisher.publish(&event()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes((0..3).map(|_| PublishError::transient("down")));
        let publisher = RetryingPublisher::new(
            bus.clone(),
            RetryPolicy::fixed(2, Duration::from_millis(10)),
        );

        assert!(publisher.publish(&event()).await.unwrap_err().is_transient());
        assert!(bus.published().is_empty());

        // The third injected failure is absorbed by the next publish's retry.
        publisher.publish(&event()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }
}
