//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! - **Stream key**: `tradeflow:events`, one stream for every integration event
//! - **Consumer groups**: one per handler (`inventory-orders`, `sales-saga`);
//!   entries of types a group did not subscribe to are acked on sight
//! - **Redelivery**: un-acked entries stay in the group's pending list and are
//!   claimed again once idle for `claim_idle`; a nack simply leaves the entry
//!   pending
//! - **Dead letters**: entries delivered more than `max_deliveries` times, or
//!   dead-lettered by a handler, are copied to `tradeflow:events:dlq` and acked
//! - **Backpressure**: each subscription buffers at most `buffer` deliveries;
//!   the reader only reads (or claims) while there is room, and never claims
//!   entries still sitting in its own buffer

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use tradeflow_events::{
    Acker, Delivery, DeliveryError, EventEnvelope, EventPublisher, EventSubscriber, PublishError,
    Subscription,
};

use crate::config::InfraConfig;

const DEFAULT_STREAM_KEY: &str = "tradeflow:events";
const DEFAULT_DLQ_KEY: &str = "tradeflow:events:dlq";

const READ_BATCH: usize = 16;
const READ_BLOCK: Duration = Duration::from_millis(1_000);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
}

fn delivery_error(op: &str, err: redis::RedisError) -> DeliveryError {
    DeliveryError::Transport(format!("{op} failed: {err}"))
}

#[derive(Clone)]
pub struct RedisStreamsEventBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    stream_key: String,
    dlq_key: String,
    max_deliveries: u32,
    claim_idle: Duration,
    buffer: usize,
}

impl core::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("stream_key", &self.stream_key)
            .field("dlq_key", &self.dlq_key)
            .field("max_deliveries", &self.max_deliveries)
            .field("claim_idle", &self.claim_idle)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl RedisStreamsEventBus {
    /// Connect using `REDIS_URL`, `TRADEFLOW_MAX_DELIVERIES` and the handler
    /// timeout (entries idle longer than that are considered abandoned). Each
    /// subscription buffers one delivery per consumer worker.
    pub async fn connect(config: &InfraConfig) -> Result<Self, RedisStreamsError> {
        let mut bus = Self::new(&config.redis_url, None, None).await?;
        bus.max_deliveries = config.max_deliveries;
        bus.claim_idle = config.handler_timeout;
        Ok(bus.with_buffer(config.consumer_workers))
    }

    /// * `redis_url` - e.g. "redis://localhost:6379"
    /// * `stream_key` - defaults to "tradeflow:events"
    /// * `dlq_key` - defaults to "tradeflow:events:dlq"
    pub async fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        dlq_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn,
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            dlq_key: dlq_key.unwrap_or_else(|| DEFAULT_DLQ_KEY.to_string()),
            max_deliveries: tradeflow_events::in_memory_bus::DEFAULT_MAX_DELIVERIES,
            claim_idle: Duration::from_secs(30),
            buffer: 1,
        })
    }

    /// Deliveries a subscription may hold before its reader stops reading.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_consumer_group(&self, group: &str) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        // "0" so a new group also sees entries published before it existed.
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.stream_key, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    fn acker(&self, group: &str) -> Arc<dyn Acker> {
        Arc::new(StreamAcker {
            conn: self.conn.clone(),
            stream_key: self.stream_key.clone(),
            dlq_key: self.dlq_key.clone(),
            group: group.to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisStreamsEventBus {
    #[instrument(
        skip(self, envelope),
        fields(
            stream_key = %self.stream_key,
            event_id = %envelope.event_id(),
            event_type = envelope.event_type()
        ),
        err
    )]
    async fn publish_envelope(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        let payload = envelope.to_json()?;
        let event_id = envelope.event_id().to_string();
        let mut conn = self.conn.clone();

        let _: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[
                    ("event_id", event_id.as_str()),
                    ("event_type", envelope.event_type()),
                    ("payload", payload.as_str()),
                ],
            )
            .await
            .map_err(|e| {
                if is_transient(&e) {
                    PublishError::transient(format!("XADD failed: {e}"))
                } else {
                    PublishError::permanent(format!("XADD failed: {e}"))
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for RedisStreamsEventBus {
    /// Join `group` as a fresh consumer. A background task feeds the
    /// subscription until it is dropped.
    async fn subscribe(
        &self,
        group: &str,
        event_types: &[&'static str],
    ) -> Result<Subscription, DeliveryError> {
        self.ensure_consumer_group(group)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        // Blocking reads get their own connection so they never stall publishes.
        let read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| delivery_error("connect", e))?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let reader = StreamReader {
            conn: read_conn,
            stream_key: self.stream_key.clone(),
            group: group.to_string(),
            consumer: format!("{group}-{}", Uuid::now_v7()),
            event_types: event_types.to_vec(),
            max_deliveries: self.max_deliveries,
            claim_idle: self.claim_idle,
            acker: self.acker(group),
            handed_off: HandOff::new(self.buffer),
            tx,
        };
        tokio::spawn(reader.run());
        Ok(Subscription::bounded(rx))
    }
}

/// Settles deliveries of one consumer group. Tokens are stream entry ids.
struct StreamAcker {
    conn: MultiplexedConnection,
    stream_key: String,
    dlq_key: String,
    group: String,
}

impl StreamAcker {
    async fn xack(&self, token: &str) -> Result<(), DeliveryError> {
        let mut conn = self.conn.clone();
        let acked: usize = conn
            .xack(&self.stream_key, &self.group, &[token])
            .await
            .map_err(|e| delivery_error("XACK", e))?;
        if acked == 0 {
            return Err(DeliveryError::UnknownDelivery(token.to_string()));
        }
        Ok(())
    }

    async fn move_to_dlq(&self, token: &str, payload: &str, reason: &str) -> Result<(), DeliveryError> {
        let mut conn = self.conn.clone();
        let failed_at = chrono::Utc::now().to_rfc3339();
        let _: String = conn
            .xadd(
                &self.dlq_key,
                "*",
                &[
                    ("original_message_id", token),
                    ("group", self.group.as_str()),
                    ("reason", reason),
                    ("failed_at", failed_at.as_str()),
                    ("payload", payload),
                ],
            )
            .await
            .map_err(|e| delivery_error("DLQ XADD", e))?;
        self.xack(token).await?;
        error!(message_id = %token, group = %self.group, %reason, "message sent to dead-letter stream");
        Ok(())
    }
}

#[async_trait]
impl Acker for StreamAcker {
    async fn ack(&self, token: &str) -> Result<(), DeliveryError> {
        self.xack(token).await
    }

    async fn nack(&self, token: &str, reason: &str) -> Result<(), DeliveryError> {
        // The entry stays pending and is reclaimed once idle.
        debug!(message_id = %token, group = %self.group, %reason, "delivery left pending for redelivery");
        Ok(())
    }

    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), DeliveryError> {
        let mut conn = self.conn.clone();
        let range: StreamRangeReply = conn
            .xrange(&self.stream_key, token, token)
            .await
            .map_err(|e| delivery_error("XRANGE", e))?;
        let payload = range
            .ids
            .first()
            .and_then(|entry| entry.get::<String>("payload"))
            .unwrap_or_default();
        self.move_to_dlq(token, &payload, reason).await
    }
}

/// Entry ids most recently sent into a subscription's channel, oldest first.
///
/// The channel is FIFO with a single sender, so the entries still queued are
/// the last `in_channel` ids sent.
#[derive(Debug)]
struct HandOff {
    sent: VecDeque<String>,
    limit: usize,
}

impl HandOff {
    fn new(limit: usize) -> Self {
        Self {
            sent: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    fn record(&mut self, id: String) {
        if self.sent.len() == self.limit {
            self.sent.pop_front();
        }
        self.sent.push_back(id);
    }

    fn is_queued(&self, id: &str, in_channel: usize) -> bool {
        self.sent.iter().rev().take(in_channel).any(|sent| sent == id)
    }
}

/// Deliveries sent but not yet received.
fn queued<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

/// Background task pulling one consumer's entries off the stream.
struct StreamReader {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
    event_types: Vec<&'static str>,
    max_deliveries: u32,
    claim_idle: Duration,
    acker: Arc<dyn Acker>,
    handed_off: HandOff,
    tx: mpsc::Sender<Delivery>,
}

impl StreamReader {
    async fn run(mut self) {
        debug!(group = %self.group, consumer = %self.consumer, "stream reader started");
        loop {
            // Wait for a free slot; an error means the subscription was dropped.
            match self.tx.reserve().await {
                Ok(permit) => drop(permit),
                Err(_) => break,
            }
            if let Err(e) = self.reclaim_idle().await {
                warn!(group = %self.group, error = %e, "failed to reclaim idle entries");
            }
            if let Err(e) = self.read_new().await {
                warn!(group = %self.group, error = %e, "XREADGROUP failed");
                tokio::time::sleep(READ_BLOCK).await;
            }
        }
        debug!(group = %self.group, consumer = %self.consumer, "subscription dropped, stream reader stopped");
    }

    /// Claim entries other consumers (or this one) left pending too long.
    async fn reclaim_idle(&mut self) -> Result<(), DeliveryError> {
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.stream_key, &self.group, "-", "+", READ_BATCH)
            .await
            .map_err(|e| delivery_error("XPENDING", e))?;

        let idle_ms = self.claim_idle.as_millis() as usize;
        for entry in pending.ids.into_iter().filter(|p| p.last_delivered_ms >= idle_ms) {
            if self.tx.capacity() == 0 {
                break;
            }
            if entry.consumer == self.consumer
                && self.handed_off.is_queued(&entry.id, queued(&self.tx))
            {
                // Waiting for a worker, not abandoned.
                continue;
            }
            let claimed: StreamClaimReply = self
                .conn
                .xclaim(&self.stream_key, &self.group, &self.consumer, idle_ms, &[&entry.id])
                .await
                .map_err(|e| delivery_error("XCLAIM", e))?;

            // XCLAIM counts as another delivery.
            let attempt = u32::try_from(entry.times_delivered + 1).unwrap_or(u32::MAX);
            for stream_id in claimed.ids {
                if attempt > self.max_deliveries {
                    let reason = format!("exceeded {} deliveries", self.max_deliveries);
                    self.acker.dead_letter(&stream_id.id, &reason).await?;
                    continue;
                }
                self.dispatch(stream_id, attempt).await;
            }
        }
        Ok(())
    }

    async fn read_new(&mut self) -> Result<(), DeliveryError> {
        let room = self.tx.capacity();
        if room == 0 {
            return Ok(());
        }
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(room.min(READ_BATCH))
            .block(READ_BLOCK.as_millis() as usize);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await
            .map_err(|e| delivery_error("XREADGROUP", e))?;

        // A BLOCK timeout comes back as nil.
        let Some(reply) = reply else {
            return Ok(());
        };
        for key in reply.keys {
            for stream_id in key.ids {
                self.dispatch(stream_id, 1).await;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, entry: StreamId, attempt: u32) {
        let event_type: Option<String> = entry.get("event_type");
        let wanted = event_type
            .as_deref()
            .is_some_and(|t| self.event_types.iter().any(|wanted| *wanted == t));
        if !wanted {
            if let Err(e) = self.acker.ack(&entry.id).await {
                warn!(message_id = %entry.id, error = %e, "failed to ack skipped entry");
            }
            return;
        }

        let payload: Option<String> = entry.get("payload");
        let envelope = payload
            .ok_or_else(|| "missing payload field".to_string())
            .and_then(|p| EventEnvelope::from_json(p.as_bytes()).map_err(|e| e.to_string()));
        match envelope {
            Ok(envelope) => {
                let delivery = Delivery::new(envelope, attempt, entry.id.clone(), self.acker.clone());
                if self.tx.send(delivery).await.is_err() {
                    debug!(message_id = %entry.id, "subscription dropped; entry stays pending");
                    return;
                }
                self.handed_off.record(entry.id);
            }
            Err(reason) => {
                if let Err(e) = self.acker.dead_letter(&entry.id, &reason).await {
                    warn!(message_id = %entry.id, error = %e, "failed to dead-letter undecodable entry");
                }
            }
        }
    }
}
