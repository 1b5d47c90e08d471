use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use tradeflow_core::{CorrelationId, EventId};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "sales.order.confirmed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

fn default_schema_version() -> u32 {
    1
}

/// Header fields every integration event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Deduplication key on the wire.
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl EventMetadata {
    /// Fresh metadata with a new event id at schema version 1.
    pub fn new(occurred_at: DateTime<Utc>, correlation_id: Option<CorrelationId>) -> Self {
        Self::with_id(EventId::new(), occurred_at, correlation_id)
    }

    pub fn with_id(
        event_id: EventId,
        occurred_at: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            event_id,
            occurred_at,
            correlation_id,
            schema_version: default_schema_version(),
        }
    }

    /// Metadata for an event emitted in reaction to `source`.
    ///
    /// The id is derived from the source id and `event_type`, so reprocessing the
    /// same source event yields the same result event id. The correlation id is
    /// inherited.
    pub fn caused_by(source: &EventMetadata, event_type: &str, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: EventId::derived_from(source.event_id, event_type),
            occurred_at,
            correlation_id: source.correlation_id.clone(),
            schema_version: default_schema_version(),
        }
    }
}

/// An event that crosses the service boundary.
pub trait IntegrationEvent: Event + Serialize + DeserializeOwned {
    const EVENT_TYPE: &'static str;

    /// Newest schema version this build can read and write.
    const SCHEMA_VERSION: u32;

    fn metadata(&self) -> &EventMetadata;

    fn event_id(&self) -> EventId {
        self.metadata().event_id
    }

    fn correlation_id(&self) -> Option<&CorrelationId> {
        self.metadata().correlation_id.as_ref()
    }
}

/// Implements [`Event`] and [`IntegrationEvent`] for a struct with a
/// `metadata: EventMetadata` field.
macro_rules! integration_event {
    ($t:ty, $name:literal, $version:literal) => {
        impl $crate::event::Event for $t {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn version(&self) -> u32 {
                self.metadata.schema_version
            }

            fn occurred_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.metadata.occurred_at
            }
        }

        impl $crate::event::IntegrationEvent for $t {
            const EVENT_TYPE: &'static str = $name;
            const SCHEMA_VERSION: u32 = $version;

            fn metadata(&self) -> &$crate::event::EventMetadata {
                &self.metadata
            }
        }
    };
}

pub(crate) use integration_event;
