use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tradeflow_core::{CorrelationId, EventId};

use crate::event::IntegrationEvent;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to serialize {event_type}: {source}")]
    Serialize {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected event type {expected}, got {actual}")]
    TypeMismatch { expected: &'static str, actual: String },

    /// The payload declares a schema version this build cannot interpret.
    #[error("unsupported schema version {version} for {event_type} (supported: 1..={supported})")]
    UnsupportedVersion {
        event_type: String,
        version: u32,
        supported: u32,
    },

    #[error("envelope id {envelope} does not match payload id {payload}")]
    IdMismatch { envelope: EventId, payload: EventId },
}

/// Wire unit for an integration event.
///
/// The header (`event_id`, `event_type`, `schema_version`) is enough to route
/// and deduplicate without touching the payload. Consumers tolerate unknown
/// payload fields and reject versions newer than they understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: String,
    schema_version: u32,
    occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
    payload: JsonValue,
}

impl EventEnvelope {
    /// Serialize a typed event into an envelope.
    pub fn wrap<E: IntegrationEvent>(event: &E) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(event).map_err(|source| EnvelopeError::Serialize {
            event_type: E::EVENT_TYPE,
            source,
        })?;
        let meta = event.metadata();

        Ok(Self {
            event_id: meta.event_id,
            event_type: E::EVENT_TYPE.to_string(),
            schema_version: meta.schema_version,
            occurred_at: meta.occurred_at,
            correlation_id: meta.correlation_id.clone(),
            payload,
        })
    }

    /// Deserialize the payload as `E`, checking type and version first.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, EnvelopeError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(EnvelopeError::TypeMismatch {
                expected: E::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }
        if self.schema_version == 0 || self.schema_version > E::SCHEMA_VERSION {
            return Err(EnvelopeError::UnsupportedVersion {
                event_type: self.event_type.clone(),
                version: self.schema_version,
                supported: E::SCHEMA_VERSION,
            });
        }

        let event: E = serde_json::from_value(self.payload.clone()).map_err(|source| {
            EnvelopeError::Malformed {
                event_type: self.event_type.clone(),
                source,
            }
        })?;

        if event.event_id() != self.event_id {
            return Err(EnvelopeError::IdMismatch {
                envelope: self.event_id,
                payload: event.event_id(),
            });
        }
        Ok(event)
    }

    /// Parse an envelope from raw transport bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|source| EnvelopeError::Malformed {
            event_type: "envelope".to_string(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|source| EnvelopeError::Serialize {
            event_type: "envelope",
            source,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::integration::{StockDebited, StockReleased};
    use tradeflow_core::OrderId;

    fn debited() -> StockDebited {
        StockDebited {
            metadata: EventMetadata::new(Utc::now(), Some(CorrelationId::parse("c-1").unwrap())),
            order_id: OrderId::new(),
            source_event_id: EventId::new(),
            lines: vec![],
        }
    }

    #[test]
    fn header_mirrors_event_metadata() {
        let event = debited();
        let envelope = EventEnvelope::wrap(&event).unwrap();

        assert_eq!(envelope.event_id(), event.metadata.event_id);
        assert_eq!(envelope.event_type(), "inventory.stock.debited");
        assert_eq!(envelope.schema_version(), 1);
        assert_eq!(envelope.correlation_id().map(|c| c.as_str()), Some("c-1"));
        assert_eq!(envelope.decode::<StockDebited>().unwrap(), event);
    }

    #[test]
    fn decoding_as_the_wrong_type_fails() {
        let envelope = EventEnvelope::wrap(&debited()).unwrap();
        assert!(matches!(
            envelope.decode::<StockReleased>(),
            Err(EnvelopeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut envelope = EventEnvelope::wrap(&debited()).unwrap();
        envelope.payload["added_in_a_later_release"] = serde_json::json!("ignored");
        assert!(envelope.decode::<StockDebited>().is_ok());
    }

    #[test]
    fn newer_schema_versions_are_rejected() {
        let mut envelope = EventEnvelope::wrap(&debited()).unwrap();
        envelope.schema_version = 2;
        assert!(matches!(
            envelope.decode::<StockDebited>(),
            Err(EnvelopeError::UnsupportedVersion { version: 2, supported: 1, .. })
        ));
    }

    #[test]
    fn survives_transport_bytes() {
        let envelope = EventEnvelope::wrap(&debited()).unwrap();
        let json = envelope.to_json().unwrap();
        assert_eq!(EventEnvelope::from_json(json.as_bytes()).unwrap(), envelope);
    }
}
