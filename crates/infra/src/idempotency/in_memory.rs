use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use tradeflow_core::EventId;
use tradeflow_events::{IdempotencyLedger, LedgerError, ProcessedEvent, ProcessingDecision};

/// In-memory ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<EventId, ProcessedEvent>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventId, ProcessedEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn try_begin_processing(
        &self,
        event_id: EventId,
    ) -> Result<ProcessingDecision, LedgerError> {
        Ok(if self.lock().contains_key(&event_id) {
            ProcessingDecision::AlreadyProcessed
        } else {
            ProcessingDecision::ProceedAndRecord
        })
    }

    async fn record(&self, entry: ProcessedEvent) -> Result<(), LedgerError> {
        let mut entries = self.lock();
        if entries.contains_key(&entry.event_id) {
            return Err(LedgerError::Duplicate(entry.event_id));
        }
        entries.insert(entry.event_id, entry);
        Ok(())
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, LedgerError> {
        Ok(self.lock().get(&event_id).cloned())
    }
}
