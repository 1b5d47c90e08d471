//! Background workers: event consumers and the reservation sweeper.

pub mod consumer;
pub mod reservation_sweeper;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub use consumer::{ConsumerConfig, EventConsumer, Settlement};
pub use reservation_sweeper::ReservationSweeper;

/// Handle to stop and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for in-flight work to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "worker task ended abnormally");
        }
    }
}

/// Resolves once shutdown was requested (or the handle was dropped).
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
