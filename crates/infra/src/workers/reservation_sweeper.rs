use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use tradeflow_events::EventPublisher;

use super::{WorkerHandle, shutdown_requested};
use crate::inventory_store::InventoryStore;
use crate::services::InventoryService;

/// Periodically releases `Reserved` rows older than the reservation TTL.
#[derive(Debug)]
pub struct ReservationSweeper;

impl ReservationSweeper {
    pub fn spawn<St, P>(
        service: Arc<InventoryService<St, P>>,
        interval: Duration,
        ttl: chrono::Duration,
    ) -> WorkerHandle
    where
        St: InventoryStore + 'static,
        P: EventPublisher + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), ttl_secs = ttl.num_seconds(), "reservation sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep(Utc::now(), ttl).await {
                            warn!(error = %e, "reservation sweep failed");
                        }
                    }
                }
            }
            info!("reservation sweeper stopped");
        });

        WorkerHandle::new("reservation-sweeper", shutdown_tx, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeflow_core::{OrderId, ProductId};
    use tradeflow_events::InMemoryEventBus;
    use tradeflow_inventory::{ProductStock, ReservationLine, ReservationStatus};

    use crate::inventory_store::InMemoryInventoryStore;

    #[tokio::test]
    async fn releases_holds_past_their_ttl() {
        let product = ProductId::new();
        let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", 5)]);
        let service = Arc::new(InventoryService::new(store, Arc::new(InMemoryEventBus::new())));

        let held = service
            .reserve(
                OrderId::new(),
                vec![ReservationLine {
                    product_id: product,
                    product_name: "Widget".to_string(),
                    quantity: 2,
                }],
                None,
            )
            .await
            .unwrap();

        let sweeper = ReservationSweeper::spawn(
            service.clone(),
            Duration::from_millis(10),
            chrono::Duration::zero(),
        );
        for _ in 0..100 {
            let r = service.store().reservation(held[0].id).await.unwrap().unwrap();
            if r.status == ReservationStatus::Released {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.shutdown().await;

        let released = service.store().reservation(held[0].id).await.unwrap().unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        assert_eq!(service.store().stock(product).await.unwrap().unwrap().on_hand, 5);
    }
}
