//! Saga worker process.
//!
//! `tradeflow-worker [sales|inventory|all]` runs the event consumers of the
//! chosen service(s) against Postgres and Redis Streams until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, bail};

use tradeflow_events::RetryingPublisher;
use tradeflow_infra::config::InfraConfig;
use tradeflow_infra::db;
use tradeflow_infra::event_bus::RedisStreamsEventBus;
use tradeflow_infra::event_store::PostgresEventStore;
use tradeflow_infra::idempotency::PostgresLedger;
use tradeflow_infra::inventory_store::PostgresInventoryStore;
use tradeflow_infra::services::{
    InventoryOrderHandler, InventoryService, OrderService, SalesSagaHandler,
};
use tradeflow_infra::workers::{ConsumerConfig, EventConsumer, ReservationSweeper, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sales,
    Inventory,
    All,
}

impl Role {
    fn parse(arg: Option<&str>) -> anyhow::Result<Self> {
        match arg {
            None | Some("all") => Ok(Role::All),
            Some("sales") => Ok(Role::Sales),
            Some("inventory") => Ok(Role::Inventory),
            Some(other) => bail!("unknown role '{other}' (expected sales, inventory or all)"),
        }
    }

    fn runs_sales(self) -> bool {
        matches!(self, Role::Sales | Role::All)
    }

    fn runs_inventory(self) -> bool {
        matches!(self, Role::Inventory | Role::All)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tradeflow_observability::init();

    let role = Role::parse(std::env::args().nth(1).as_deref())?;
    let config = InfraConfig::from_env().context("invalid configuration")?;

    let pool = db::connect(&config).await.context("failed to connect to Postgres")?;
    db::ensure_schema(&pool).await.context("failed to create schema")?;

    let bus = RedisStreamsEventBus::connect(&config)
        .await
        .context("failed to connect to Redis")?;
    let publisher = Arc::new(RetryingPublisher::new(bus.clone(), config.publish_retry_policy()));
    let consumer_config = ConsumerConfig::from(&config);

    let mut workers: Vec<WorkerHandle> = Vec::new();

    if role.runs_inventory() {
        let inventory = Arc::new(InventoryService::new(
            PostgresInventoryStore::new(pool.clone()),
            publisher.clone(),
        ));
        workers.push(
            EventConsumer::spawn(
                Arc::new(InventoryOrderHandler::new(inventory.clone())),
                &bus,
                consumer_config,
            )
            .await
            .context("failed to subscribe inventory consumer")?,
        );
        workers.push(ReservationSweeper::spawn(
            inventory,
            config.sweep_interval,
            config.reservation_ttl_chrono(),
        ));
    }

    if role.runs_sales() {
        let orders = Arc::new(OrderService::new(
            PostgresEventStore::new(pool.clone()),
            publisher.clone(),
        ));
        workers.push(
            EventConsumer::spawn(
                Arc::new(SalesSagaHandler::new(orders, PostgresLedger::new(pool.clone()))),
                &bus,
                consumer_config,
            )
            .await
            .context("failed to subscribe sales consumer")?,
        );
    }

    tracing::info!(
        ?role,
        workers = ?workers.iter().map(WorkerHandle::name).collect::<Vec<_>>(),
        "tradeflow worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    for worker in workers {
        worker.shutdown().await;
    }
    pool.close().await;
    tracing::info!("tradeflow worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults_to_all() {
        assert_eq!(Role::parse(None).unwrap(), Role::All);
        assert!(Role::parse(Some("sales")).unwrap().runs_sales());
        assert!(!Role::parse(Some("sales")).unwrap().runs_inventory());
        assert!(Role::parse(Some("billing")).is_err());
    }
}
