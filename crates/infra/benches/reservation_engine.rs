use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use tradeflow_core::{EventId, OrderId, ProductId};
use tradeflow_events::ProcessedEvent;
use tradeflow_infra::inventory_store::{InMemoryInventoryStore, InventoryStore};
use tradeflow_inventory::{ProductStock, ReservationLine, StockBook, StockCommand};

fn processed(order_id: OrderId) -> ProcessedEvent {
    ProcessedEvent {
        id: uuid::Uuid::now_v7(),
        event_id: EventId::new(),
        event_type: "sales.order.confirmed".to_string(),
        order_id: Some(order_id),
        processed_at: Utc::now(),
        correlation_id: None,
        detail: None,
    }
}

fn book_with(products: &[ProductId], on_hand: i64) -> StockBook {
    let mut book = StockBook::new();
    for id in products {
        book.insert_product(ProductStock::new(*id, "Widget", on_hand));
    }
    book
}

fn reserve(order_id: OrderId, products: &[ProductId], confirm: bool) -> StockCommand {
    StockCommand::ReserveOrder {
        order_id,
        lines: products
            .iter()
            .map(|id| ReservationLine {
                product_id: *id,
                product_name: "Widget".to_string(),
                quantity: 1,
            })
            .collect(),
        correlation_id: None,
        confirm,
    }
}

/// Reserve-and-debit latency by order size, against an otherwise idle book.
fn bench_reserve_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_order");

    for lines in [1usize, 10, 50].iter() {
        let products: Vec<ProductId> = (0..*lines).map(|_| ProductId::new()).collect();
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, _| {
            b.iter_batched(
                || book_with(&products, 1_000),
                |mut book| {
                    let outcome = book
                        .execute(reserve(OrderId::new(), &products, true), Utc::now())
                        .unwrap();
                    black_box(outcome);
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Rejections must stay cheap: they compute the full shortage list.
fn bench_rejected_reserve(c: &mut Criterion) {
    let products: Vec<ProductId> = (0..10).map(|_| ProductId::new()).collect();
    let book = book_with(&products, 0);
    let lines: Vec<ReservationLine> = products
        .iter()
        .map(|id| ReservationLine {
            product_id: *id,
            product_name: "Widget".to_string(),
            quantity: 1,
        })
        .collect();

    c.bench_function("rejected_reserve_with_shortages", |b| {
        b.iter(|| {
            let mut book = book.clone();
            let order_id = OrderId::new();
            let err = book
                .execute(reserve(order_id, &products, true), Utc::now())
                .unwrap_err();
            black_box((err, book.shortages(order_id, &lines)));
        });
    });
}

/// Transactional path including the ledger insert, and the duplicate short-circuit.
fn bench_store_process(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let product = ProductId::new();
    let store = InMemoryInventoryStore::with_products([ProductStock::new(product, "Widget", i64::MAX / 2)]);

    let mut group = c.benchmark_group("store_process");
    group.bench_function("fresh_event", |b| {
        b.iter(|| {
            let order_id = OrderId::new();
            let outcome = runtime
                .block_on(store.process(
                    reserve(order_id, &[product], true),
                    Some(processed(order_id)),
                    Utc::now(),
                ))
                .unwrap();
            black_box(outcome);
        });
    });

    let order_id = OrderId::new();
    let seen = processed(order_id);
    runtime
        .block_on(store.process(reserve(order_id, &[product], true), Some(seen.clone()), Utc::now()))
        .unwrap();
    group.bench_function("duplicate_event", |b| {
        b.iter(|| {
            let outcome = runtime
                .block_on(store.process(
                    reserve(order_id, &[product], true),
                    Some(seen.clone()),
                    Utc::now(),
                ))
                .unwrap();
            black_box(outcome);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_reserve_order, bench_rejected_reserve, bench_store_process);
criterion_main!(benches);
