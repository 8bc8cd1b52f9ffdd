//! Order events demo
//!
//! Publishes a few orders through a persisted, instrumented bus. Billing fails
//! for a while, so its failures are parked in the retry queue and drained by
//! the background worker. One order keeps failing and lands in the dead letter
//! queue, from where it is reprocessed once billing is fixed.
//!
//! Storage is in memory unless `DATABASE_URL` points at `PostgreSQL`.
//! Configuration is read from the file named by `EVENTLINE_CONFIG`, e.g.
//! `EVENTLINE_CONFIG=demos/order-events/eventline.toml`.

use anyhow::Context;
use eventline_core::CancellationToken;
use eventline_core::event::{BaseEvent, Event, SharedEvent};
use eventline_core::event_bus::EventBus;
use eventline_core::event_store::{EventStore, SortOrder};
use eventline_core::handler::{EventHandler, FnEventHandler, HandlerError};
use eventline_core::queue::{DeadLetterStore, RetryStore};
use eventline_core::{BoxFuture, EventFilter};
use eventline_postgres::{PostgresDeadLetterStore, PostgresEventStore, PostgresRetryStore};
use eventline_runtime::observability::{
    LoggingEventBus, MetricsEventBus, MetricsEventStore, TracingEventBus,
};
use eventline_runtime::{
    DeadLetterQueue, DeferredRetryHandler, EventMetrics, EventSystemConfig, PersistedEventBus,
    RetryQueue, RetryWorker, SimpleEventBus,
};
use eventline_testing::{InMemoryDeadLetterStore, InMemoryEventStore, InMemoryRetryStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Order that billing declines until it is fixed.
const DECLINED_ORDER: &str = "o-3";

type Stores = (Arc<dyn EventStore>, Arc<dyn RetryStore>, Arc<dyn DeadLetterStore>);

/// Billing that times out on its first calls and always declines one order.
struct Billing {
    timeouts_left: AtomicU32,
    declining: AtomicBool,
}

impl Billing {
    fn new(timeouts: u32) -> Self {
        Self {
            timeouts_left: AtomicU32::new(timeouts),
            declining: AtomicBool::new(true),
        }
    }

    fn fix(&self) {
        self.declining.store(false, Ordering::SeqCst);
    }

    fn charge(&self, event: &dyn Event) -> Result<(), HandlerError> {
        let order_id = event.event_data()["order_id"].as_str().unwrap_or_default();
        if order_id == DECLINED_ORDER && self.declining.load(Ordering::SeqCst) {
            return Err(HandlerError::failed(format!("card declined for {order_id}")));
        }
        let timed_out = self
            .timeouts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if timed_out {
            return Err(HandlerError::failed("payment gateway timeout"));
        }
        tracing::info!(order_id, "Order charged");
        Ok(())
    }
}

impl EventHandler for Billing {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        let result = self.charge(event);
        Box::pin(async move { result })
    }

    fn handler_name(&self) -> &str {
        "billing"
    }

    fn supported_event_types(&self) -> Vec<String> {
        vec!["order.created".to_string()]
    }
}

fn order(n: u32) -> SharedEvent {
    Arc::new(BaseEvent::new(
        "order.created",
        serde_json::json!({ "order_id": format!("o-{n}"), "total_cents": 1000 * n }),
        "orders",
    ))
}

async fn stores(config: &EventSystemConfig) -> anyhow::Result<Stores> {
    let options = config.event_store.store_options();
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let events = PostgresEventStore::connect(&url)
            .await
            .context("connecting to PostgreSQL")?
            .with_options(options);
        events.migrate().await.context("migrating schema")?;
        let pool = events.pool().clone();
        tracing::info!("Using PostgreSQL storage");
        return Ok((
            Arc::new(events),
            Arc::new(PostgresRetryStore::new(pool.clone())),
            Arc::new(PostgresDeadLetterStore::new(pool)),
        ));
    }
    tracing::info!("Using in-memory storage");
    Ok((
        Arc::new(InMemoryEventStore::new().with_options(options)),
        Arc::new(InMemoryRetryStore::new()),
        Arc::new(InMemoryDeadLetterStore::new()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "order_events=info,eventline_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== Order Events: retry and dead letter flow ===\n");

    let config = EventSystemConfig::from_env().context("loading configuration")?;
    let metrics = Arc::new(EventMetrics::new()?);
    let policy = config.retry_policy.build();

    let (event_store, retry_store, dead_letter_store) = stores(&config).await?;
    let event_store: Arc<dyn EventStore> =
        Arc::new(MetricsEventStore::new(event_store, Arc::clone(&metrics)));
    let dead_letters = Arc::new(DeadLetterQueue::new(dead_letter_store));
    let queue = Arc::new(RetryQueue::new(
        retry_store,
        Arc::clone(&dead_letters),
        config.retry_policy.max_retries,
    ));

    let persisted = Arc::new(PersistedEventBus::new(
        Arc::new(SimpleEventBus::new()),
        Arc::clone(&event_store),
        config.event_store.persistence_config(),
    ));
    let bus: Arc<dyn EventBus> = Arc::new(TracingEventBus::new(Arc::new(LoggingEventBus::new(
        Arc::new(MetricsEventBus::new(persisted.clone(), Arc::clone(&metrics))),
    ))));

    let billing = Arc::new(Billing::new(2));
    bus.subscribe(
        "order.created",
        Arc::new(
            DeferredRetryHandler::new(billing.clone(), Arc::clone(&queue), Arc::clone(&policy))
                .with_metrics(Arc::clone(&metrics)),
        ),
    );
    bus.subscribe(
        "order.created",
        Arc::new(FnEventHandler::new("audit", ["order.created"], |event: &dyn Event| {
            tracing::info!(data = %event.event_data(), "Order audited");
            Ok(())
        })),
    );

    let worker = Arc::new(
        RetryWorker::new(
            Arc::clone(&queue),
            Arc::clone(&bus),
            policy,
            config.retry_worker.worker_config(),
        )
        .with_handler(billing.clone())
        .with_metrics(Arc::clone(&metrics)),
    );
    let handle = worker.start();

    for n in 1..=3 {
        bus.publish(order(n)).await?;
    }
    println!("Published 3 orders, {} queued for retry", queue.count().await?);

    // Wait for the worker to drain the queue
    for _ in 0..60 {
        if queue.count().await? == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    handle.shutdown();
    handle.join().await;

    let parked = dead_letters.list(0, 0).await?;
    println!("\nDead letters: {}", parked.len());
    for item in &parked {
        println!(
            "  {} {} after {} attempts: {}",
            item.id, item.handler_name, item.attempt, item.error
        );
    }

    billing.fix();
    for item in &parked {
        dead_letters.reprocess(&item.id, bus.as_ref()).await?;
    }
    println!("Dead letters after reprocessing: {}", dead_letters.count().await?);

    persisted.close().await;
    let stored = event_store
        .query(&EventFilter::new().with_event_type("order.created"), SortOrder::NewestFirst)
        .await?;
    println!("\nEvent log holds {} order events", stored.len());

    let projector = FnEventHandler::new("projector", ["order.created"], |_event: &dyn Event| Ok(()));
    let replay = event_store
        .replay_with_type("order.created", &projector, &CancellationToken::new())
        .await?;
    println!(
        "Replayed {} events ({} failed) in {:?}",
        replay.replayed_count, replay.failed_count, replay.duration
    );

    println!("\n=== Metrics ===\n{}", metrics.export_prometheus()?);
    Ok(())
}
