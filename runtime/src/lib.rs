//! # Eventline Runtime
//!
//! Behaviour on top of the `eventline-core` contracts.
//!
//! ## Core Components
//!
//! - **[`SimpleEventBus`]**: in-process publish/subscribe
//! - **[`PersistedEventBus`]**: writes every published event to an event store
//! - **Retry**: policies, the inline [`RetryableEventHandler`], and the deferred
//!   path ([`DeferredRetryHandler`] → [`RetryQueue`] → [`RetryWorker`] → [`DeadLetterQueue`])
//! - **Observability**: tracing, metrics and logging decorators plus [`EventMetrics`]
//! - **Configuration**: [`EventSystemConfig`] loaded from TOML
//!
//! ## Example
//!
//! ```ignore
//! use eventline_runtime::{DeferredRetryHandler, RetryWorker, SimpleEventBus};
//!
//! let bus = Arc::new(SimpleEventBus::new());
//! bus.subscribe(
//!     "order.created",
//!     Arc::new(DeferredRetryHandler::new(billing.clone(), queue.clone(), policy.clone())),
//! );
//!
//! let worker = Arc::new(
//!     RetryWorker::new(queue, bus.clone(), policy, config.retry_worker.worker_config())
//!         .with_handler(billing),
//! );
//! let handle = worker.start();
//!
//! bus.publish(event).await?;
//! // ...
//! handle.join().await;
//! ```

/// Base in-process event bus
pub mod bus;

/// TOML configuration
pub mod config;

/// Dead letter queue service
pub mod dead_letter;

/// Prometheus metrics for observability
pub mod metrics;

/// Tracing, metrics and logging decorators
pub mod observability;

/// Persisting bus decorator
pub mod persisted;

/// Retry policies and the inline retry loop
pub mod retry;

/// Deferred retry queue service
pub mod retry_queue;

/// Retry decorators for handlers and buses
pub mod retryable;

/// Background retry worker
pub mod worker;

pub use bus::SimpleEventBus;
pub use config::{ConfigError, EventSystemConfig};
pub use dead_letter::DeadLetterQueue;
pub use metrics::{EventMetrics, MetricsError, RetryOutcome};
pub use persisted::{PersistedEventBus, PersistenceConfig};
pub use retry::{ExponentialBackoff, FixedDelay, LinearBackoff, RetryPolicy, retry_with_policy};
pub use retry_queue::RetryQueue;
pub use retryable::{
    DeferredRetryHandler, RetryableEventBus, RetryableEventHandler, is_redelivering, redeliver,
};
pub use worker::{RetryWorker, RetryWorkerConfig, TickReport, WorkerHandle};
