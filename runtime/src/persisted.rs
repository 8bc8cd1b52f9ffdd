//! Event bus decorator that also writes every event to an [`EventStore`].
//!
//! Two persistence modes:
//!
//! - **Synchronous**: the event is stored (bounded by `write_timeout`) before
//!   it is dispatched.
//! - **Asynchronous**: the event is pushed onto a bounded channel drained by a
//!   background consumer, which flushes with `store_batch` every
//!   `flush_interval` or as soon as `flush_batch_size` events are buffered.
//!   When the channel is full the write falls back to a synchronous store on
//!   the caller's task, so nothing is dropped.
//!
//! Persistence failures are logged and never fail the publish.

use eventline_core::event::{Event, SharedEvent};
use eventline_core::event_bus::{EventBus, EventBusError};
use eventline_core::event_store::EventStore;
use eventline_core::handler::EventHandler;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Persistence settings for [`PersistedEventBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Write through the background consumer instead of inline.
    pub async_persistence: bool,
    /// Bound on each synchronous store call.
    pub write_timeout: Duration,
    /// Capacity of the asynchronous channel.
    pub queue_capacity: usize,
    /// Periodic flush of the asynchronous buffer.
    pub flush_interval: Duration,
    /// Buffered events that trigger an immediate flush.
    pub flush_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            async_persistence: false,
            write_timeout: Duration::from_secs(5),
            queue_capacity: 1000,
            flush_interval: Duration::from_millis(100),
            flush_batch_size: 100,
        }
    }
}

/// Bus decorator persisting every published event.
pub struct PersistedEventBus {
    inner: Arc<dyn EventBus>,
    store: Arc<dyn EventStore>,
    config: PersistenceConfig,
    sender: Option<mpsc::Sender<SharedEvent>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

impl PersistedEventBus {
    /// Wrap `inner`, persisting to `store`.
    ///
    /// Asynchronous persistence needs a Tokio runtime to host the consumer;
    /// without one the bus logs a warning and persists synchronously.
    #[must_use]
    pub fn new(
        inner: Arc<dyn EventBus>,
        store: Arc<dyn EventStore>,
        config: PersistenceConfig,
    ) -> Self {
        let token = CancellationToken::new();
        let mut sender = None;
        let mut consumer = None;

        if config.async_persistence {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                    consumer = Some(handle.spawn(run_consumer(
                        rx,
                        Arc::clone(&store),
                        config.flush_batch_size.max(1),
                        config.flush_interval,
                        token.clone(),
                    )));
                    sender = Some(tx);
                }
                Err(_) => {
                    tracing::warn!(
                        "No Tokio runtime available, falling back to synchronous persistence"
                    );
                }
            }
        }

        Self {
            inner,
            store,
            config,
            sender,
            consumer: Mutex::new(consumer),
            token,
        }
    }

    /// Stop the background consumer after it has flushed everything queued.
    ///
    /// Events published afterwards are persisted synchronously.
    pub async fn close(&self) {
        self.token.cancel();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            if let Err(err) = consumer.await {
                tracing::error!(error = %err, "Persistence consumer terminated abnormally");
            }
        }
    }

    async fn persist(&self, event: &SharedEvent) {
        if let Some(sender) = &self.sender {
            match sender.try_send(Arc::clone(event)) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        event_type = event.event_type(),
                        capacity = self.config.queue_capacity,
                        "Persistence queue full, storing synchronously"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        self.store_now(event.as_ref()).await;
    }

    async fn store_now(&self, event: &dyn Event) {
        match time::timeout(self.config.write_timeout, self.store.store(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(
                    event_type = event.event_type(),
                    error = %err,
                    "Failed to persist event"
                );
            }
            Err(_) => {
                tracing::error!(
                    event_type = event.event_type(),
                    timeout_ms = u64::try_from(self.config.write_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Timed out persisting event"
                );
            }
        }
    }
}

impl Drop for PersistedEventBus {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_consumer(
    mut rx: mpsc::Receiver<SharedEvent>,
    store: Arc<dyn EventStore>,
    batch_size: usize,
    flush_interval: Duration,
    token: CancellationToken,
) {
    let mut buffer: Vec<SharedEvent> = Vec::with_capacity(batch_size);
    let mut ticker = time::interval_at(time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(store.as_ref(), &mut buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(store.as_ref(), &mut buffer).await,
        }
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        buffer.push(event);
        if buffer.len() >= batch_size {
            flush(store.as_ref(), &mut buffer).await;
        }
    }
    flush(store.as_ref(), &mut buffer).await;
    tracing::debug!("Persistence consumer stopped");
}

async fn flush(store: &dyn EventStore, buffer: &mut Vec<SharedEvent>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(err) = store.store_batch(&batch).await {
        tracing::error!(
            batch_size = batch.len(),
            error = %err,
            "Failed to persist event batch"
        );
    }
}

impl EventBus for PersistedEventBus {
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.inner.subscribe(event_type, handler);
    }

    fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        self.inner.unsubscribe(event_type, handler_name);
    }

    fn publish(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            self.persist(&event).await;
            self.inner.publish(event).await
        })
    }

    fn publish_async(&self, event: SharedEvent) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            self.persist(&event).await;
            self.inner.publish_async(event).await
        })
    }
}
