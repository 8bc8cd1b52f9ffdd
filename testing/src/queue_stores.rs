//! In-memory retry and dead letter stores.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use eventline_core::queue::{DeadLetterItem, DeadLetterStore, QueueError, RetryItem, RetryStore};
use futures::future::BoxFuture;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

fn injected() -> QueueError {
    QueueError::Storage("storage failure injected".to_string())
}

fn take_page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    if limit == 0 { iter.collect() } else { iter.take(limit).collect() }
}

/// In-memory [`RetryStore`].
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    items: RwLock<Vec<RetryItem>>,
    fail: AtomicBool,
}

impl InMemoryRetryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Insert a fully formed item, bypassing upsert (for seeding `created_at`).
    pub fn insert(&self, item: RetryItem) {
        self.items.write().unwrap().push(item);
    }

    /// Snapshot of every item.
    #[must_use]
    pub fn items(&self) -> Vec<RetryItem> {
        self.items.read().unwrap().clone()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

impl RetryStore for InMemoryRetryStore {
    fn upsert(&self, item: RetryItem) -> BoxFuture<'_, Result<RetryItem, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            if let Some(existing) = items.iter_mut().find(|i| i.same_key(&item)) {
                existing.error = item.error;
                existing.attempt = item.attempt;
                existing.max_retries = item.max_retries;
                existing.next_retry = item.next_retry;
                existing.updated_at = item.updated_at;
                return Ok(existing.clone());
            }
            items.push(item.clone());
            Ok(item)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<RetryItem>, QueueError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.items.read().unwrap().iter().find(|i| i.id == id).cloned())
        })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RetryItem>, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut due: Vec<RetryItem> = self
                .items
                .read()
                .unwrap()
                .iter()
                .filter(|i| i.next_retry <= now)
                .cloned()
                .collect();
            due.sort_by_key(|i| i.next_retry);
            Ok(take_page(due, limit, 0))
        })
    }

    fn update_attempt<'a>(
        &'a self,
        id: &'a str,
        next_retry: DateTime<Utc>,
        attempt: u32,
        error: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let item = items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            item.next_retry = next_retry;
            item.attempt = attempt;
            if let Some(error) = error {
                item.error = error.to_string();
            }
            item.updated_at = now;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let len = items.len();
            items.retain(|i| i.id != id);
            Ok(items.len() != len)
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.items.read().unwrap().len() as u64)
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let len = items.len();
            items.retain(|i| i.created_at >= before);
            Ok((len - items.len()) as u64)
        })
    }
}

/// In-memory [`DeadLetterStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    items: RwLock<Vec<DeadLetterItem>>,
    fail: AtomicBool,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Insert a fully formed item (for seeding `created_at`).
    pub fn insert_item(&self, item: DeadLetterItem) {
        self.items.write().unwrap().push(item);
    }

    /// Snapshot of every item, processed ones included.
    #[must_use]
    pub fn items(&self) -> Vec<DeadLetterItem> {
        self.items.read().unwrap().clone()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn insert(&self, item: DeadLetterItem) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            self.check()?;
            self.items.write().unwrap().push(item);
            Ok(())
        })
    }

    fn list_unprocessed(
        &self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<DeadLetterItem>, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items: Vec<DeadLetterItem> = self
                .items
                .read()
                .unwrap()
                .iter()
                .filter(|i| !i.processed)
                .cloned()
                .collect();
            items.sort_by_key(|i| std::cmp::Reverse(i.created_at));
            Ok(take_page(items, limit, offset))
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DeadLetterItem>, QueueError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.items.read().unwrap().iter().find(|i| i.id == id).cloned())
        })
    }

    fn mark_processed<'a>(
        &'a self,
        id: &'a str,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let item = items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            item.processed = true;
            item.processed_at = Some(at);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let len = items.len();
            items.retain(|i| i.id != id);
            Ok(items.len() != len)
        })
    }

    fn count_unprocessed(&self) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.items.read().unwrap().iter().filter(|i| !i.processed).count() as u64)
        })
    }

    fn cleanup(&self, before: DateTime<Utc>) -> BoxFuture<'_, Result<u64, QueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut items = self.items.write().unwrap();
            let len = items.len();
            items.retain(|i| i.created_at >= before);
            Ok((len - items.len()) as u64)
        })
    }
}
