//! `PostgreSQL` storage for Eventline.
//!
//! Implements the storage contracts of `eventline-core` on one database:
//!
//! - [`PostgresEventStore`]: the durable event log (`event_log`), with replay
//! - [`PostgresRetryStore`]: deferred retry items (`retry_queue`)
//! - [`PostgresDeadLetterStore`]: exhausted failures (`dead_letter_queue`)
//!
//! All three share one connection pool. Queries are built at runtime with
//! `sqlx::query` so the crate compiles without a live database.
//!
//! # Example
//!
//! ```ignore
//! use eventline_postgres::{PostgresDeadLetterStore, PostgresEventStore, PostgresRetryStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let events = PostgresEventStore::connect("postgres://localhost/mydb").await?;
//!     events.migrate().await?;
//!     let retries = PostgresRetryStore::new(events.pool().clone());
//!     let dead_letters = PostgresDeadLetterStore::new(events.pool().clone());
//!     Ok(())
//! }
//! ```

mod dead_letter_store;
mod event_store;
mod retry_store;
pub mod schema;

pub use dead_letter_store::PostgresDeadLetterStore;
pub use event_store::PostgresEventStore;
pub use retry_store::PostgresRetryStore;
pub use schema::run_migrations;
