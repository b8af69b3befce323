// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregator;
pub mod api;
pub mod collapse;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod sources;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::aggregator::{Aggregator, UpdateReport};
pub use crate::api::create_router;
pub use crate::collapse::{collapse_events, DisplayItem, EventGroup};
pub use crate::config::AppConfig;
pub use crate::error::{SourceError, StoreError};
pub use crate::model::{EventQuery, EventRecord, SourceRecord};
pub use crate::store::{create_store, EventStore};
