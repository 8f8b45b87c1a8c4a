//! Rolling rate history.
//!
//! One document, one entry per calendar day, one observation per bank
//! within a day. Only `HistoryStore` writes the file.

mod dataset;
mod lock;
mod store;

pub use dataset::{DailyEntry, HistoryDataset, MergeSummary, Upsert};
pub use lock::STALE_AFTER;
pub use store::HistoryStore;

/// Days kept in the rolling window.
pub const DEFAULT_RETENTION_DAYS: usize = 15;
