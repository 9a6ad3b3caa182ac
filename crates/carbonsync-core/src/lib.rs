//! carbonsync-core: Graphite archive synchronisation
//!
//! Reconciles time-series data between two carbon stores, bulk-applies
//! points to local whisper archives, and reports divergence.
//!
//! # Architecture
//!
//! ```text
//! source store ──┐                      ┌── MetricSink (TCP sender / WhisperStore)
//!                ├── Merger / Differ ───┤
//! dest store ────┘                      └── divergence report
//!
//! WhisperStore → BulkUpdater → storage schemas → whisper archive files
//! ```
//!
//! # Modules
//!
//! - `model`: points, batches, fetched series, retention metadata
//! - `codec`: dense series ⇄ sparse points
//! - `ini`, `schema`: storage-schemas / storage-aggregation parsing
//! - `whisper`: round-robin archive file format
//! - `bulk_update`: apply a batch to one metric's archive, creating it if needed
//! - `store`: store traits and the clock
//! - `local_store`, `http_store`: archive directory and carbonserver stores
//! - `sender`: text and framed protobuf encoders, TCP sender
//! - `diff`: slot-level divergence between two stores
//! - `merger`: tier-by-tier gap-fill merge
//! - `config`, `logging`, `retry`, `error`: ambient plumbing
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bulk_update;
pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod http_store;
pub mod ini;
pub mod local_store;
pub mod logging;
pub mod merger;
pub mod model;
pub mod retry;
pub mod schema;
pub mod sender;
pub mod store;
pub mod whisper;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
