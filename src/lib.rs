// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregate;
pub mod api;
pub mod app;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::aggregate::{AggregateRequest, Orchestrator, RequestClass};
pub use crate::api::router;
pub use crate::app::{Collaborators, Core};
pub use crate::cache::{AdaptiveCache, CacheOutcome, CacheSignature, CacheStatus};
pub use crate::config::AppConfig;
pub use crate::dedup::DedupEngine;
pub use crate::model::{Article, ArticleBatch, BatchOutcome, Lane};
pub use crate::quota::QuotaLedger;
