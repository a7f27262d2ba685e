//! # Feature Usage Counters
//!
//! Records how often each client agent uses each deprecated API feature,
//! one counter per `(day, feature, agent)`, at a bounded write rate.
//!
//! ## Architecture
//!
//! - [`engine`]: public facade and the deferred record pipeline
//! - [`sampling`]: lottery deciding how many hits an event is worth
//! - [`cache`]: recent-hit cache approximating today's totals
//! - [`limiter`]: sliding-window limits on creating new counters
//! - [`storage`]: durable counter stores (SQLite, in-memory)
//! - [`query`]: aggregated reads and default date windows
//! - [`pruner`]: batched deletion of expired counters
//! - [`deferred`]: fire-and-forget job dispatch
//!
//! ## Example
//!
//! ```no_run
//! use feature_usage::{UsageConfig, UsageEngine};
//!
//! # fn main() -> feature_usage::Result<()> {
//! let engine = UsageEngine::open(UsageConfig::default())?;
//! engine.record("legacy-continue", "bot/1.0", "192.0.2.7");
//! engine.flush();
//!
//! let (start, end) = engine.suggest_date_range()?;
//! for row in engine.enumerate("bot", start, end, None)? {
//!     println!("{} {} {}", row.date, row.feature, row.count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod pruner;
pub mod query;
pub mod sampling;
pub mod storage;
pub mod types;

pub use cache::{CacheStats, LocalHitCache, RecentHitCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, InsertRateLimits, RetentionConfig, SamplingConfig, StorageConfig, UsageConfig,
    WindowLimit,
};
pub use deferred::{DeferredStats, DeferredUpdates, DispatchMode};
pub use engine::{EngineStats, RecordOutcome, UsageEngine, UsageEngineBuilder, UsageEvent};
pub use error::{Result, UsageError};
pub use limiter::{InsertRateLimiter, LocalWindowStore, SlidingWindowStore};
pub use pruner::Pruner;
pub use query::QueryEngine;
pub use sampling::Sampler;
pub use storage::{CounterStore, MemoryCounterStore, SqliteCounterStore};
pub use types::{CounterKey, UsageReport, UsageRow};
