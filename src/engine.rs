//! # Usage Engine
//!
//! Facade over the counter store exposing the four operations external
//! collaborators use:
//! - `record`: fire-and-forget tally of one feature use
//! - `enumerate`: aggregated usage per day and feature
//! - `suggest_date_range`: default window spanning retained data
//! - `prune`: batched deletion of expired counters
//!
//! # Record pipeline
//!
//! Each event runs as a deferred job:
//! 1. Read today's approximate total from the recent-hit cache
//! 2. On a miss, read the durable counter and pin it in the cache
//! 3. A counter with no hits yet must pass the insert rate limiter
//! 4. The lottery decides how many hits the event is worth
//! 5. The cache and the durable counter are incremented atomically
//! 6. Occasionally a bounded pruning pass is queued
//!
//! No locks guard this sequence. Correctness rests on the cache increment and
//! the store upsert being atomic per key.

use crate::cache::{LocalHitCache, RecentHitCache};
use crate::clock::{Clock, SystemClock};
use crate::config::UsageConfig;
use crate::deferred::{DeferredStats, DeferredUpdates, DispatchMode};
use crate::error::{Result, UsageError};
use crate::limiter::{InsertRateLimiter, LocalWindowStore, SlidingWindowStore};
use crate::pruner::Pruner;
use crate::query::QueryEngine;
use crate::sampling::Sampler;
use crate::storage::{CounterStore, SqliteCounterStore};
use crate::types::{CounterKey, UsageReport, UsageRow};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One observed use of a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub feature: String,
    pub agent: String,
    pub ip_address: String,
    /// When the feature was used; decides which day is credited
    pub at: DateTime<Utc>,
}

/// What the record pipeline did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// `delta` hits were credited; the cache now holds `hits_today`
    Counted { delta: u64, hits_today: u64 },
    /// Lost the lottery, nothing written
    SampledOut,
    /// New counter refused by the insert rate limiter
    RateLimited,
    /// Cache or limiter errored, event dropped
    CoordinationUnavailable,
    /// Durable read or write failed, sample lost
    StoreUnavailable,
}

#[derive(Debug, Default)]
struct EngineCounters {
    events: AtomicU64,
    counted: AtomicU64,
    hits_credited: AtomicU64,
    sampled_out: AtomicU64,
    rate_limited: AtomicU64,
    coordination_errors: AtomicU64,
    store_errors: AtomicU64,
    prune_passes: AtomicU64,
    rows_pruned: AtomicU64,
}

/// Engine statistics since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events: u64,
    pub counted: u64,
    pub hits_credited: u64,
    pub sampled_out: u64,
    pub rate_limited: u64,
    pub coordination_errors: u64,
    pub store_errors: u64,
    pub prune_passes: u64,
    pub rows_pruned: u64,
    pub deferred: DeferredStats,
}

impl EngineStats {
    /// Share of received events that caused a durable write.
    pub fn write_rate(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.counted as f64 / self.events as f64
        }
    }
}

struct EngineInner {
    config: UsageConfig,
    store: Arc<dyn CounterStore>,
    cache: Arc<dyn RecentHitCache>,
    limiter: InsertRateLimiter,
    sampler: Sampler,
    clock: Arc<dyn Clock>,
    queries: QueryEngine,
    pruner: Arc<Pruner>,
    deferred: Arc<DeferredUpdates>,
    counters: Arc<EngineCounters>,
}

/// Sampled, rate-limited usage counter store.
///
/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct UsageEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for UsageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageEngine")
            .field("config", &self.inner.config)
            .field("deferred", &self.inner.deferred)
            .finish()
    }
}

impl UsageEngine {
    pub fn builder(config: UsageConfig) -> UsageEngineBuilder {
        UsageEngineBuilder::new(config)
    }

    /// Engine over the SQLite database named in `config.storage`, with
    /// in-process cache and limiter.
    pub fn open(config: UsageConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteCounterStore::open(
            &config.storage.database_path,
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?;
        info!(
            "opened usage counter store at {}",
            config.storage.database_path.display()
        );
        Self::builder(config).store(Arc::new(store)).build()
    }

    pub fn config(&self) -> &UsageConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.inner.store
    }

    // ============================================================================================
    // RECORDING
    // ============================================================================================

    /// Tally one use of `feature` by `agent` from `ip_address`.
    ///
    /// Returns immediately. The work is deferred and its outcome, including
    /// any failure, is never reported back.
    pub fn record(&self, feature: &str, agent: &str, ip_address: &str) {
        let event = UsageEvent {
            feature: feature.to_string(),
            agent: agent.to_string(),
            ip_address: ip_address.to_string(),
            at: self.inner.clock.now(),
        };
        let inner = Arc::clone(&self.inner);

        self.inner.deferred.submit(
            "record",
            Box::new(move || {
                inner.process_event(&event);
                Ok(())
            }),
        );
    }

    /// Run the record pipeline for `event` on this thread.
    pub fn process_event(&self, event: &UsageEvent) -> RecordOutcome {
        self.inner.process_event(event)
    }

    /// Run every queued deferred job (manual dispatch). Returns how many ran.
    pub fn drain(&self) -> usize {
        self.inner.deferred.drain()
    }

    /// Wait for all deferred work to finish, whatever the dispatch mode.
    pub async fn wait_idle(&self) {
        self.inner.deferred.wait_idle().await
    }

    /// Block until all deferred work has finished. For synchronous callers
    /// such as the CLI; see [`DeferredUpdates::flush`].
    pub fn flush(&self) {
        self.inner.deferred.flush()
    }

    // ============================================================================================
    // QUERIES
    // ============================================================================================

    pub fn enumerate(
        &self,
        agent: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        features: Option<&[String]>,
    ) -> Result<Vec<UsageRow>> {
        self.inner.queries.enumerate(agent, start, end, features)
    }

    pub fn suggest_date_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        self.inner.queries.suggest_date_range()
    }

    pub fn query(
        &self,
        agent: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        features: Option<&[String]>,
    ) -> Result<UsageReport> {
        self.inner.queries.query(agent, start, end, features)
    }

    // ============================================================================================
    // MAINTENANCE
    // ============================================================================================

    /// Delete expired counters. See [`Pruner::prune`].
    pub fn prune(
        &self,
        progress: Option<&mut dyn FnMut(f64)>,
        limit: Option<u64>,
    ) -> Result<u64> {
        let deleted = self.inner.pruner.prune(progress, limit)?;
        let counters = &self.inner.counters;
        counters.prune_passes.fetch_add(1, Ordering::Relaxed);
        counters.rows_pruned.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            events: c.events.load(Ordering::Relaxed),
            counted: c.counted.load(Ordering::Relaxed),
            hits_credited: c.hits_credited.load(Ordering::Relaxed),
            sampled_out: c.sampled_out.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            coordination_errors: c.coordination_errors.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            prune_passes: c.prune_passes.load(Ordering::Relaxed),
            rows_pruned: c.rows_pruned.load(Ordering::Relaxed),
            deferred: self.inner.deferred.stats(),
        }
    }
}

impl EngineInner {
    fn process_event(&self, event: &UsageEvent) -> RecordOutcome {
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        let outcome = self.run_pipeline(event);
        let c = &self.counters;
        match outcome {
            RecordOutcome::Counted { delta, .. } => {
                c.counted.fetch_add(1, Ordering::Relaxed);
                c.hits_credited.fetch_add(delta, Ordering::Relaxed);
            }
            RecordOutcome::SampledOut => {
                c.sampled_out.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::RateLimited => {
                c.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::CoordinationUnavailable => {
                c.coordination_errors.fetch_add(1, Ordering::Relaxed);
            }
            RecordOutcome::StoreUnavailable => {
                c.store_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn run_pipeline(&self, event: &UsageEvent) -> RecordOutcome {
        let key = CounterKey::new(event.at.date_naive(), &event.feature, &event.agent);
        let cache_key = key.cache_key();
        let ttl = self.config.cache.ttl();

        // Fail closed: without the cache every event would reach the store.
        let cached = match self.cache.get(&cache_key) {
            Ok(cached) => cached,
            Err(e) => {
                debug!("dropping {} event: {}", key.feature, e);
                return RecordOutcome::CoordinationUnavailable;
            }
        };

        let day_total = match cached {
            Some(hits) => hits,
            None => {
                let hits = match self.store.hits(&key) {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!("usage counter read failed for {}: {}", key.feature, e);
                        return RecordOutcome::StoreUnavailable;
                    }
                };
                if let Err(e) = self.cache.add(&cache_key, hits, ttl) {
                    debug!("dropping {} event: {}", key.feature, e);
                    return RecordOutcome::CoordinationUnavailable;
                }
                hits
            }
        };

        // A zero total means the counter does not exist yet, cached or not.
        if day_total == 0 {
            match self.limiter.admit_new_counter(&event.ip_address) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "insert limit tripped by {} for {}",
                        event.ip_address, key.feature
                    );
                    return RecordOutcome::RateLimited;
                }
                Err(e) => {
                    debug!("dropping {} event: {}", key.feature, e);
                    return RecordOutcome::CoordinationUnavailable;
                }
            }
        }

        let delta = self.sampler.decide_sample_delta(day_total);
        if delta == 0 {
            return RecordOutcome::SampledOut;
        }

        let hits_today = match self.cache.incr_with_init(&cache_key, ttl, delta, delta) {
            Ok(hits) => hits,
            Err(e) => {
                debug!("dropping {} event: {}", key.feature, e);
                return RecordOutcome::CoordinationUnavailable;
            }
        };

        if let Err(e) = self.store.upsert_add(&key, delta) {
            warn!(
                "lost {} sampled hits for {} on {}: {}",
                delta, key.feature, key.date, e
            );
            return RecordOutcome::StoreUnavailable;
        }

        if one_in(self.config.retention.purge_period) {
            self.schedule_prune();
        }

        RecordOutcome::Counted { delta, hits_today }
    }

    /// Queue one bounded pruning pass.
    fn schedule_prune(&self) {
        let pruner = Arc::clone(&self.pruner);
        let counters = Arc::clone(&self.counters);
        let batch = self.config.retention.purge_batch_size;

        self.deferred.submit(
            "prune",
            Box::new(move || {
                let deleted = pruner.prune(None, Some(batch))?;
                counters.prune_passes.fetch_add(1, Ordering::Relaxed);
                counters.rows_pruned.fetch_add(deleted, Ordering::Relaxed);
                Ok(())
            }),
        );
    }
}

/// True on average once every `period` calls.
fn one_in(period: u32) -> bool {
    period <= 1 || rand::thread_rng().gen_range(0..period) == 0
}

// ================================================================================================
// BUILDER
// ================================================================================================

/// Assembles a [`UsageEngine`] from a configuration and collaborators.
///
/// Only the counter store is mandatory. The cache and limiter default to
/// in-process implementations, the clock to wall time, the dispatch mode to
/// the ambient Tokio runtime (a dedicated one outside any runtime). Manual
/// draining is only used when asked for.
pub struct UsageEngineBuilder {
    config: UsageConfig,
    store: Option<Arc<dyn CounterStore>>,
    cache: Option<Arc<dyn RecentHitCache>>,
    windows: Option<Arc<dyn SlidingWindowStore>>,
    clock: Option<Arc<dyn Clock>>,
    seed: Option<u64>,
    dispatch: Option<DispatchMode>,
}

impl UsageEngineBuilder {
    pub fn new(config: UsageConfig) -> Self {
        UsageEngineBuilder {
            config,
            store: None,
            cache: None,
            windows: None,
            clock: None,
            seed: None,
            dispatch: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn RecentHitCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn window_store(mut self, windows: Arc<dyn SlidingWindowStore>) -> Self {
        self.windows = Some(windows);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Make the lottery deterministic.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn build(self) -> Result<UsageEngine> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| UsageError::Config("no counter store configured".to_string()))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache: Arc<dyn RecentHitCache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(LocalHitCache::with_capacity(
                self.config.cache.capacity,
                Arc::clone(&clock),
            )),
        };
        let windows: Arc<dyn SlidingWindowStore> = match self.windows {
            Some(windows) => windows,
            None => Arc::new(LocalWindowStore::new(Arc::clone(&clock))),
        };
        let sampler = match self.seed {
            Some(seed) => Sampler::seeded(self.config.sampling.clone(), seed),
            None => Sampler::new(self.config.sampling.clone()),
        };
        let dispatch = self
            .dispatch
            .unwrap_or_else(DispatchMode::from_current_runtime);

        let limiter = InsertRateLimiter::new(self.config.insert_rate_limits.clone(), windows);
        let queries = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.retention.max_age_days,
        );
        let pruner = Arc::new(Pruner::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.retention.clone(),
        ));

        Ok(UsageEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                store,
                cache,
                limiter,
                sampler,
                clock,
                queries,
                pruner,
                deferred: Arc::new(DeferredUpdates::new(dispatch)?),
                counters: Arc::new(EngineCounters::default()),
            }),
        })
    }
}
