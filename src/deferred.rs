//! # Deferred Updates
//!
//! Fire-and-forget execution of record and prune jobs, outside the request
//! that triggered them. Callers submit a job and never learn its outcome:
//! failures are logged and counted here, nowhere else.
//!
//! Three dispatch modes:
//! - **Background**: each job runs on the blocking pool of a Tokio runtime the
//!   caller already has (store and cache calls are synchronous)
//! - **Dedicated**: the same, on a small runtime owned by the queue, for
//!   callers without a runtime of their own
//! - **Manual**: jobs queue up until [`DeferredUpdates::drain`] runs them on
//!   the calling thread, so tests can assert on side effects

use crate::error::Result;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;

/// Blocking threads available to a dedicated runtime.
const DEDICATED_BLOCKING_THREADS: usize = 4;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Where submitted jobs run.
#[derive(Debug, Clone)]
pub enum DispatchMode {
    /// Spawn on this runtime's blocking pool
    Background(Handle),
    /// Spawn on a runtime created for and owned by the queue
    Dedicated,
    /// Hold until drained
    Manual,
}

impl DispatchMode {
    /// Background on the ambient Tokio runtime if there is one, otherwise a
    /// dedicated runtime. Never manual: that mode is only ever opted into.
    pub fn from_current_runtime() -> Self {
        match Handle::try_current() {
            Ok(handle) => DispatchMode::Background(handle),
            Err(_) => DispatchMode::Dedicated,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Deferred queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

struct QueuedJob {
    name: &'static str,
    job: Job,
}

pub struct DeferredUpdates {
    mode: DispatchMode,
    /// Where jobs are spawned; `None` in manual mode
    spawner: Option<Handle>,
    /// Runtime owned in dedicated mode
    runtime: Option<Runtime>,
    queue: Mutex<VecDeque<QueuedJob>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for DeferredUpdates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredUpdates")
            .field("mode", &self.mode)
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

fn run_job(name: &'static str, job: Job, counters: &Counters) {
    match job() {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("deferred {} job failed: {}", name, e);
        }
    }
    if counters.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
        counters.idle.notify_waiters();
    }
}

impl DeferredUpdates {
    /// Queue for `mode`. Only a dedicated runtime can fail to start.
    pub fn new(mode: DispatchMode) -> Result<Self> {
        let (spawner, runtime) = match &mode {
            DispatchMode::Background(handle) => (Some(handle.clone()), None),
            DispatchMode::Dedicated => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(DEDICATED_BLOCKING_THREADS)
                    .thread_name("usage-deferred")
                    .enable_all()
                    .build()?;
                debug!("started dedicated runtime for deferred updates");
                (Some(runtime.handle().clone()), Some(runtime))
            }
            DispatchMode::Manual => (None, None),
        };

        Ok(DeferredUpdates {
            mode,
            spawner,
            runtime,
            queue: Mutex::new(VecDeque::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn manual() -> Self {
        DeferredUpdates {
            mode: DispatchMode::Manual,
            spawner: None,
            runtime: None,
            queue: Mutex::new(VecDeque::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn background(handle: Handle) -> Self {
        DeferredUpdates {
            mode: DispatchMode::Background(handle.clone()),
            spawner: Some(handle),
            runtime: None,
            queue: Mutex::new(VecDeque::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn dedicated() -> Result<Self> {
        Self::new(DispatchMode::Dedicated)
    }

    pub fn mode(&self) -> &DispatchMode {
        &self.mode
    }

    /// Hand a job off. Never blocks on the job and never reports its result.
    pub fn submit(&self, name: &'static str, job: Job) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);

        match &self.spawner {
            Some(handle) => {
                let counters = Arc::clone(&self.counters);
                // The JoinHandle is dropped on purpose: nobody waits on it.
                handle.spawn_blocking(move || run_job(name, job, &counters));
            }
            None => {
                self.queue.lock().push_back(QueuedJob { name, job });
            }
        }
    }

    /// Run queued jobs on this thread until the queue is empty, including
    /// jobs submitted while draining. Returns how many ran.
    ///
    /// Only manual mode queues jobs; otherwise this returns 0.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(QueuedJob { name, job }) => {
                    run_job(name, job, &self.counters);
                    ran += 1;
                }
                None => break,
            }
        }
        if ran > 0 {
            debug!("drained {} deferred jobs", ran);
        }
        ran
    }

    /// Jobs waiting in the manual queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Jobs submitted but not yet finished, in any mode.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every submitted job has finished.
    ///
    /// In manual mode this drains the queue instead.
    pub async fn wait_idle(&self) {
        if self.spawner.is_none() {
            self.drain();
            return;
        }
        loop {
            // Registered before the check so a wake-up in between is not lost
            let idle = self.counters.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Blocking form of [`Self::wait_idle`] for callers outside any runtime.
    ///
    /// Inside a runtime context blocking is not allowed; the call logs and
    /// returns at once.
    pub fn flush(&self) {
        let Some(handle) = &self.spawner else {
            self.drain();
            return;
        };
        if Handle::try_current().is_ok() {
            warn!("flush called from within a runtime; use wait_idle instead");
            return;
        }
        handle.block_on(self.wait_idle());
    }

    pub fn stats(&self) -> DeferredStats {
        DeferredStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

impl Drop for DeferredUpdates {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async code.
        // Jobs still running are abandoned like any other fire-and-forget work.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UsageError;

    #[test]
    fn test_manual_jobs_wait_for_drain() {
        let deferred = DeferredUpdates::manual();
        let hits = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            deferred.submit(
                "test",
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(deferred.queued(), 3);
        assert_eq!(deferred.drain(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(
            deferred.stats(),
            DeferredStats {
                submitted: 3,
                completed: 3,
                failed: 0,
                in_flight: 0
            }
        );
    }

    #[test]
    fn test_failures_are_counted_not_raised() {
        let deferred = DeferredUpdates::manual();
        deferred.submit(
            "test",
            Box::new(|| Err(UsageError::StoreUnavailable("down".to_string()))),
        );
        deferred.submit("test", Box::new(|| Ok(())));

        assert_eq!(deferred.drain(), 2);
        let stats = deferred.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_drain_runs_jobs_submitted_while_draining() {
        let deferred = Arc::new(DeferredUpdates::manual());
        let inner = Arc::clone(&deferred);
        deferred.submit(
            "outer",
            Box::new(move || {
                inner.submit("inner", Box::new(|| Ok(())));
                Ok(())
            }),
        );

        assert_eq!(deferred.drain(), 2);
        assert_eq!(deferred.queued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_jobs_complete() {
        let deferred = DeferredUpdates::background(Handle::current());
        let hits = Arc::new(AtomicU64::new(0));

        for _ in 0..20 {
            let hits = Arc::clone(&hits);
            deferred.submit(
                "test",
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        deferred.wait_idle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 20);
        assert_eq!(deferred.stats().completed, 20);
    }

    #[test]
    fn test_default_mode_outside_runtime_is_dedicated() {
        assert!(matches!(
            DispatchMode::from_current_runtime(),
            DispatchMode::Dedicated
        ));
    }

    #[test]
    fn test_dedicated_jobs_run_without_drain() -> Result<()> {
        let deferred = DeferredUpdates::dedicated()?;
        let hits = Arc::new(AtomicU64::new(0));

        for _ in 0..50 {
            let hits = Arc::clone(&hits);
            deferred.submit(
                "test",
                Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        deferred.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 50);
        assert_eq!(deferred.queued(), 0);
        assert_eq!(deferred.drain(), 0);
        assert_eq!(deferred.stats().in_flight, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_idle_wakes_after_slow_job() {
        let deferred = DeferredUpdates::background(Handle::current());
        let done = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&done);

        deferred.submit(
            "slow",
            Box::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                flag.store(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        deferred.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(deferred.in_flight(), 0);
    }
}
