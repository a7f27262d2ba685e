//! # Insert Rate Limiter
//!
//! Sliding-window limits on the creation of *new* counters, keyed by client
//! address (`ip`) and by the containing network (`subnet`: /16 for IPv4, /64
//! for IPv6). Increments of counters that already exist never pass through
//! here.

use crate::clock::Clock;
use crate::config::{InsertRateLimits, WindowLimit};
use crate::error::Result;
use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Tracked windows before the first sweep of idle ones.
const SWEEP_THRESHOLD: usize = 10_000;

/// Which address granularity a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Ip,
    Subnet,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Ip => write!(f, "ip"),
            LimitKind::Subnet => write!(f, "subnet"),
        }
    }
}

/// One unit to consume from the window named `(kind, key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOp {
    pub kind: LimitKind,
    pub key: String,
    pub limit: WindowLimit,
}

/// Sliding-window counter service.
pub trait SlidingWindowStore: Send + Sync {
    /// Consume one unit from every window in `ops` if all of them have budget
    /// left. A denied call consumes nothing. Returns whether it was allowed.
    fn try_acquire(&self, ops: &[LimitOp]) -> Result<bool>;
}

#[derive(Debug)]
struct Window {
    span: chrono::Duration,
    events: VecDeque<DateTime<Utc>>,
}

impl Window {
    fn trim(&mut self, now: DateTime<Utc>) {
        let horizon = now.checked_sub_signed(self.span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        while self.events.front().map_or(false, |ts| *ts <= horizon) {
            self.events.pop_front();
        }
    }
}

#[derive(Debug)]
struct WindowTable {
    windows: HashMap<(LimitKind, String), Window>,
    /// Size at which the next sweep runs
    sweep_at: usize,
}

impl WindowTable {
    /// Drop idle windows, then push the next sweep out to twice the
    /// surviving size so sweeps cost amortized `O(1)` per call.
    fn sweep(&mut self, now: DateTime<Utc>, threshold: usize) {
        self.windows.retain(|_, window| {
            window.trim(now);
            !window.events.is_empty()
        });
        self.sweep_at = threshold.max(self.windows.len().saturating_mul(2));
    }
}

/// In-process [`SlidingWindowStore`] keeping exact event timestamps.
///
/// Idle windows are swept whenever the table reaches its sweep size, which
/// doubles with the number of live windows.
pub struct LocalWindowStore {
    table: Mutex<WindowTable>,
    threshold: usize,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LocalWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWindowStore")
            .field("windows", &self.table.lock().windows.len())
            .finish()
    }
}

impl LocalWindowStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sweep_threshold(SWEEP_THRESHOLD, clock)
    }

    /// Store whose first sweep runs once `threshold` windows are tracked.
    pub fn with_sweep_threshold(threshold: usize, clock: Arc<dyn Clock>) -> Self {
        let threshold = threshold.max(1);
        LocalWindowStore {
            table: Mutex::new(WindowTable {
                windows: HashMap::new(),
                sweep_at: threshold,
            }),
            threshold,
            clock,
        }
    }

    /// Number of windows currently tracked.
    pub fn tracked(&self) -> usize {
        self.table.lock().windows.len()
    }
}

impl SlidingWindowStore for LocalWindowStore {
    fn try_acquire(&self, ops: &[LimitOp]) -> Result<bool> {
        let now = self.clock.now();
        let mut table = self.table.lock();

        if table.windows.len() >= table.sweep_at {
            table.sweep(now, self.threshold);
        }
        let windows = &mut table.windows;

        for op in ops {
            let span = chrono::Duration::from_std(op.limit.window())
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let window = windows
                .entry((op.kind, op.key.clone()))
                .or_insert_with(|| Window {
                    span,
                    events: VecDeque::new(),
                });
            window.span = span;
            window.trim(now);

            if window.events.len() >= op.limit.max_events as usize {
                log::debug!(
                    "insert limit reached for {} {} ({} in {}s)",
                    op.kind,
                    op.key,
                    op.limit.max_events,
                    op.limit.window_secs
                );
                return Ok(false);
            }
        }

        for op in ops {
            if let Some(window) = windows.get_mut(&(op.kind, op.key.clone())) {
                window.events.push_back(now);
            }
        }

        Ok(true)
    }
}

/// Containing /16 (IPv4) or /64 (IPv6) of an address, in CIDR notation.
pub fn subnet_of(ip_address: &str) -> Option<String> {
    let net = match ip_address.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new(v4, 16).ok()?.trunc()),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new(v6, 64).ok()?.trunc()),
    };
    Some(net.to_string())
}

/// Gate for creating brand-new counters.
pub struct InsertRateLimiter {
    limits: InsertRateLimits,
    store: Arc<dyn SlidingWindowStore>,
}

impl fmt::Debug for InsertRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertRateLimiter")
            .field("limits", &self.limits)
            .finish()
    }
}

impl InsertRateLimiter {
    pub fn new(limits: InsertRateLimits, store: Arc<dyn SlidingWindowStore>) -> Self {
        InsertRateLimiter { limits, store }
    }

    /// Whether a new counter may be created on behalf of `ip_address`.
    ///
    /// An empty address cannot be limited and is always admitted. An address
    /// that does not parse still gets the per-address limit, but no subnet
    /// limit.
    pub fn admit_new_counter(&self, ip_address: &str) -> Result<bool> {
        if ip_address.is_empty() {
            return Ok(true);
        }

        let mut ops = Vec::with_capacity(2);
        if let Some(limit) = self.limits.ip {
            ops.push(LimitOp {
                kind: LimitKind::Ip,
                key: ip_address.to_string(),
                limit,
            });
        }
        if let Some(limit) = self.limits.subnet {
            if let Some(subnet) = subnet_of(ip_address) {
                ops.push(LimitOp {
                    kind: LimitKind::Subnet,
                    key: subnet,
                    limit,
                });
            }
        }

        if ops.is_empty() {
            return Ok(true);
        }
        self.store.try_acquire(&ops)
    }
}
