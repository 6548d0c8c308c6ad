//! Pool state machine, round-robin selection and leases
//!
//! All per-key state and the rotation cursor sit behind a single mutex. Every
//! critical section is a bounded scan over the keys with no I/O, so `acquire`
//! returns immediately with either a lease or a capacity error.
//!
//! Expired cooldowns are restored by the sweep. `acquire` and `status` run the
//! same expiry step first, so a late timer tick never hides a key that is
//! already usable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::{ErrorClass, classify};
use crate::error::{Error, Result};

/// Cooldown added per consecutive failure.
const COOLDOWN_STEP: Duration = Duration::from_secs(60);

/// Upper bound on a single cooldown.
const MAX_COOLDOWN: Duration = Duration::from_secs(300);

/// Cooldown length for the given consecutive failure count (60s, 120s, ... capped at 300s).
pub fn cooldown_for(retry_count: u32) -> Duration {
    COOLDOWN_STEP.saturating_mul(retry_count).min(MAX_COOLDOWN)
}

/// Position reported to a caller that found no free key.
///
/// `pending` is the number of callers waiting in an external queue; the pool
/// itself never queues, so it passes 0.
pub fn compute_queue_position(in_use: usize, pending: usize) -> usize {
    in_use + pending + 1
}

/// Derived status of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Available,
    InUse,
    CoolingDown,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Available => "available",
            KeyStatus::InUse => "in_use",
            KeyStatus::CoolingDown => "cooling_down",
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    in_use: bool,
    cooldown_until: Option<Instant>,
    /// Consecutive cooldowns; reset only when a cooldown expires.
    retry_count: u32,
    /// Bumped on every grant so a stale lease cannot resolve a newer one.
    lease_seq: u64,
}

impl KeyState {
    fn status(&self) -> KeyStatus {
        if self.cooldown_until.is_some() {
            KeyStatus::CoolingDown
        } else if self.in_use {
            KeyStatus::InUse
        } else {
            KeyStatus::Available
        }
    }
}

#[derive(Debug)]
struct PoolState {
    keys: Vec<KeyState>,
    last_used: Option<usize>,
}

impl PoolState {
    fn new(len: usize) -> Self {
        Self {
            keys: (0..len).map(|_| KeyState::default()).collect(),
            last_used: None,
        }
    }

    /// Pick the next key to lease, without mutating anything.
    ///
    /// Probes `available.len()` slots starting right after the last used key;
    /// if none of those slots is free, falls back to the lowest free index.
    fn select(&self) -> Option<usize> {
        let n = self.keys.len();
        let available: Vec<usize> = (0..n)
            .filter(|&i| self.keys[i].status() == KeyStatus::Available)
            .collect();
        let lowest = *available.first()?;
        let start = self.last_used.map_or(0, |i| (i + 1) % n);

        let probed = (0..available.len())
            .map(|offset| (start + offset) % n)
            .find(|idx| available.contains(idx));
        Some(probed.unwrap_or(lowest))
    }

    /// Mark `idx` leased and return the sequence number the lease must present.
    fn grant(&mut self, idx: usize) -> u64 {
        let key = &mut self.keys[idx];
        key.in_use = true;
        key.lease_seq += 1;
        let seq = key.lease_seq;
        self.last_used = Some(idx);
        seq
    }

    /// Put `idx` into cooldown, clearing its lease. Returns the cooldown applied
    /// and the new consecutive failure count.
    fn penalize(&mut self, idx: usize, now: Instant) -> (Duration, u32) {
        let key = &mut self.keys[idx];
        key.in_use = false;
        key.retry_count += 1;
        let cooldown = cooldown_for(key.retry_count);
        key.cooldown_until = Some(now + cooldown);
        (cooldown, key.retry_count)
    }

    /// Restore every key whose cooldown has passed. Returns the restored indices.
    fn expire_cooldowns(&mut self, now: Instant) -> Vec<usize> {
        let mut restored = Vec::new();
        for (idx, key) in self.keys.iter_mut().enumerate() {
            if key.cooldown_until.is_some_and(|until| now >= until) {
                key.cooldown_until = None;
                key.retry_count = 0;
                restored.push(idx);
            }
        }
        restored
    }

    fn in_use_count(&self) -> usize {
        self.keys.iter().filter(|k| k.in_use).count()
    }
}

/// Outcome of resolving a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Key returned to the pool immediately.
    Released,
    /// Key quarantined until its cooldown expires.
    CooledDown {
        class: ErrorClass,
        cooldown: Duration,
        retry_count: u32,
    },
    /// The lease no longer held its key; nothing changed.
    Stale,
}

/// Overall pool health for the health endpoint.
///
/// Leased keys count as healthy; only cooldowns degrade the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    /// No key is cooling down
    Healthy,
    /// Some keys are cooling down
    Degraded,
    /// Every key is cooling down, or none is configured
    Unhealthy,
}

/// Per-key entry of a status snapshot. Never carries the key itself.
#[derive(Debug, Clone, Serialize)]
pub struct KeyReport {
    pub index: usize,
    pub status: KeyStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
}

/// Consistent snapshot of the pool, taken under the lock.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub status: PoolHealth,
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub cooling_down: usize,
    pub keys: Vec<KeyReport>,
}

struct Shared {
    keys: Vec<Secret<String>>,
    state: Mutex<PoolState>,
}

impl Shared {
    /// Resolve the lease `(idx, seq)`. `class == None` is a plain release.
    fn resolve(&self, idx: usize, seq: u64, class: Option<ErrorClass>) -> Resolution {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = &mut state.keys[idx];
        if !key.in_use || key.lease_seq != seq {
            warn!(key_index = idx, "ignoring resolution of a lease that no longer holds its key");
            return Resolution::Stale;
        }

        match class {
            Some(class) if class.is_penalizing() => {
                let (cooldown, retry_count) = state.penalize(idx, now);
                drop(state);
                info!(
                    key_index = idx,
                    reason = class.label(),
                    cooldown_secs = cooldown.as_secs(),
                    retry_count,
                    "key entering cooldown"
                );
                metrics::counter!("keypool_cooldowns_total", "reason" => class.label())
                    .increment(1);
                Resolution::CooledDown {
                    class,
                    cooldown,
                    retry_count,
                }
            }
            _ => {
                key.in_use = false;
                drop(state);
                debug!(key_index = idx, "key released");
                Resolution::Released
            }
        }
    }
}

/// Pool of upstream API keys.
///
/// Cheap to clone: every clone is a handle to the same pool. Construct it once
/// at startup and pass it to whatever issues leases.
#[derive(Clone)]
pub struct KeyPool {
    shared: Arc<Shared>,
}

impl KeyPool {
    /// Create a pool over `keys`, all starting as Available.
    ///
    /// Duplicates are dropped keeping the first occurrence, so indices follow
    /// the configured order. An empty list is allowed; `acquire` then always
    /// returns `NoCredentialsConfigured`.
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        let mut unique: Vec<Secret<String>> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }

        if unique.is_empty() {
            warn!("key pool initialized without any API keys");
        } else {
            info!(keys = unique.len(), "key pool initialized");
        }

        let state = PoolState::new(unique.len());
        Self {
            shared: Arc::new(Shared {
                keys: unique,
                state: Mutex::new(state),
            }),
        }
    }

    /// Number of configured keys.
    pub fn len(&self) -> usize {
        self.shared.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.keys.is_empty()
    }

    /// Lease the next available key.
    ///
    /// Never waits. Returns `AtCapacity` with a queue position when every key
    /// is leased or cooling down, and `NoCredentialsConfigured` when the pool
    /// has no keys at all.
    pub fn acquire(&self) -> Result<Lease> {
        if self.is_empty() {
            metrics::counter!("keypool_acquire_total", "outcome" => "no_keys").increment(1);
            return Err(Error::NoCredentialsConfigured);
        }

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let restored = state.expire_cooldowns(now);

        let granted = state.select().map(|idx| (idx, state.grant(idx)));
        let in_use = state.in_use_count();
        drop(state);

        log_restored(&restored);

        match granted {
            Some((index, seq)) => {
                debug!(key_index = index, in_use, "lease granted");
                metrics::counter!("keypool_acquire_total", "outcome" => "granted").increment(1);
                Ok(Lease {
                    shared: Arc::clone(&self.shared),
                    index,
                    seq,
                    resolved: false,
                })
            }
            None => {
                let queue_position = compute_queue_position(in_use, 0);
                debug!(in_use, queue_position, "no key available");
                metrics::counter!("keypool_acquire_total", "outcome" => "at_capacity")
                    .increment(1);
                Err(Error::at_capacity(queue_position))
            }
        }
    }

    /// Restore keys whose cooldown has expired. Returns how many were restored.
    pub fn sweep(&self) -> usize {
        let restored = self.shared.state.lock().expire_cooldowns(Instant::now());
        log_restored(&restored);
        restored.len()
    }

    /// Snapshot of pool counts and per-key state.
    pub fn status(&self) -> PoolStatus {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let restored = state.expire_cooldowns(now);

        let keys: Vec<KeyReport> = state
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| KeyReport {
                index,
                status: key.status(),
                retry_count: key.retry_count,
                cooldown_remaining_secs: key
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now).as_secs()),
            })
            .collect();
        drop(state);

        log_restored(&restored);

        let count = |status: KeyStatus| keys.iter().filter(|k| k.status == status).count();
        let total = keys.len();
        let cooling_down = count(KeyStatus::CoolingDown);
        let pool_health = if total == 0 || cooling_down == total {
            PoolHealth::Unhealthy
        } else if cooling_down > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        };

        PoolStatus {
            status: pool_health,
            total,
            available: count(KeyStatus::Available),
            in_use: count(KeyStatus::InUse),
            cooling_down,
            keys,
        }
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool").field("keys", &self.len()).finish()
    }
}

fn log_restored(restored: &[usize]) {
    for idx in restored {
        info!(key_index = idx, "cooldown expired, key available again");
    }
}

/// Exclusive claim on one key until released or errored.
///
/// Resolve it with [`release`](Lease::release) or
/// [`report_error`](Lease::report_error). A lease dropped unresolved (cancelled
/// request, panic) returns its key to the pool and logs a warning.
pub struct Lease {
    shared: Arc<Shared>,
    index: usize,
    seq: u64,
    resolved: bool,
}

impl Lease {
    /// Index of the leased key, safe to log.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The key value to send upstream.
    pub fn credential(&self) -> &str {
        self.shared.keys[self.index].expose()
    }

    /// Return the key to the pool after a successful or benign call.
    pub fn release(mut self) {
        self.resolved = true;
        self.shared.resolve(self.index, self.seq, None);
    }

    /// Resolve the lease with the upstream failure it produced.
    ///
    /// Rate-limit and auth failures put the key into cooldown; anything else
    /// behaves exactly like [`release`](Lease::release).
    pub fn report_error(mut self, status: u16, message: &str) -> Resolution {
        self.resolved = true;
        let class = classify(status, message);
        self.shared.resolve(self.index, self.seq, Some(class))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(key_index = self.index, "lease dropped without release, returning key to pool");
            self.shared.resolve(self.index, self.seq, None);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("index", &self.index)
            .field("seq", &self.seq)
            .finish()
    }
}
