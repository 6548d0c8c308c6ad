//! API key pool for rate-limited upstream credentials
//!
//! Hands out at most one lease per key at a time, rotates round-robin across
//! keys, and quarantines keys that trip rate-limit or auth errors. The pool
//! never queues: when every key is busy or cooling down, `acquire` fails fast
//! with a queue position the HTTP layer can show to the user.
//!
//! Key lifecycle:
//! 1. Keys are loaded once at startup, all `Available`
//! 2. `acquire` picks the next available key round-robin → `InUse`
//! 3. `Lease::release` (or a non-penalizing error) → `Available`
//! 4. 429 / auth failure → `CoolingDown` for 60s × consecutive failures, capped at 300s
//! 5. Background sweep restores expired cooldowns and resets the backoff

pub mod classify;
pub mod error;
pub mod pool;
pub mod sweep;

pub use classify::{ErrorClass, classify};
pub use error::{Error, Result};
pub use pool::{
    KeyPool, KeyReport, KeyStatus, Lease, PoolHealth, PoolStatus, Resolution,
    compute_queue_position, cooldown_for,
};
pub use sweep::spawn_sweep_task;
