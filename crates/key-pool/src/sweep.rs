//! Background cooldown sweep
//!
//! Spawns a periodic task that restores keys whose cooldown has expired and
//! publishes per-state key gauges. The task only touches in-memory state and
//! holds the pool lock for one pass over the keys per tick.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::pool::{KeyPool, PoolStatus};

/// Spawn a background task that sweeps expired cooldowns every `interval`.
///
/// Returns a `JoinHandle`; abort it on shutdown to stop the sweep.
pub fn spawn_sweep_task(pool: KeyPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            sweep_cycle(&pool);
        }
    })
}

/// Run one sweep: restore expired keys and refresh gauges.
fn sweep_cycle(pool: &KeyPool) {
    let restored = pool.sweep();
    let status = pool.status();
    if restored > 0 {
        debug!(
            restored,
            available = status.available,
            cooling_down = status.cooling_down,
            "sweep restored keys"
        );
    }
    record_gauges(&status);
}

fn record_gauges(status: &PoolStatus) {
    metrics::gauge!("keypool_keys", "state" => "available").set(status.available as f64);
    metrics::gauge!("keypool_keys", "state" => "in_use").set(status.in_use as f64);
    metrics::gauge!("keypool_keys", "state" => "cooling_down").set(status.cooling_down as f64);
}
