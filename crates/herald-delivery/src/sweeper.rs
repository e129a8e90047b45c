//! Fixed-interval background maintenance tasks.
//!
//! The rate limiter, template cache and dead-letter store each own a periodic
//! sweep. Every sweep is a plain tokio task that stops when the shared
//! `CancellationToken` fires, so a single shutdown call reclaims all timers.

use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawns a task that calls `tick` every `interval` until `token` is
/// cancelled.
///
/// The first tick runs one full interval after spawning. A zero interval is
/// clamped to one second.
pub fn spawn_sweeper<F, Fut>(
    name: &'static str,
    interval: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let period = if interval.is_zero() { Duration::from_secs(1) } else { interval };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(sweeper = name, interval_ms = period.as_millis() as u64, "sweeper started");

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    info!(sweeper = name, "sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    tick().await;
                }
            }
        }
    })
}
