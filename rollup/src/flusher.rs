//! The flush scheduler.
//!
//! Once per retention interval the scheduler runs a [`Cycle::tick`] stamped
//! with the wall clock. Ticks are run on the blocking pool and awaited, so a
//! slow sink delays the next tick rather than overlapping it.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rollup_signal::Watcher;
use rollup_window::{Cycle, Emit};
use tokio::{
    pin,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{info, warn};

/// Errors produced by [`Flusher`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A tick panicked.
    #[error("flush tick failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// Wrapper around [`std::time::SystemTimeError`].
    #[error("system clock is before the unix epoch: {0}")]
    Clock(#[from] std::time::SystemTimeError),
}

/// Seconds since the unix epoch.
///
/// # Errors
///
/// Returns an error if the system clock reads earlier than the epoch.
pub fn unix_now() -> Result<i64, Error> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    Ok(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[derive(Debug)]
/// Runs the periodic flush of a [`Cycle`].
pub struct Flusher<E> {
    cycle: Arc<Cycle<E>>,
    period: Duration,
    shutdown: Watcher,
}

impl<E> Flusher<E>
where
    E: Emit + Send + 'static,
{
    /// Create a new [`Flusher`] ticking `cycle` every `period`.
    #[must_use]
    pub fn new(cycle: Arc<Cycle<E>>, period: Duration, shutdown: Watcher) -> Self {
        Self {
            cycle,
            period,
            shutdown,
        }
    }

    /// Run [`Flusher`] to completion
    ///
    /// The first tick happens one period after start. This function returns
    /// once the shutdown signal is received. A tick in flight when the signal
    /// arrives is allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if a tick panics or the clock cannot be read.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            cycle,
            period,
            shutdown,
        } = self;

        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_wait = shutdown.recv();
        pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    info!("shutdown signal received, stopping flush scheduler");
                    return Ok(());
                }

                _ = ticks.tick() => {
                    let now = unix_now()?;
                    let cycle = Arc::clone(&cycle);
                    let started = Instant::now();
                    let report = tokio::task::spawn_blocking(move || cycle.tick(now)).await?;
                    let delta = started.elapsed();
                    if delta > period {
                        warn!("Flush took longer than the retention interval (took {delta:?})");
                    }
                    if report.failed > 0 || report.flush_failed {
                        warn!(
                            failed = report.failed,
                            emitted = report.emitted,
                            flush_failed = report.flush_failed,
                            "flush delivered partially"
                        );
                    }
                }
            }
        }
    }
}
