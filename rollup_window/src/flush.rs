//! The periodic flush and expiry of windows
//!
//! A [`Cycle`] is the single reader-mutator of a [`Store`]. Each
//! [`Cycle::tick`] drains the windows dirtied since the previous tick, emits
//! one [`Line`] per window and then evicts windows whose start has fallen
//! behind the expiry horizon, `now - expire`. Ticks never overlap: the emitter
//! lives behind a mutex and a tick holds it from drain to eviction. A
//! [`Cycle::drain`] at shutdown takes the same mutex, so it waits out any
//! tick in flight.
//!
//! Emission is best effort. A line the emitter refuses is reported and
//! skipped, the remaining lines are still offered and eviction happens
//! regardless. A failed flush of the emitter is reported as well. Expiry bounds memory, delivery has no say in it.
//!
//! ## Metrics
//!
//! `windows_emitted`: Lines accepted by the emitter
//! `emit_failures`: Lines or flushes refused by the emitter
//! `windows_evicted`: Windows removed by expiry
//! `windows_active`: Windows held after the most recent tick
//!

use std::sync::{Arc, Mutex, PoisonError};

use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::{
    aggregate::Mode,
    line::{Emit, Line},
    store::Store,
    window::Width,
};

/// Outcome of a single tick or drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Lines accepted by the emitter.
    pub emitted: usize,
    /// Lines the emitter refused.
    pub failed: usize,
    /// Windows removed by expiry. Always zero for a drain.
    pub evicted: usize,
    /// Whether the final flush of the emitter failed. Lines counted as
    /// emitted may not have been delivered when set.
    pub flush_failed: bool,
}

/// Drives the flush and expiry of a [`Store`].
#[derive(Debug)]
pub struct Cycle<E> {
    store: Arc<Store>,
    width: Width,
    mode: Mode,
    expire_secs: i64,
    emitter: Mutex<E>,
}

impl<E: Emit> Cycle<E> {
    /// Create a new `Cycle` reducing windows with `mode`, expiring windows
    /// that start more than `expire_secs` before the tick time and sending
    /// lines to `emitter`.
    ///
    /// An `expire_secs` smaller than the store's window width allows windows
    /// to expire before they were ever flushed. Callers are expected to
    /// reject such configuration.
    #[must_use]
    pub fn new(store: Arc<Store>, mode: Mode, expire_secs: u64, emitter: E) -> Self {
        Self {
            width: store.width(),
            store,
            mode,
            expire_secs: i64::try_from(expire_secs).unwrap_or(i64::MAX),
            emitter: Mutex::new(emitter),
        }
    }

    /// The store this cycle flushes.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The first bucket retained by a tick at `now`. Every bucket below it
    /// starts strictly before `now - expire`.
    #[must_use]
    pub fn cutoff_bucket(&self, now: i64) -> i64 {
        self.width
            .bucket_at_or_after(now.saturating_sub(self.expire_secs))
    }

    /// Flush every dirty window and evict expired ones, `now` being the
    /// current time in seconds since the unix epoch.
    pub fn tick(&self, now: i64) -> FlushReport {
        let mut emitter = self.emitter.lock().unwrap_or_else(PoisonError::into_inner);

        let mut report = self.emit_dirty(&mut *emitter);

        let cutoff = self.cutoff_bucket(now);
        report.evicted = self.store.evict_older_than(cutoff);
        counter!("windows_evicted").increment(report.evicted as u64);
        gauge!("windows_active").set(self.store.len() as f64);

        debug!(
            now,
            cutoff_bucket = cutoff,
            emitted = report.emitted,
            failed = report.failed,
            evicted = report.evicted,
            "flush cycle complete"
        );
        report
    }

    /// Final flush before shutdown: emits every dirty window and evicts
    /// nothing. Waits for any tick in flight.
    pub fn drain(&self) -> FlushReport {
        let mut emitter = self.emitter.lock().unwrap_or_else(PoisonError::into_inner);
        let report = self.emit_dirty(&mut *emitter);
        debug!(
            emitted = report.emitted,
            failed = report.failed,
            flush_failed = report.flush_failed,
            "drained accumulator"
        );
        report
    }

    fn emit_dirty(&self, emitter: &mut E) -> FlushReport {
        let mut report = FlushReport::default();

        for (key, summary) in self.store.drain_dirty() {
            let line = Line {
                value: self.mode.reduce(&summary),
                window_start: self.width.start(key.bucket),
                path: key.path,
            };
            match emitter.emit(&line) {
                Ok(()) => report.emitted += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(path = %line.path, window_start = line.window_start, "failed to emit window: {err}");
                }
            }
        }
        if let Err(err) = emitter.flush() {
            warn!("failed to flush emitter: {err}");
            counter!("emit_failures").increment(1);
            report.flush_failed = true;
        }

        counter!("windows_emitted").increment(report.emitted as u64);
        counter!("emit_failures").increment(report.failed as u64);
        report
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn cycle<E: Emit>(retention: u64, expire: u64, mode: Mode, emitter: E) -> Cycle<E> {
        let store = Arc::new(Store::new(
            Width::from_secs(retention).expect("valid width"),
        ));
        Cycle::new(store, mode, expire, emitter)
    }

    fn emitted(cycle: &Cycle<Vec<Line>>) -> Vec<Line> {
        let mut lines = cycle.emitter.lock().expect("poisoned").clone();
        lines.sort_by(|a, b| (&a.path, a.window_start).cmp(&(&b.path, b.window_start)));
        lines
    }

    /// Refuses every line whose path starts with "bad".
    #[derive(Debug, Default)]
    struct Picky {
        accepted: Vec<Line>,
        flushes: usize,
    }

    impl Emit for Picky {
        fn emit(&mut self, line: &Line) -> io::Result<()> {
            if line.path.starts_with("bad") {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"));
            }
            self.accepted.push(line.clone());
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn sum_over_two_windows() {
        let c = cycle(60, 300, Mode::Sum, Vec::new());
        c.store().add("cpu.load", 1.0, 1000);
        c.store().add("cpu.load", 2.0, 1015);
        c.store().add("cpu.load", 5.0, 1061);

        let report = c.tick(1100);
        assert_eq!(report.emitted, 2);
        assert_eq!(report.evicted, 0);

        let rendered: Vec<String> = emitted(&c).iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["cpu.load 3.0 960", "cpu.load 5.0 1020"]);
    }

    #[test]
    fn avg_window() {
        let c = cycle(60, 300, Mode::Avg, Vec::new());
        for v in [2.0, 4.0, 9.0] {
            c.store().add("lat", v, 120);
        }
        c.tick(130);
        let lines = emitted(&c);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].value, 5.0);
        assert_eq!(lines[0].window_start, 120);
    }

    #[test]
    fn unflushed_window_past_horizon_is_evicted() {
        let c = cycle(60, 300, Mode::Sum, Vec::new());
        // Flushed once, then expired.
        c.store().add("old", 1.0, 100);
        assert_eq!(c.cutoff_bucket(500), 4);
        let report = c.tick(500);
        assert_eq!(report.emitted, 1);
        assert_eq!(report.evicted, 1);
        assert!(c.store().is_empty());

        // Never flushed, still expired. Tick order is drain then evict so it
        // gets emitted first; evict directly to show dirtiness is irrelevant.
        c.store().add("old", 1.0, 100);
        assert_eq!(c.store().evict_older_than(c.cutoff_bucket(500)), 1);
        assert!(c.store().drain_dirty().is_empty());
    }

    #[test]
    fn expiry_boundary() {
        // now - expire = 1201; windows starting at 1200 and 1202 need a width
        // dividing both, so use a width of one second.
        let c = cycle(1, 300, Mode::Sum, Vec::new());
        let now = 1501;
        c.store().add("older", 1.0, now - 300 - 1);
        c.store().add("newer", 1.0, now - 300 + 1);
        let report = c.tick(now);
        assert_eq!(report.evicted, 1);
        assert_eq!(c.store().len(), 1);

        let c = cycle(60, 300, Mode::Sum, Vec::new());
        // now - expire = 1200 = 20 * 60: window 20 is retained, 19 is not.
        c.store().add("at", 1.0, 1200);
        c.store().add("before", 1.0, 1199);
        let report = c.tick(1500);
        assert_eq!(report.evicted, 1);
        assert_eq!(c.store().len(), 1);
    }

    #[test]
    fn clean_tick_emits_nothing() {
        let c = cycle(60, 300, Mode::Max, Vec::new());
        c.store().add("a", 1.0, 0);
        assert_eq!(c.tick(10).emitted, 1);
        assert_eq!(c.tick(70).emitted, 0);
        assert_eq!(emitted(&c).len(), 1);
    }

    #[test]
    fn late_samples_reemit_whole_window() {
        let c = cycle(60, 300, Mode::Sum, Vec::new());
        c.store().add("a", 1.0, 0);
        c.tick(30);
        c.store().add("a", 2.0, 59);
        c.tick(90);

        let lines = emitted(&c);
        assert_eq!(lines.len(), 2);
        let mut values: Vec<f64> = lines.iter().map(|l| l.value).collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 3.0]);
    }

    #[test]
    fn emit_failures_do_not_stop_the_cycle() {
        let c = cycle(60, 60, Mode::Sum, Picky::default());
        c.store().add("bad.one", 1.0, 0);
        c.store().add("good.one", 1.0, 0);
        c.store().add("bad.two", 1.0, 0);
        c.store().add("good.two", 1.0, 0);

        let report = c.tick(1000);
        assert_eq!(report.emitted, 2);
        assert_eq!(report.failed, 2);
        // Failed windows are evicted like any other.
        assert_eq!(report.evicted, 4);
        assert!(c.store().is_empty());

        let picky = c.emitter.lock().expect("poisoned");
        assert_eq!(picky.accepted.len(), 2);
        assert_eq!(picky.flushes, 1);
    }

    /// Accepts every line, loses them all on flush.
    #[derive(Debug, Default)]
    struct Leaky;

    impl Emit for Leaky {
        fn emit(&mut self, _line: &Line) -> io::Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"))
        }
    }

    #[test]
    fn failed_emitter_flush_is_reported() {
        let c = cycle(60, 300, Mode::Sum, Leaky);
        c.store().add("a", 1.0, 0);
        c.store().add("b", 1.0, 0);

        let report = c.tick(10);
        assert_eq!(report.emitted, 2);
        assert!(report.flush_failed);

        c.store().add("a", 1.0, 0);
        assert!(c.drain().flush_failed);

        let c = cycle(60, 300, Mode::Sum, Vec::new());
        c.store().add("a", 1.0, 0);
        assert!(!c.tick(10).flush_failed);
    }

    #[test]
    fn drain_emits_dirty_without_evicting() {
        let c = cycle(60, 300, Mode::Min, Vec::new());
        c.store().add("a", 3.0, 0);
        c.store().add("a", 1.0, 1);
        c.store().add("b", 7.0, 0);
        c.tick(10);
        c.store().add("b", 2.0, 5);

        let report = c.drain();
        assert_eq!(report.emitted, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(c.store().len(), 2);

        let lines = emitted(&c);
        let last_b = lines
            .iter()
            .filter(|l| l.path == "b")
            .map(|l| l.value)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(last_b, 2.0);
        assert!(c.drain().emitted == 0);
    }

    #[test]
    fn concurrent_writers_and_ticks_lose_nothing() {
        use std::thread;

        const WRITERS: usize = 4;
        const PER_WRITER: usize = 2_000;

        let c = Arc::new(cycle(60, 3600, Mode::Sum, Vec::new()));
        thread::scope(|scope| {
            for _ in 0..WRITERS {
                let c = Arc::clone(&c);
                scope.spawn(move || {
                    for _ in 0..PER_WRITER {
                        c.store().add("counter", 1.0, 0);
                    }
                });
            }
            let c = Arc::clone(&c);
            scope.spawn(move || {
                for _ in 0..50 {
                    c.tick(0);
                }
            });
        });
        c.drain();

        // Each emission carries the running total; the largest is the total.
        let max = emitted(&c)
            .iter()
            .map(|l| l.value)
            .fold(0.0, f64::max);
        assert_eq!(max, (WRITERS * PER_WRITER) as f64);
    }
}
