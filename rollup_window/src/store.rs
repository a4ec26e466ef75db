//! Concurrent accumulation of samples into windows
//!
//! [`Store`] maps every live [`WindowKey`] to a running [`Summary`] and a
//! dirty flag. The flag is the store's dirty set: a key is a member exactly
//! when its flag is raised, and since a window only exists once it holds a
//! sample every dirty key has a non-empty summary.
//!
//! # Concurrency
//!
//! The map is sharded. [`Store::add`] locks the one shard its key hashes to
//! for the duration of a single summary update, so writers of different keys
//! rarely contend. [`Store::drain_dirty`] visits shards one at a time and,
//! within a shard, clears flags under the same lock writers take. For any
//! single key that makes drain and add totally ordered: an add ordered before
//! the drain's visit is part of the drained summary, an add ordered after
//! raises the flag again and is picked up by the next drain. Nothing is
//! dropped on the floor.
//!
//! Drained summaries are copies. The window itself stays in the store, still
//! accumulating, until [`Store::evict_older_than`] removes it.

use std::hash::BuildHasherDefault;

use dashmap::{DashMap, mapref::entry::Entry};
use rustc_hash::FxHasher;

use crate::{
    aggregate::Summary,
    window::{Width, WindowKey},
};

#[derive(Debug, Clone, Copy)]
struct Window {
    summary: Summary,
    dirty: bool,
}

/// Shared accumulator of windowed samples.
#[derive(Debug)]
pub struct Store {
    width: Width,
    windows: DashMap<WindowKey, Window, BuildHasherDefault<FxHasher>>,
}

impl Store {
    /// Create an empty store bucketing timestamps into windows of `width`.
    #[must_use]
    pub fn new(width: Width) -> Self {
        Self {
            width,
            windows: DashMap::with_hasher(BuildHasherDefault::default()),
        }
    }

    /// The window width of this store.
    #[must_use]
    pub fn width(&self) -> Width {
        self.width
    }

    /// Record `value` for `path` at `timestamp` and mark its window dirty.
    ///
    /// Timestamps may arrive in any order and repeat freely.
    pub fn add(&self, path: &str, value: f64, timestamp: i64) {
        let key = WindowKey::new(path, timestamp, self.width);
        match self.windows.entry(key) {
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                window.summary.record(value);
                window.dirty = true;
            }
            Entry::Vacant(entry) => {
                entry.insert(Window {
                    summary: Summary::new(value),
                    dirty: true,
                });
            }
        }
    }

    /// Take every dirty window, clearing its dirty flag.
    ///
    /// Returns a copy of each dirty window's summary. The windows remain in
    /// the store.
    #[must_use]
    pub fn drain_dirty(&self) -> Vec<(WindowKey, Summary)> {
        let mut drained = Vec::new();
        for mut entry in self.windows.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                drained.push((entry.key().clone(), entry.summary));
            }
        }
        drained
    }

    /// Remove every window whose bucket is strictly less than
    /// `cutoff_bucket`, dirty or not. Returns the number of windows removed.
    pub fn evict_older_than(&self, cutoff_bucket: i64) -> usize {
        let mut evicted = 0;
        self.windows.retain(|key, _| {
            let keep = key.bucket >= cutoff_bucket;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Number of windows currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the store holds no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    #[cfg(test)]
    fn is_dirty(&self, key: &WindowKey) -> Option<bool> {
        self.windows.get(key).map(|w| w.dirty)
    }
}
