//! Last-update table shared by the ingest path and the staleness reaper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Maps a device identity to the time of its last accepted reading.
///
/// Every operation holds the lock for the whole table, so an ingest write and
/// a reaper sweep never interleave on the same device. An entry exists from the
/// first accepted reading, even one with no known sensor field, until the
/// reaper clears the device; the last-update gauge outlives it.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    last_updates: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// Create a shareable tracker handle.
pub type SharedTracker = Arc<UpdateTracker>;

impl UpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `apply` and record `at` for `device` under a single lock.
    ///
    /// `apply` is where the caller writes the device's gauges, so a concurrent
    /// sweep sees either none of the reading or all of it.
    pub fn record_with<R>(&self, device: &str, at: DateTime<Utc>, apply: impl FnOnce() -> R) -> R {
        let mut last_updates = self.last_updates.lock();
        let result = apply();
        last_updates.insert(device.to_string(), at);
        result
    }

    /// Record `at` for `device`.
    pub fn record(&self, device: &str, at: DateTime<Utc>) {
        self.record_with(device, at, || ());
    }

    /// Remove every device silent for at least `cutoff` as of `now`.
    ///
    /// `expire` is called under the lock with the device and how long it has
    /// been silent, before its entry is dropped. Returns the removed devices.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        cutoff: Duration,
        mut expire: impl FnMut(&str, Duration),
    ) -> Vec<String> {
        let mut last_updates = self.last_updates.lock();
        let mut removed = Vec::new();

        last_updates.retain(|device, last| {
            let silence = silence_since(*last, now);
            if silence >= cutoff {
                expire(device, silence);
                removed.push(device.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Time of the last accepted reading for `device`.
    pub fn last_update(&self, device: &str) -> Option<DateTime<Utc>> {
        self.last_updates.lock().get(device).copied()
    }

    /// Tracked devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.last_updates.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn len(&self) -> usize {
        self.last_updates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_updates.lock().is_empty()
    }
}

/// Elapsed time between `last` and `now`, zero if `last` is in the future.
fn silence_since(last: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - last).to_std().unwrap_or(Duration::ZERO)
}
