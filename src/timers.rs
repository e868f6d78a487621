//! Thread-safe named interval accumulator (spec §3), used to time the
//! user-function call and other notable intervals, then merged across
//! workers for reporting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// One recorded `(start, end)` interval, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64((self.end - self.start).max(0.0))
    }
}

fn now_epoch_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// An RAII guard returned by [`TimerMap::start`]; recording the interval
/// happens on drop so callers can't forget to stop a timer.
pub struct TimerGuard<'a> {
    map: &'a TimerMap,
    name: String,
    wall_start: Instant,
    epoch_start: f64,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.wall_start.elapsed().as_secs_f64();
        self.map.record(&self.name, Interval {
            start: self.epoch_start,
            end: self.epoch_start + elapsed,
        });
    }
}

/// Thread-safe map of interval name to the list of intervals recorded
/// under it.
#[derive(Debug, Default)]
pub struct TimerMap {
    inner: Mutex<BTreeMap<String, Vec<Interval>>>,
}

impl TimerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing `name`; the interval is recorded when the returned
    /// guard is dropped.
    pub fn start(&self, name: impl Into<String>) -> TimerGuard<'_> {
        TimerGuard {
            map: self,
            name: name.into(),
            wall_start: Instant::now(),
            epoch_start: now_epoch_secs(),
        }
    }

    pub fn record(&self, name: &str, interval: Interval) {
        self.inner.lock().unwrap().entry(name.to_string()).or_default().push(interval);
    }

    pub fn total(&self, name: &str) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .get(name)
            .map(|intervals| intervals.iter().map(Interval::duration).sum())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Merge another worker's timers into this one (used when collecting
    /// per-worker timers into the driver's outbound queue, spec §4.5).
    pub fn merge(&self, other: &TimerMap) {
        let other_inner = other.inner.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        for (name, intervals) in other_inner.iter() {
            inner.entry(name.clone()).or_default().extend(intervals.iter().copied());
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<Interval>> {
        self.inner.lock().unwrap().clone()
    }

    /// Rebuild a `TimerMap` from a snapshot received over the wire from a
    /// remote worker.
    pub fn from_snapshot(snapshot: BTreeMap<String, Vec<Interval>>) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_records_on_drop() {
        let timers = TimerMap::new();
        {
            let _g = timers.start("read");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(timers.total("read") >= Duration::from_millis(5));
    }

    #[test]
    fn merge_combines_intervals() {
        let a = TimerMap::new();
        let b = TimerMap::new();
        a.record("compute", Interval { start: 0.0, end: 1.0 });
        b.record("compute", Interval { start: 1.0, end: 1.5 });
        a.merge(&b);
        assert_eq!(a.total("compute"), Duration::from_secs_f64(1.5));
    }
}
