// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;

use crate::dist::DurationDist;
use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};

/// A thread-safe convenience wrapper around a [`DurationDist`], with
/// optional named "split" distributions for intermediate checkpoints.
pub struct Timer {
    key: SeriesKey,
    state: Mutex<TimerState>,
}

struct TimerState {
    times: DurationDist,
    splits: BTreeMap<String, DurationDist>,
}

impl Timer {
    pub fn new(key: SeriesKey) -> Self {
        let times = DurationDist::new(key.clone());
        Timer {
            key,
            state: Mutex::new(TimerState {
                times,
                splits: BTreeMap::new(),
            }),
        }
    }

    /// Starts clocking. Stop the returned [`RunningTimer`] to record.
    pub fn start(&self) -> RunningTimer<'_> {
        RunningTimer {
            start: Instant::now(),
            timer: self,
            stopped: false,
        }
    }

    /// A copy of the main distribution.
    pub fn values(&self) -> DurationDist {
        self.state.lock().times.copy()
    }

    /// A copy of the named split distribution, empty if never split.
    pub fn split_values(&self, name: &str) -> DurationDist {
        let state = self.state.lock();
        match state.splits.get(name) {
            Some(dist) => dist.copy(),
            None => DurationDist::new(self.split_key(name)),
        }
    }

    fn split_key(&self, name: &str) -> SeriesKey {
        self.key.with_tag("split", name)
    }
}

impl StatSource for Timer {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let (mut times, splits) = {
            let state = self.state.lock();
            let splits: Vec<DurationDist> =
                state.splits.values().map(DurationDist::copy).collect();
            (state.times.copy(), splits)
        };
        times.stats(cb);
        for mut split in splits {
            split.stats(cb);
        }
    }
}

/// One in-flight measurement begun by [`Timer::start`].
pub struct RunningTimer<'a> {
    start: Instant,
    timer: &'a Timer,
    stopped: bool,
}

impl RunningTimer<'_> {
    /// Time since start. Non-destructive.
    pub fn elapsed(&self) -> Duration {
        Instant::now() - self.start
    }

    /// Records the current elapsed time into the split named `name`,
    /// creating it on demand. No-op once stopped.
    pub fn split(&mut self, name: &str) -> Duration {
        let elapsed = self.elapsed();
        if !self.stopped {
            let key = self.timer.split_key(name);
            let mut state = self.timer.state.lock();
            state
                .splits
                .entry(name.to_string())
                .or_insert_with(|| DurationDist::new(key))
                .insert(elapsed);
        }
        elapsed
    }

    /// Records the elapsed time into the main distribution, exactly once;
    /// later calls only return the elapsed time.
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.elapsed();
        if !self.stopped {
            self.timer.state.lock().times.insert(elapsed);
            self.stopped = true;
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect;

    #[test]
    fn stop_records_exactly_once() {
        let t = Timer::new(SeriesKey::new("timer"));
        let mut running = t.start();
        running.stop();
        running.stop();
        running.stop();
        assert_eq!(t.values().count, 1);
    }

    #[test]
    fn splits_create_on_demand() {
        let t = Timer::new(SeriesKey::new("timer"));
        let mut running = t.start();
        running.split("fetch");
        running.split("fetch");
        running.split("decode");
        running.stop();

        assert_eq!(t.split_values("fetch").count, 2);
        assert_eq!(t.split_values("decode").count, 1);
        assert_eq!(t.split_values("missing").count, 0);
        assert_eq!(t.values().count, 1);
    }

    #[test]
    fn split_after_stop_is_ignored() {
        let t = Timer::new(SeriesKey::new("timer"));
        let mut running = t.start();
        running.stop();
        running.split("late");
        assert_eq!(t.split_values("late").count, 0);
    }

    #[test]
    fn elapsed_is_monotone_and_non_destructive() {
        let t = Timer::new(SeriesKey::new("timer"));
        let running = t.start();
        let a = running.elapsed();
        let b = running.elapsed();
        assert!(b >= a);
        assert_eq!(t.values().count, 0);
    }

    #[test]
    fn stats_cover_main_and_splits() {
        let t = Timer::new(SeriesKey::new("timer"));
        let mut running = t.start();
        running.split("phase");
        running.stop();

        let stats = collect(&t);
        assert!(stats.contains_key("timer count"));
        assert!(stats.contains_key("timer,split=phase count"));
        assert_eq!(stats["timer count"], 1.0);
        assert_eq!(stats["timer,split=phase count"], 1.0);
    }
}
