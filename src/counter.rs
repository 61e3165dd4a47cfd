// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use parking_lot::Mutex;

use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};

/// An up/down counter that remembers its low and high watermarks.
pub struct Counter {
    key: SeriesKey,
    state: Mutex<CounterState>,
}

#[derive(Default)]
struct CounterState {
    val: i64,
    low: Option<i64>,
    high: Option<i64>,
}

impl CounterState {
    fn set(&mut self, val: i64) {
        self.val = val;
        if self.low.map_or(true, |low| val < low) {
            self.low = Some(val);
        }
        if self.high.map_or(true, |high| high < val) {
            self.high = Some(val);
        }
    }
}

impl Counter {
    pub fn new(key: SeriesKey) -> Self {
        Counter {
            key,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Sets the counter to an absolute value.
    pub fn set(&self, val: i64) {
        self.state.lock().set(val);
    }

    /// Adds `delta` to the counter and returns the new value.
    pub fn inc(&self, delta: i64) -> i64 {
        let mut state = self.state.lock();
        let val = state.val + delta;
        state.set(val);
        val
    }

    /// Subtracts `delta` from the counter and returns the new value.
    pub fn dec(&self, delta: i64) -> i64 {
        self.inc(-delta)
    }
}

impl StatSource for Counter {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let (val, low, high) = {
            let state = self.state.lock();
            (state.val, state.low, state.high)
        };
        cb(&self.key, "high", high.map_or(f64::NAN, |v| v as f64));
        cb(&self.key, "low", low.map_or(f64::NAN, |v| v as f64));
        cb(&self.key, "val", val as f64);
    }
}
