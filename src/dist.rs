// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! The reservoir-sampled distribution backing value sources, timers, and
//! function timings.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::rng::Lcg;
use crate::series::SeriesKey;

/// Fixed capacity of every distribution's quantile reservoir.
pub const RESERVOIR_SIZE: usize = 64;

/// The quantile set presentation layers are expected to render.
pub const OBSERVED_QUANTILES: [f64; 8] = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 1.0];

static WINDOW: AtomicI64 = AtomicI64::new(0);

/// Sets the process-global reservoir window. When positive, reservoir
/// replacement is biased toward the last `window` observations; zero
/// restores uniform sampling over the full history.
pub fn set_window(window: i64) {
    WINDOW.store(window.max(0), Ordering::Relaxed);
}

/// The current reservoir window. See [`set_window`].
pub fn window() -> i64 {
    WINDOW.load(Ordering::Relaxed)
}

/// A value a [`Dist`] can aggregate. Implemented for `i64`, `f64`, and
/// `Duration`.
pub trait DistValue: Copy + PartialOrd + Default {
    fn to_f32(self) -> f32;
    fn from_f64(v: f64) -> Self;
    /// The emission form: durations surface as seconds.
    fn to_f64(self) -> f64;
    fn add(self, other: Self) -> Self;
    fn div_count(self, count: i64) -> Self;
    /// NaN gate for the float variant.
    fn accepts(self) -> bool {
        true
    }
}

impl DistValue for i64 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn add(self, other: Self) -> Self {
        self.wrapping_add(other)
    }
    fn div_count(self, count: i64) -> Self {
        self / count
    }
}

impl DistValue for f64 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn add(self, other: Self) -> Self {
        self + other
    }
    fn div_count(self, count: i64) -> Self {
        self / count as f64
    }
    fn accepts(self) -> bool {
        !self.is_nan()
    }
}

impl DistValue for Duration {
    fn to_f32(self) -> f32 {
        self.as_nanos() as f32
    }
    fn from_f64(v: f64) -> Self {
        Duration::from_nanos(if v > 0.0 { v as u64 } else { 0 })
    }
    fn to_f64(self) -> f64 {
        self.as_secs_f64()
    }
    fn add(self, other: Self) -> Self {
        self + other
    }
    fn div_count(self, count: i64) -> Self {
        Duration::from_nanos((self.as_nanos() / count as u128) as u64)
    }
}

pub type IntDist = Dist<i64>;
pub type FloatDist = Dist<f64>;
pub type DurationDist = Dist<Duration>;

/// Running aggregates plus a fixed-memory reservoir for quantile
/// estimates. Not internally synchronized; owners guard it with their own
/// mutex.
pub struct Dist<T: DistValue> {
    /// Lowest and highest values observed since construction or the last
    /// reset.
    pub low: T,
    pub high: T,
    /// The last observed value.
    pub recent: T,
    /// Number of observed values since construction or the last reset.
    pub count: i64,
    /// Exact sum of all observed values since construction or the last
    /// reset.
    pub sum: T,

    key: SeriesKey,
    reservoir: [f32; RESERVOIR_SIZE],
    rng: Lcg,
    sorted: bool,
}

impl<T: DistValue> Dist<T> {
    pub fn new(key: SeriesKey) -> Self {
        Dist {
            low: T::default(),
            high: T::default(),
            recent: T::default(),
            count: 0,
            sum: T::default(),
            key,
            reservoir: [0.0; RESERVOIR_SIZE],
            rng: Lcg::new(),
            sorted: false,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Adds a value, updating the aggregates and the reservoir.
    pub fn insert(&mut self, val: T) {
        if !val.accepts() {
            return;
        }
        if self.count != 0 {
            if val < self.low {
                self.low = val;
            }
            if val > self.high {
                self.high = val;
            }
        } else {
            self.low = val;
            self.high = val;
        }
        self.recent = val;
        self.sum = self.sum.add(val);

        let index = self.count;
        self.count += 1;

        if (index as usize) < RESERVOIR_SIZE {
            self.reservoir[index as usize] = val.to_f32();
            self.sorted = false;
        } else {
            // fast, but kind of biased. probably okay
            let window = window();
            let pool = if window > 0 {
                self.count.min(window)
            } else {
                self.count
            };
            let j = self.rng.u64() % pool as u64;
            if (j as usize) < RESERVOIR_SIZE {
                self.reservoir[j as usize] = val.to_f32();
                self.sorted = false;
            }
        }
    }

    /// The approximate value at `quantile` in `[0, 1]`.
    pub fn query(&mut self, quantile: f64) -> T {
        if quantile <= 0.0 {
            return self.low;
        }
        if quantile >= 1.0 {
            return self.high;
        }
        if self.count == 0 {
            return T::default();
        }

        let rlen = RESERVOIR_SIZE.min(self.count as usize);
        if rlen < 2 {
            return T::from_f64(self.reservoir[0] as f64);
        }

        let idx_float = quantile * (rlen - 1) as f64;
        let idx = idx_float as usize;

        let reservoir = &mut self.reservoir[..rlen];
        if !self.sorted {
            // values are never NaN here
            reservoir.sort_unstable_by(f32::total_cmp);
            self.sorted = true;
        }
        let diff = idx_float - idx as f64;
        let prior = reservoir[idx] as f64;
        T::from_f64(prior + diff * (reservoir[idx + 1] as f64 - prior))
    }

    /// The average over every inserted value.
    pub fn average(&self) -> T {
        if self.count > 0 {
            self.sum.div_count(self.count)
        } else {
            T::default()
        }
    }

    /// The average over the live reservoir prefix.
    pub fn reservoir_average(&self) -> T {
        let rlen = RESERVOIR_SIZE.min(self.count.max(0) as usize);
        if rlen == 0 {
            return T::default();
        }
        let sum: f64 = self.reservoir[..rlen].iter().map(|&v| v as f64).sum();
        T::from_f64(sum / rlen as f64)
    }

    /// Zeroes the aggregates. Resetting `count` invalidates the quantile
    /// reservoir: subsequent inserts refill it from slot zero.
    pub fn reset(&mut self) {
        self.low = T::default();
        self.high = T::default();
        self.recent = T::default();
        self.count = 0;
        self.sum = T::default();
    }

    /// A deep copy with a fresh RNG; the source's RNG state is never
    /// cloned.
    pub fn copy(&self) -> Self {
        Dist {
            low: self.low,
            high: self.high,
            recent: self.recent,
            count: self.count,
            sum: self.sum,
            key: self.key.clone(),
            reservoir: self.reservoir,
            rng: Lcg::new(),
            sorted: self.sorted,
        }
    }

    /// Emits `count`, and when non-empty the aggregate and reservoir
    /// fields in their fixed order.
    pub fn stats(&mut self, cb: &mut dyn FnMut(&SeriesKey, &str, f64)) {
        let key = self.key.clone();
        let count = self.count;
        cb(&key, "count", count as f64);
        if count > 0 {
            cb(&key, "sum", self.sum.to_f64());
            cb(&key, "min", self.low.to_f64());
            cb(&key, "avg", self.average().to_f64());
            cb(&key, "max", self.high.to_f64());
            cb(&key, "rmin", self.query(0.0).to_f64());
            cb(&key, "ravg", self.reservoir_average().to_f64());
            cb(&key, "r50", self.query(0.5).to_f64());
            cb(&key, "r90", self.query(0.9).to_f64());
            cb(&key, "rmax", self.query(1.0).to_f64());
            cb(&key, "recent", self.recent.to_f64());
        }
    }
}
