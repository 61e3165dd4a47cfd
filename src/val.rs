// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Thread-safe value sources built on [`Dist`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::dist::{Dist, DistValue};
use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource, StructStats};

/// How many observations a [`StructVal`] ring retains.
pub const STRUCT_VAL_OBSERVATIONS: usize = 10;

macro_rules! value_dist {
    ($(#[$doc:meta])* $name:ident, $ty:ty) => {
        $(#[$doc])*
        pub struct $name {
            dist: Mutex<Dist<$ty>>,
        }

        impl $name {
            pub fn new(key: SeriesKey) -> Self {
                $name {
                    dist: Mutex::new(Dist::new(key)),
                }
            }

            /// Adds a value to the distribution.
            pub fn observe(&self, val: $ty) {
                self.dist.lock().insert(val);
            }

            /// The approximate value at `quantile` in `[0, 1]`.
            pub fn quantile(&self, quantile: f64) -> $ty {
                self.dist.lock().query(quantile)
            }

            /// A copy of the backing distribution.
            pub fn dist(&self) -> Dist<$ty> {
                self.dist.lock().copy()
            }
        }

        // The reservoir-quantile fields stay private to the raw
        // distribution; value sources expose the aggregates only.
        impl StatSource for $name {
            fn stats(&self, cb: &mut StatCb<'_>) {
                let (key, avg, count, max, min, recent, sum) = {
                    let dist = self.dist.lock();
                    (
                        dist.key().clone(),
                        dist.average().to_f64(),
                        dist.count as f64,
                        dist.high.to_f64(),
                        dist.low.to_f64(),
                        dist.recent.to_f64(),
                        dist.sum.to_f64(),
                    )
                };
                cb(&key, "avg", avg);
                cb(&key, "count", count);
                cb(&key, "max", max);
                cb(&key, "min", min);
                cb(&key, "recent", recent);
                cb(&key, "sum", sum);
            }
        }
    };
}

value_dist!(
    /// A thread-safe distribution of `i64` observations.
    IntVal,
    i64
);
value_dist!(
    /// A thread-safe distribution of `f64` observations. NaN observations
    /// are dropped.
    FloatVal,
    f64
);
value_dist!(
    /// A thread-safe distribution of durations.
    DurationVal,
    Duration
);

/// Tracks a boolean disposition with two atomic counters.
pub struct BoolVal {
    key: SeriesKey,
    trues: AtomicI64,
    falses: AtomicI64,
}

impl BoolVal {
    pub fn new(key: SeriesKey) -> Self {
        BoolVal {
            key,
            trues: AtomicI64::new(0),
            falses: AtomicI64::new(0),
        }
    }

    pub fn observe(&self, val: bool) {
        if val {
            self.trues.fetch_add(1, Ordering::Relaxed);
        } else {
            self.falses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl StatSource for BoolVal {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let trues = self.trues.load(Ordering::Relaxed);
        let falses = self.falses.load(Ordering::Relaxed);
        cb(&self.key, "disposition", (trues - falses) as f64);
        cb(&self.key, "false", falses as f64);
        cb(&self.key, "true", trues as f64);
    }
}

/// An observation a [`StructVal`] can hold: scalar fields plus a debug
/// rendering for presentation.
pub trait StructObservation: StructStats + fmt::Debug + Send + Sync {}

impl<T: StructStats + fmt::Debug + Send + Sync> StructObservation for T {}

/// A bounded ring of the most recent observations of a user struct. Stats
/// surface the newest observation's scalar fields; the full ring is
/// available debug-formatted through [`StructVal::recent`].
pub struct StructVal {
    key: SeriesKey,
    ring: Mutex<VecDeque<Box<dyn StructObservation>>>,
}

impl StructVal {
    pub fn new(key: SeriesKey) -> Self {
        StructVal {
            key,
            ring: Mutex::new(VecDeque::with_capacity(STRUCT_VAL_OBSERVATIONS)),
        }
    }

    pub fn observe(&self, val: impl StructObservation + 'static) {
        let mut ring = self.ring.lock();
        if ring.len() == STRUCT_VAL_OBSERVATIONS {
            ring.pop_front();
        }
        ring.push_back(Box::new(val));
    }

    /// The retained observations, newest first.
    pub fn recent(&self) -> Vec<String> {
        let ring = self.ring.lock();
        ring.iter().rev().map(|obs| format!("{:?}", obs)).collect()
    }
}

impl StatSource for StructVal {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let mut fields = Vec::new();
        {
            let ring = self.ring.lock();
            if let Some(newest) = ring.back() {
                newest.struct_stats(&mut |name, val| fields.push((name.to_string(), val)));
            }
        }
        for (name, val) in fields {
            cb(&self.key, &name, val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect;

    #[test]
    fn int_val_emits_exactly_the_aggregate_fields() {
        let v = IntVal::new(SeriesKey::new("int_val").with_tag("name", "x"));
        v.observe(2);
        v.observe(8);
        let stats = collect(&v);
        let keys: Vec<&str> = stats.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "int_val,name=x avg",
                "int_val,name=x count",
                "int_val,name=x max",
                "int_val,name=x min",
                "int_val,name=x recent",
                "int_val,name=x sum",
            ]
        );
        assert_eq!(stats["int_val,name=x count"], 2.0);
        assert_eq!(stats["int_val,name=x sum"], 10.0);
        assert_eq!(stats["int_val,name=x min"], 2.0);
        assert_eq!(stats["int_val,name=x max"], 8.0);
        assert_eq!(stats["int_val,name=x avg"], 5.0);
        assert_eq!(stats["int_val,name=x recent"], 8.0);
    }

    #[test]
    fn float_val_quantile_and_nan() {
        let v = FloatVal::new(SeriesKey::new("float_val"));
        for x in [1.0, 2.0, 3.0] {
            v.observe(x);
        }
        v.observe(f64::NAN);
        assert_eq!(v.quantile(0.0), 1.0);
        assert_eq!(v.quantile(1.0), 3.0);
        assert_eq!(collect(&v)["float_val count"], 3.0);
    }

    #[test]
    fn duration_val_observes() {
        let v = DurationVal::new(SeriesKey::new("duration_val"));
        v.observe(Duration::from_millis(250));
        v.observe(Duration::from_millis(750));
        let stats = collect(&v);
        assert_eq!(stats["duration_val count"], 2.0);
        assert_eq!(stats["duration_val sum"], 1.0);
        assert_eq!(stats["duration_val recent"], 0.75);
    }

    #[test]
    fn bool_val_disposition() {
        let v = BoolVal::new(SeriesKey::new("bool_val"));
        v.observe(true);
        v.observe(true);
        v.observe(false);
        let stats = collect(&v);
        assert_eq!(stats["bool_val disposition"], 1.0);
        assert_eq!(stats["bool_val true"], 2.0);
        assert_eq!(stats["bool_val false"], 1.0);
    }

    #[derive(Debug)]
    struct QueueDepth {
        depth: i64,
    }

    impl StructStats for QueueDepth {
        fn struct_stats(&self, cb: &mut dyn FnMut(&str, f64)) {
            cb("depth", self.depth as f64);
        }
    }

    #[test]
    fn struct_val_keeps_newest() {
        let v = StructVal::new(SeriesKey::new("struct_val"));
        for depth in 0..25i64 {
            v.observe(QueueDepth { depth });
        }
        let stats = collect(&v);
        assert_eq!(stats["struct_val depth"], 24.0);

        let recent = v.recent();
        assert_eq!(recent.len(), STRUCT_VAL_OBSERVATIONS);
        assert!(recent[0].contains("24"));
    }

    #[test]
    fn struct_val_empty_emits_nothing() {
        let v = StructVal::new(SeriesKey::new("struct_val"));
        assert!(collect(&v).is_empty());
    }
}
