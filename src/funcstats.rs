// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Per-function counters and timing distributions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;

use crate::dist::DurationDist;
use crate::func::{Func, SpanError};
use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};

const PARENT_UNSET: i64 = i64::MIN;
const PARENT_ROOT: i64 = -1;

/// Invocation statistics for one function: live concurrency, high-water
/// concurrency, success/failure timings, error classes, panics, and the
/// set of observed callers.
///
/// Usable standalone through [`FuncStats::observe`]; the span machinery
/// drives it through its owning [`Func`].
pub struct FuncStats {
    current: AtomicI64,
    highwater: AtomicI64,
    // id of the first observed parent; lets the common single-caller case
    // skip the mutex entirely
    first_parent: AtomicI64,
    key: SeriesKey,
    data: Mutex<FuncData>,
}

struct FuncData {
    parents: HashMap<i64, Option<Arc<Func>>>,
    errors: BTreeMap<String, i64>,
    panics: i64,
    success_times: DurationDist,
    failure_times: DurationDist,
}

impl FuncStats {
    pub fn new(key: SeriesKey) -> Self {
        let times_key = key.with_measurement("function_times");
        FuncStats {
            current: AtomicI64::new(0),
            highwater: AtomicI64::new(0),
            first_parent: AtomicI64::new(PARENT_UNSET),
            data: Mutex::new(FuncData {
                parents: HashMap::new(),
                errors: BTreeMap::new(),
                panics: 0,
                success_times: DurationDist::new(times_key.with_tag("kind", "success")),
                failure_times: DurationDist::new(times_key.with_tag("kind", "failure")),
            }),
            key,
        }
    }

    pub(crate) fn start(&self, parent: Option<&Arc<Func>>) {
        self.add_parent(parent);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let highwater = self.highwater.load(Ordering::SeqCst);
            if current <= highwater
                || self
                    .highwater
                    .compare_exchange(highwater, current, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                break;
            }
        }
    }

    fn add_parent(&self, parent: Option<&Arc<Func>>) {
        let parent_id = parent.map_or(PARENT_ROOT, |f| f.id());
        if self.first_parent.load(Ordering::Acquire) == parent_id {
            return;
        }
        if self
            .first_parent
            .compare_exchange(
                PARENT_UNSET,
                parent_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.data.lock().parents.insert(parent_id, parent.cloned());
            return;
        }
        let mut data = self.data.lock();
        if !data.parents.contains_key(&parent_id) {
            data.parents.insert(parent_id, parent.cloned());
        }
    }

    pub(crate) fn end(&self, err: Option<&SpanError>, panicked: bool, duration: Duration) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        let mut data = self.data.lock();
        if panicked {
            data.panics += 1;
            data.failure_times.insert(duration);
            return;
        }
        match err {
            None => data.success_times.insert(duration),
            Some(err) => {
                data.failure_times.insert(duration);
                *data.errors.entry(err.class().to_string()).or_insert(0) += 1;
            }
        }
    }

    /// Instruments a call without any span machinery: clocks from now
    /// until the guard finishes (or unwinds) and records the outcome.
    pub fn observe(&self) -> ObservedCall<'_> {
        self.start(None);
        ObservedCall {
            stats: self,
            start: Instant::now(),
            finished: false,
        }
    }

    /// Number of callers currently inside the function.
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Largest concurrent depth ever observed.
    pub fn highwater(&self) -> i64 {
        self.highwater.load(Ordering::SeqCst)
    }

    /// Number of successful completions.
    pub fn success(&self) -> i64 {
        self.data.lock().success_times.count
    }

    /// Number of panicked completions.
    pub fn panics(&self) -> i64 {
        self.data.lock().panics
    }

    /// Completion counts per error class.
    pub fn errors(&self) -> BTreeMap<String, i64> {
        self.data.lock().errors.clone()
    }

    /// Calls `cb` once per distinct observed caller; `None` stands for
    /// invocations at a trace root.
    pub fn parents(&self, cb: &mut dyn FnMut(Option<&Arc<Func>>)) {
        let parents: Vec<Option<Arc<Func>>> = {
            let data = self.data.lock();
            let mut parents: Vec<_> = data.parents.iter().collect();
            parents.sort_by_key(|(id, _)| **id);
            parents.into_iter().map(|(_, f)| f.clone()).collect()
        };
        for parent in &parents {
            cb(parent.as_ref());
        }
    }

    /// A copy of the success timing distribution.
    pub fn success_times(&self) -> DurationDist {
        self.data.lock().success_times.copy()
    }

    /// A copy of the failure timing distribution.
    pub fn failure_times(&self) -> DurationDist {
        self.data.lock().failure_times.copy()
    }
}

impl StatSource for FuncStats {
    fn stats(&self, cb: &mut StatCb<'_>) {
        cb(&self.key, "current", self.current() as f64);
        let (errors, panics, mut success_times, mut failure_times) = {
            let data = self.data.lock();
            (
                data.errors.clone(),
                data.panics,
                data.success_times.copy(),
                data.failure_times.copy(),
            )
        };
        for (class, count) in &errors {
            cb(&self.key.with_tag("class", class), "errors", *count as f64);
        }
        cb(&self.key, "highwater", self.highwater() as f64);
        cb(&self.key, "panics", panics as f64);
        cb(&self.key, "success", success_times.count as f64);
        success_times.stats(cb);
        failure_times.stats(cb);
    }
}

/// Guard returned by [`FuncStats::observe`].
#[must_use]
pub struct ObservedCall<'a> {
    stats: &'a FuncStats,
    start: Instant,
    finished: bool,
}

impl ObservedCall<'_> {
    /// Completes the observation with an explicit outcome.
    pub fn finish(mut self, err: Option<&(dyn std::error::Error + 'static)>) {
        self.finished = true;
        let captured = err.map(SpanError::capture);
        self.stats
            .end(captured.as_ref(), false, Instant::now() - self.start);
    }

    /// Completes the observation as a success.
    pub fn success(self) {
        self.finish(None)
    }
}

impl Drop for ObservedCall<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stats
                .end(None, std::thread::panicking(), Instant::now() - self.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::collect;

    fn stats() -> FuncStats {
        FuncStats::new(SeriesKey::new("function").with_tag("name", "f"))
    }

    #[test]
    fn quiescent_after_concurrent_calls() {
        let stats = Arc::new(stats());
        let threads: i64 = 16;
        let wg = crossbeam::sync::WaitGroup::new();
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let stats = stats.clone();
                let wg = wg.clone();
                std::thread::spawn(move || {
                    stats.start(None);
                    // hold until everyone is inside
                    drop(wg);
                    while stats.current() < threads {
                        std::thread::yield_now();
                    }
                    stats.end(None, false, Duration::from_millis(1));
                })
            })
            .collect();
        wg.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.current(), 0);
        assert_eq!(stats.highwater(), threads);
        assert_eq!(stats.success(), threads);
    }

    #[test]
    fn outcomes_route_to_the_right_dist() {
        let stats = stats();
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let captured = SpanError::capture(&io_err);

        stats.start(None);
        stats.end(None, false, Duration::from_millis(5));
        stats.start(None);
        stats.end(Some(&captured), false, Duration::from_millis(7));
        stats.start(None);
        stats.end(None, true, Duration::from_millis(9));

        assert_eq!(stats.success(), 1);
        assert_eq!(stats.panics(), 1);
        assert_eq!(stats.failure_times().count, 2);
        assert_eq!(stats.errors()["TimedOut"], 1);
    }

    #[test]
    fn observe_guard_records_panic_on_unwind() {
        let stats = Arc::new(stats());
        let inner = stats.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _call = inner.observe();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(stats.panics(), 1);
        assert_eq!(stats.current(), 0);
        assert_eq!(stats.failure_times().count, 1);
    }

    #[test]
    fn stats_emission_shape() {
        let stats = stats();
        stats.start(None);
        stats.end(None, false, Duration::from_millis(2));
        let collected = collect(&stats);
        assert_eq!(collected["function,name=f current"], 0.0);
        assert_eq!(collected["function,name=f highwater"], 1.0);
        assert_eq!(collected["function,name=f success"], 1.0);
        assert_eq!(collected["function,name=f panics"], 0.0);
        assert_eq!(collected["function_times,kind=success,name=f count"], 1.0);
        assert_eq!(collected["function_times,kind=failure,name=f count"], 0.0);
    }

    #[test]
    fn error_classes_become_tagged_series() {
        let stats = stats();
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let captured = SpanError::capture(&not_found);
        for _ in 0..3 {
            stats.start(None);
            stats.end(Some(&captured), false, Duration::from_millis(1));
        }
        let collected = collect(&stats);
        assert_eq!(collected["function,class=NotFound,name=f errors"], 3.0);
    }
}
