// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Traces: the maximal connected set of parent-linked spans descending
//! from one root, conceptually one request.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use minstant::Instant;
use parking_lot::{Mutex, RwLock};

use crate::func::SpanError;
use crate::span::Span;

/// Observes every span start and finish on the traces it is registered
/// with.
pub trait SpanObserver: Send + Sync + 'static {
    /// Called when a span starts.
    fn start(&self, span: &Arc<Span>);

    /// Called when a span finishes, with the captured error if any,
    /// whether it panicked, and the finish time.
    fn finish(&self, span: &Arc<Span>, err: Option<&SpanError>, panicked: bool, finish: Instant);
}

/// The conventional trace-bag flag for sampling decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sampled(pub bool);

static OBSERVER_TOKENS: AtomicU64 = AtomicU64::new(1);

/// A trace. Created at the trace root and strongly referenced by every
/// span on it.
pub struct Trace {
    id: i64,
    vals: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    observers: RwLock<Vec<(u64, Arc<dyn SpanObserver>)>>,
}

impl Trace {
    pub fn new(id: i64) -> Arc<Trace> {
        Arc::new(Trace {
            id,
            vals: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Retrieves a value from the trace bag. See [`Trace::set`].
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.vals
            .lock()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast().ok())
    }

    /// Stores a value in the trace bag, keyed by its type. Intended for
    /// cross-cutting flags like [`Sampled`].
    pub fn set<T: Any + Send + Sync>(&self, val: T) {
        self.vals.lock().insert(TypeId::of::<T>(), Arc::new(val));
    }

    /// Registers an observer for all subsequent span starts and finishes
    /// on this trace. Returns a canceler that detaches it.
    pub fn observe_spans(
        self: &Arc<Self>,
        observer: impl SpanObserver,
    ) -> Canceler {
        self.observe_spans_arc(Arc::new(observer))
    }

    pub(crate) fn observe_spans_arc(
        self: &Arc<Self>,
        observer: Arc<dyn SpanObserver>,
    ) -> Canceler {
        let token = OBSERVER_TOKENS.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((token, observer));
        let trace: Weak<Trace> = Arc::downgrade(self);
        Canceler::new(move || {
            if let Some(trace) = trace.upgrade() {
                trace.observers.write().retain(|(t, _)| *t != token);
            }
        })
    }

    pub(crate) fn start_span(&self, span: &Arc<Span>) {
        for observer in self.observer_snapshot() {
            isolate(|| observer.start(span));
        }
    }

    pub(crate) fn finish_span(
        &self,
        span: &Arc<Span>,
        err: Option<&SpanError>,
        panicked: bool,
        finish: Instant,
    ) {
        for observer in self.observer_snapshot() {
            isolate(|| observer.finish(span, err, panicked, finish));
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn SpanObserver>> {
        self.observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace").field("id", &self.id).finish()
    }
}

/// Runs one observer invocation, containing any panic so sibling
/// observers and span teardown still run.
pub(crate) fn isolate(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::warn!("observer panicked; continuing");
    }
}

/// Undoes an observer registration. Cancellation is explicit; dropping a
/// `Canceler` leaves the registration in place.
pub struct Canceler(Option<Box<dyn FnOnce() + Send>>);

impl Canceler {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Canceler {
        Canceler(Some(Box::new(f)))
    }

    pub fn cancel(mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}
