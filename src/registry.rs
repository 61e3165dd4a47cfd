// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! The root of the source hierarchy: scopes, live spans, and trace
//! observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::func::Func;
use crate::scope::Scope;
use crate::source::{StatCb, StatSource};
use crate::span::{sort_spans, Span};
use crate::trace::{isolate, Canceler, Trace};

type TraceObserver = Arc<dyn Fn(&Arc<Trace>) + Send + Sync>;

static TRACE_OBSERVER_TOKENS: AtomicU64 = AtomicU64::new(1);

static DEFAULT: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide registry backing the [`package!`][crate::package]
/// macro.
pub fn default_registry() -> &'static Registry {
    &DEFAULT
}

/// Owns the scope hierarchy plus the live root and orphan span sets.
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    scopes: Mutex<HashMap<String, Scope>>,
    spans: Mutex<HashMap<i64, Arc<Span>>>,
    orphans: Mutex<HashMap<i64, Arc<Span>>>,
    trace_observers: RwLock<Vec<(u64, TraceObserver)>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                scopes: Mutex::new(HashMap::new()),
                spans: Mutex::new(HashMap::new()),
                orphans: Mutex::new(HashMap::new()),
                trace_observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Registry {
        Registry { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    /// Returns (creating on first use) the scope with the given name.
    /// Scopes are never destroyed.
    pub fn package_named(&self, name: &str) -> Scope {
        let mut scopes = self.inner.scopes.lock();
        if let Some(scope) = scopes.get(name) {
            return scope.clone();
        }
        let scope = Scope::new(self.downgrade(), name.to_string());
        scopes.insert(name.to_string(), scope.clone());
        scope
    }

    /// Registers `cb` to run once for every trace subsequently born on
    /// (or announced to) this registry. Returns a canceler.
    pub fn observe_traces(
        &self,
        cb: impl Fn(&Arc<Trace>) + Send + Sync + 'static,
    ) -> Canceler {
        let token = TRACE_OBSERVER_TOKENS.fetch_add(1, Ordering::Relaxed);
        self.inner
            .trace_observers
            .write()
            .push((token, Arc::new(cb)));
        let inner = Arc::downgrade(&self.inner);
        Canceler::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.trace_observers.write().retain(|(t, _)| *t != token);
            }
        })
    }

    pub(crate) fn observe_trace(&self, trace: &Arc<Trace>) {
        let observers: Vec<TraceObserver> = self
            .inner
            .trace_observers
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for observer in observers {
            isolate(|| observer(trace));
        }
    }

    pub(crate) fn root_span_start(&self, span: &Arc<Span>) {
        self.inner.spans.lock().insert(span.id(), span.clone());
    }

    pub(crate) fn root_span_end(&self, span: &Arc<Span>) {
        self.inner.spans.lock().remove(&span.id());
    }

    pub(crate) fn orphaned_span(&self, span: &Arc<Span>) {
        self.inner.orphans.lock().insert(span.id(), span.clone());
    }

    pub(crate) fn orphan_end(&self, span: &Arc<Span>) {
        self.inner.orphans.lock().remove(&span.id());
    }

    /// Calls `cb` for every live root and orphan span, ordered by full
    /// function name then id.
    pub fn root_spans(&self, cb: &mut dyn FnMut(&Arc<Span>)) {
        let mut spans: Vec<Arc<Span>> = self.inner.spans.lock().values().cloned().collect();
        spans.extend(self.inner.orphans.lock().values().cloned());
        sort_spans(&mut spans);
        for span in &spans {
            cb(span);
        }
    }

    /// Calls `cb` for every live orphan span.
    pub fn orphaned_spans(&self, cb: &mut dyn FnMut(&Arc<Span>)) {
        let mut spans: Vec<Arc<Span>> = self.inner.orphans.lock().values().cloned().collect();
        sort_spans(&mut spans);
        for span in &spans {
            cb(span);
        }
    }

    /// Calls `cb` for every scope, in lexicographic name order.
    pub fn scopes(&self, cb: &mut dyn FnMut(&Scope)) {
        let mut scopes: Vec<Scope> = self.inner.scopes.lock().values().cloned().collect();
        scopes.sort_by(|a, b| a.name().cmp(b.name()));
        for scope in &scopes {
            cb(scope);
        }
    }

    /// Calls `cb` for every function in every scope.
    pub fn funcs(&self, cb: &mut dyn FnMut(&Arc<Func>)) {
        self.scopes(&mut |scope| scope.funcs(cb));
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Streams every scope's stats, scopes in lexicographic name order.
impl StatSource for Registry {
    fn stats(&self, cb: &mut StatCb<'_>) {
        self.scopes(&mut |scope| scope.stats(cb));
    }
}
