// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! One monitored invocation: a node in the trace tree.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;

use crate::func::Func;
use crate::trace::Trace;

/// A single monitored invocation. Spans are created and finished by the
/// task wrapper; user code interacts with them through annotations and
/// observers.
pub struct Span {
    id: i64,
    start: Instant,
    func: Arc<Func>,
    args: Vec<String>,
    trace: Arc<Trace>,
    parent_id: Option<i64>,
    parent: Option<Weak<Span>>,
    inner: Mutex<SpanInner>,
}

#[derive(Default)]
struct SpanInner {
    done: bool,
    orphaned: bool,
    children: SpanBag,
    annotations: Vec<(String, String)>,
}

impl Span {
    pub(crate) fn new(
        id: i64,
        func: Arc<Func>,
        args: Vec<String>,
        trace: Arc<Trace>,
        parent: Option<&Arc<Span>>,
        remote_parent_id: Option<i64>,
    ) -> Arc<Span> {
        Arc::new(Span {
            id,
            start: Instant::now(),
            func,
            args,
            trace,
            parent_id: parent.map(|p| p.id).or(remote_parent_id),
            parent: parent.map(Arc::downgrade),
            inner: Mutex::new(SpanInner::default()),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn func(&self) -> &Arc<Func> {
        &self.func
    }

    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    /// The parent span, while it is still reachable.
    pub fn parent(&self) -> Option<Arc<Span>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// The parent span id, which for remotely-parented spans names a span
    /// in another process.
    pub fn parent_id(&self) -> Option<i64> {
        self.parent_id
    }

    /// The arguments captured at entry, already rendered.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Time since the span started.
    pub fn duration(&self) -> Duration {
        Instant::now() - self.start
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// True once the span has outlived its parent.
    pub fn is_orphaned(&self) -> bool {
        self.inner.lock().orphaned
    }

    /// Attaches a `(name, value)` annotation for presentation layers.
    pub fn annotate(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .annotations
            .push((name.into(), value.into()));
    }

    pub fn annotations(&self) -> Vec<(String, String)> {
        self.inner.lock().annotations.clone()
    }

    /// Calls `cb` for each live child, ordered by function name then id.
    pub fn children(&self, cb: &mut dyn FnMut(&Arc<Span>)) {
        let mut children = {
            let inner = self.inner.lock();
            inner.children.snapshot()
        };
        sort_spans(&mut children);
        for child in &children {
            cb(child);
        }
    }

    pub(crate) fn add_child(&self, child: &Arc<Span>) {
        let done = {
            let mut inner = self.inner.lock();
            inner.children.add(child);
            inner.done
        };
        if done {
            child.orphan();
        }
    }

    pub(crate) fn remove_child(&self, child: &Arc<Span>) {
        self.inner.lock().children.remove(child);
    }

    /// Marks a live span as orphaned, handing it to the registry's orphan
    /// set. Idempotent; a no-op on finished spans.
    pub(crate) fn orphan(self: &Arc<Self>) {
        let newly_orphaned = {
            let mut inner = self.inner.lock();
            if !inner.done && !inner.orphaned {
                inner.orphaned = true;
                true
            } else {
                false
            }
        };
        if newly_orphaned {
            if let Some(registry) = self.func.scope().registry() {
                registry.orphaned_span(self);
            }
        }
    }

    /// Transitions live → done, returning whether the span was orphaned
    /// and the children still live at that moment.
    pub(crate) fn finish_mark(&self) -> (bool, Vec<Arc<Span>>) {
        let mut inner = self.inner.lock();
        inner.done = true;
        (inner.orphaned, inner.children.snapshot())
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("func", &self.func.full_name())
            .field("trace", &self.trace.id())
            .finish()
    }
}

/// Orders spans by full function name, then id. Shared by the registry's
/// live-span walk and `Span::children`.
pub(crate) fn sort_spans(spans: &mut [Arc<Span>]) {
    spans.sort_by(|a, b| (a.func().full_name(), a.id()).cmp(&(b.func().full_name(), b.id())));
}

/// A bag of live child spans with a single-element fast slot; the common
/// case is one child at a time.
#[derive(Default)]
struct SpanBag {
    first: Option<Arc<Span>>,
    rest: HashMap<i64, (Arc<Span>, u32)>,
}

impl SpanBag {
    fn add(&mut self, span: &Arc<Span>) {
        if self.first.is_none() {
            self.first = Some(span.clone());
            return;
        }
        self.rest
            .entry(span.id())
            .or_insert_with(|| (span.clone(), 0))
            .1 += 1;
    }

    fn remove(&mut self, span: &Arc<Span>) {
        if let Some(first) = &self.first {
            if first.id() == span.id() {
                self.first = None;
                return;
            }
        }
        if let Some((_, count)) = self.rest.get_mut(&span.id()) {
            if *count <= 1 {
                self.rest.remove(&span.id());
            } else {
                *count -= 1;
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Span>> {
        let mut spans = Vec::with_capacity(self.rest.len() + 1);
        if let Some(first) = &self.first {
            spans.push(first.clone());
        }
        spans.extend(self.rest.values().map(|(span, _)| span.clone()));
        spans
    }
}
