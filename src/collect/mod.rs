// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Matcher-driven capture of finished span subtrees.
//!
//! [`watch_for_spans`] observes every live and future trace on a registry
//! until some span matches; from that point every finishing span of that
//! trace is recorded until the matched span itself finishes, and the
//! collected subtree is returned in DFS order (parents before children).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam::channel::{never, unbounded, Receiver, Sender};
use crossbeam::select;
use minstant::Instant;
use parking_lot::Mutex;

use crate::context::Context;
use crate::func::SpanError;
use crate::registry::Registry;
use crate::span::Span;
use crate::trace::{Canceler, SpanObserver, Trace};

/// An inert record of a span copied at finish time.
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    pub span: Arc<Span>,
    pub err: Option<SpanError>,
    pub panicked: bool,
    pub finish: Instant,
}

/// Why a collection ended without spans.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The caller's context was cancelled before the watched span
    /// finished. No partial result is produced.
    #[error("span collection cancelled")]
    Cancelled,
}

enum Watch {
    Unstarted,
    Started(Arc<Span>),
    Done,
}

#[derive(Default)]
struct Collected {
    root: Option<FinishedSpan>,
    by_parent: HashMap<i64, Vec<FinishedSpan>>,
}

type Matcher = dyn Fn(&Arc<Span>) -> bool + Send + Sync;

/// A [`SpanObserver`] that records the finished subtree under the first
/// span its matcher accepts. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SpanCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    matcher: Option<Box<Matcher>>,
    watch: Mutex<Watch>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    collected: Mutex<Collected>,
}

impl SpanCollector {
    /// A collector with no matcher; collection begins only through
    /// [`SpanCollector::force_start`].
    pub fn new(matcher: Option<Box<Matcher>>) -> SpanCollector {
        let (done_tx, done_rx) = unbounded();
        SpanCollector {
            inner: Arc::new(CollectorInner {
                matcher,
                watch: Mutex::new(Watch::Unstarted),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
                collected: Mutex::new(Collected::default()),
            }),
        }
    }

    pub fn with_matcher(matcher: impl Fn(&Arc<Span>) -> bool + Send + Sync + 'static) -> Self {
        Self::new(Some(Box::new(matcher)))
    }

    /// A receiver that becomes ready once everything this collector
    /// cares about has been collected.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// Starts collecting, stopping when `end_span` finishes. Skips the
    /// matcher; a no-op if collection already started.
    pub fn force_start(&self, end_span: &Arc<Span>) {
        let mut watch = self.inner.watch.lock();
        if matches!(*watch, Watch::Unstarted) {
            *watch = Watch::Started(end_span.clone());
        }
    }

    /// Stops collecting and wakes any waiter.
    pub fn stop(&self) {
        let was_done = {
            let mut watch = self.inner.watch.lock();
            let was_done = matches!(*watch, Watch::Done);
            *watch = Watch::Done;
            was_done
        };
        if !was_done {
            // closing the channel is the wakeup
            self.inner.done_tx.lock().take();
        }
    }

    /// The collected subtree, rooted at the span that triggered
    /// collection, parents before children.
    pub fn spans(&self) -> Vec<FinishedSpan> {
        let collected = self.inner.collected.lock();
        let mut spans = Vec::new();
        if let Some(root) = &collected.root {
            walk(root, &collected.by_parent, &mut spans);
        }
        spans
    }
}

fn walk(
    finished: &FinishedSpan,
    by_parent: &HashMap<i64, Vec<FinishedSpan>>,
    out: &mut Vec<FinishedSpan>,
) {
    out.push(finished.clone());
    if let Some(children) = by_parent.get(&finished.span.id()) {
        for child in children {
            walk(child, by_parent, out);
        }
    }
}

impl SpanObserver for SpanCollector {
    fn start(&self, span: &Arc<Span>) {
        let matcher = match &self.inner.matcher {
            Some(matcher) => matcher,
            None => return,
        };
        if !matches!(*self.inner.watch.lock(), Watch::Unstarted) {
            return;
        }
        // the matcher runs outside the state lock
        if !matcher(span) {
            return;
        }
        let mut watch = self.inner.watch.lock();
        if matches!(*watch, Watch::Unstarted) {
            *watch = Watch::Started(span.clone());
        }
    }

    fn finish(&self, span: &Arc<Span>, err: Option<&SpanError>, panicked: bool, finish: Instant) {
        let watched = match &*self.inner.watch.lock() {
            Watch::Unstarted | Watch::Done => return,
            Watch::Started(watched) => watched.clone(),
        };
        if watched.trace().id() != span.trace().id() {
            return;
        }
        let finished = FinishedSpan {
            span: span.clone(),
            err: err.cloned(),
            panicked,
            finish,
        };
        let is_watched_span = Arc::ptr_eq(&watched, span);
        {
            let mut collected = self.inner.collected.lock();
            if collected.root.is_some() {
                return;
            }
            if !is_watched_span {
                if let Some(parent_id) = span.parent_id() {
                    collected.by_parent.entry(parent_id).or_default().push(finished);
                }
                return;
            }
            collected.root = Some(finished);
        }
        self.stop();
    }
}

/// Registers `observer` with every live trace (found through root spans)
/// and every future trace of `registry`. The returned canceler detaches
/// everything.
pub fn observe_all_traces(registry: &Registry, observer: Arc<dyn SpanObserver>) -> Canceler {
    #[derive(Default)]
    struct ObserveState {
        cancelers: Vec<Canceler>,
        seen: HashSet<i64>,
        stopping: bool,
    }

    let state = Arc::new(Mutex::new(ObserveState::default()));

    let attach = {
        let state = state.clone();
        let observer = observer.clone();
        move |trace: &Arc<Trace>| {
            let mut state = state.lock();
            if state.stopping || !state.seen.insert(trace.id()) {
                return;
            }
            let canceler = trace.observe_spans_arc(observer.clone());
            state.cancelers.push(canceler);
        }
    };

    let main_canceler = registry.observe_traces(attach.clone());

    // pick up live traces we can find
    registry.root_spans(&mut |span| attach(span.trace()));

    Canceler::new(move || {
        main_canceler.cancel();
        let mut state = state.lock();
        state.stopping = true;
        for canceler in state.cancelers.drain(..) {
            canceler.cancel();
        }
    })
}

/// Watches for a span `matcher` accepts. As soon as some trace produces a
/// matched span, every span of that trace finishing from then on is
/// collected, until the matched span completes. Cancelling `ctx` ends the
/// watch early with [`CollectError::Cancelled`] and no spans.
///
/// Every trace started while the watch is running pays a small permanent
/// observer registration; this only matters for very long-running traces.
pub fn watch_for_spans(
    ctx: &Context,
    registry: &Registry,
    matcher: impl Fn(&Arc<Span>) -> bool + Send + Sync + 'static,
) -> Result<Vec<FinishedSpan>, CollectError> {
    let collector = SpanCollector::with_matcher(matcher);
    let canceler = observe_all_traces(registry, Arc::new(collector.clone()));

    let never_done = never::<()>();
    let ctx_done = ctx.done().unwrap_or(&never_done);
    let result = select! {
        recv(ctx_done) -> _ => Err(CollectError::Cancelled),
        recv(collector.done()) -> _ => Ok(collector.spans()),
    };

    collector.stop();
    canceler.cancel();
    result
}

/// Collects the subtree of spans produced by `work`, using the current
/// span to pick the trace. `work` runs wrapped in a synthetic
/// `<name>-traced` task; without a span in `ctx` it runs unobserved and
/// no spans are returned.
pub fn collect_spans(ctx: &Context, work: impl FnOnce(&mut Context)) -> Vec<FinishedSpan> {
    let span = match ctx.span() {
        Some(span) => span.clone(),
        None => {
            let mut ctx = ctx.clone();
            work(&mut ctx);
            return Vec::new();
        }
    };

    let collector = SpanCollector::new(None);
    let _attached = span
        .trace()
        .observe_spans_arc(Arc::new(collector.clone()));

    let func = span.func();
    let traced = func
        .scope()
        .func_named(&format!("{}-traced", func.short_name()));

    let mut child_ctx = ctx.clone();
    let guard = traced.task(&mut child_ctx);
    collector.force_start(child_ctx.span().expect("task installs a span"));
    work(&mut child_ctx);
    guard.success();

    collector.stop();
    collector.spans()
}

/// Resolves the first live span `matcher` accepts, or `None` once `ctx`
/// is cancelled. The matcher may be called concurrently from many span
/// starts.
pub fn find_span(
    ctx: &Context,
    registry: &Registry,
    matcher: impl Fn(&Arc<Span>) -> bool + Send + Sync + 'static,
) -> Option<Arc<Span>> {
    struct Finder {
        matcher: Box<Matcher>,
        found: Mutex<Option<Arc<Span>>>,
        done_tx: Mutex<Option<Sender<()>>>,
        done_rx: Receiver<()>,
    }

    impl SpanObserver for Finder {
        fn start(&self, span: &Arc<Span>) {
            if !(self.matcher)(span) {
                return;
            }
            let mut found = self.found.lock();
            if found.is_none() {
                *found = Some(span.clone());
                self.done_tx.lock().take();
            }
        }

        fn finish(
            &self,
            _span: &Arc<Span>,
            _err: Option<&SpanError>,
            _panicked: bool,
            _finish: Instant,
        ) {
        }
    }

    let (done_tx, done_rx) = unbounded();
    let finder = Arc::new(Finder {
        matcher: Box::new(matcher),
        found: Mutex::new(None),
        done_tx: Mutex::new(Some(done_tx)),
        done_rx,
    });

    let canceler = observe_all_traces(registry, finder.clone());

    let never_done = never::<()>();
    let ctx_done = ctx.done().unwrap_or(&never_done);
    select! {
        recv(ctx_done) -> _ => {}
        recv(finder.done_rx) -> _ => {}
    }

    canceler.cancel();
    let found = finder.found.lock().clone();
    found
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn collector_captures_dfs_subtree() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let func_a = scope.func_named("a");
        let func_b = scope.func_named("b");
        let func_c = scope.func_named("c");

        let collector = SpanCollector::with_matcher(|s| s.func().short_name() == "a");
        let canceler = observe_all_traces(&registry, Arc::new(collector.clone()));

        let mut ctx = Context::new();
        let guard_a = func_a.task(&mut ctx);
        let a_id = ctx.span().unwrap().id();

        {
            let mut b_ctx = ctx.clone();
            let guard_b = func_b.task(&mut b_ctx);
            guard_b.success();
        }

        let join = std::thread::spawn({
            let ctx = ctx.clone();
            move || {
                let mut c_ctx = ctx.clone();
                let guard_c = func_c.task(&mut c_ctx);
                guard_c.success();
            }
        });
        join.join().unwrap();

        guard_a.success();
        // root finished, so the collector closed its done channel
        assert!(collector.done().try_recv().is_err());

        let spans = collector.spans();
        let names: Vec<_> = spans
            .iter()
            .map(|fs| fs.span.func().short_name().to_string())
            .collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "a");
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"c".to_string()));
        // parents precede children, and the subtree root keeps no parent
        assert_eq!(spans[0].span.id(), a_id);
        for child in &spans[1..] {
            assert_eq!(child.span.parent_id(), Some(a_id));
        }
        assert!(spans[0].span.parent().is_none());

        canceler.cancel();
    }

    #[test]
    fn watch_for_spans_returns_matched_subtree() {
        let registry = Registry::new();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::spawn({
            let registry = registry.clone();
            let stop = stop.clone();
            move || {
                let func = registry.package_named("bg").func_named("w");
                while !stop.load(Ordering::SeqCst) {
                    let mut ctx = Context::new();
                    let guard = func.task(&mut ctx);
                    guard.success();
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        });

        let spans = watch_for_spans(&Context::new(), &registry, |s| {
            s.func().short_name() == "w"
        })
        .unwrap();

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span.func().short_name(), "w");
        assert!(spans[0].err.is_none());
        assert!(!spans[0].panicked);
    }

    #[test]
    fn cancelled_watch_returns_no_partial_result() {
        let registry = Registry::new();
        let (ctx, handle) = Context::new().with_cancel();
        handle.cancel();
        let result = watch_for_spans(&ctx, &registry, |_| true);
        assert!(matches!(result, Err(CollectError::Cancelled)));
    }

    #[test]
    fn collect_spans_wraps_work_in_synthetic_task() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let outer_func = scope.func_named("outer");
        let inner_func = scope.func_named("inner");

        let mut ctx = Context::new();
        let outer_guard = outer_func.task(&mut ctx);

        let spans = collect_spans(&ctx, |work_ctx| {
            let guard = inner_func.task(work_ctx);
            guard.success();
        });
        outer_guard.success();

        let names: Vec<_> = spans
            .iter()
            .map(|fs| fs.span.func().short_name().to_string())
            .collect();
        assert_eq!(names, ["outer-traced", "inner"]);
    }

    #[test]
    fn collect_spans_without_span_still_runs_work() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let inner_func = scope.func_named("inner");

        let ran = Arc::new(AtomicBool::new(false));
        let spans = collect_spans(&Context::new(), {
            let ran = ran.clone();
            let inner_func = inner_func.clone();
            move |work_ctx| {
                ran.store(true, Ordering::SeqCst);
                let guard = inner_func.task(work_ctx);
                guard.success();
            }
        });
        assert!(ran.load(Ordering::SeqCst));
        assert!(spans.is_empty());
    }

    #[test]
    fn find_span_resolves_first_match() {
        let registry = Registry::new();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::spawn({
            let registry = registry.clone();
            let stop = stop.clone();
            move || {
                let func = registry.package_named("bg").func_named("target");
                while !stop.load(Ordering::SeqCst) {
                    let mut ctx = Context::new();
                    let guard = func.task(&mut ctx);
                    guard.success();
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        });

        let found = find_span(&Context::new(), &registry, |s| {
            s.func().short_name() == "target"
        });
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();

        assert_eq!(found.unwrap().func().short_name(), "target");
    }

    #[test]
    fn errors_and_panics_surface_in_finished_spans() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let root_func = scope.func_named("root");
        let bad_func = scope.func_named("bad");

        let collector = SpanCollector::with_matcher(|s| s.func().short_name() == "root");
        let canceler = observe_all_traces(&registry, Arc::new(collector.clone()));

        let mut ctx = Context::new();
        let root_guard = root_func.task(&mut ctx);
        {
            let mut bad_ctx = ctx.clone();
            let bad_guard = bad_func.task(&mut bad_ctx);
            let err = std::io::Error::new(std::io::ErrorKind::Other, "kaput");
            bad_guard.failure(&err);
        }
        root_guard.success();

        let spans = collector.spans();
        let bad = spans
            .iter()
            .find(|fs| fs.span.func().short_name() == "bad")
            .unwrap();
        assert_eq!(bad.err.as_ref().unwrap().class(), "Other");

        canceler.cancel();
    }
}
