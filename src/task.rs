// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! The invocation wrapper: creates a span on entry, measures, captures
//! the outcome, and tears the span down on every exit path.

use std::sync::Arc;

use minstant::Instant;
use once_cell::sync::OnceCell;

use crate::context::Context;
use crate::func::{Func, SpanError};
use crate::id::new_id;
use crate::scope::Scope;
use crate::span::Span;
use crate::trace::Trace;

impl Scope {
    /// Returns a task bound to the named function. Resolution of the
    /// function is deferred to the first invocation.
    ///
    /// ```
    /// use minimon::{func_name, Context, Registry};
    ///
    /// fn handle(registry: &Registry, ctx: &Context) -> Result<(), std::io::Error> {
    ///     let scope = registry.package_named("app");
    ///     scope.task(func_name!()).run(ctx, |_ctx| Ok(()))
    /// }
    ///
    /// # handle(&Registry::new(), &Context::new()).unwrap();
    /// ```
    pub fn task(&self, name: &'static str) -> Task {
        Task {
            scope: self.clone(),
            name,
            func: OnceCell::new(),
        }
    }
}

/// A reusable handle instrumenting one function. Obtained from
/// [`Scope::task`], typically with [`func_name!`][crate::func_name].
pub struct Task {
    scope: Scope,
    name: &'static str,
    func: OnceCell<Arc<Func>>,
}

impl Task {
    /// The function this task reports into.
    pub fn func(&self) -> &Arc<Func> {
        self.func
            .get_or_init(|| self.scope.func_named(self.name))
    }

    /// Starts a span as a child of the context's current span (or as a
    /// new trace root) and swaps the child context into `ctx`.
    pub fn enter(&self, ctx: &mut Context) -> TaskGuard {
        self.func().task(ctx)
    }

    /// Like [`Task::enter`], capturing rendered arguments on the span.
    pub fn enter_with_args(&self, ctx: &mut Context, args: Vec<String>) -> TaskGuard {
        self.func().task_with_args(ctx, args)
    }

    /// Runs `f` under a new span, recording the `Result` outcome. Panics
    /// in `f` are recorded and propagate.
    pub fn run<T, E>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&mut Context) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::error::Error + 'static,
    {
        let mut child_ctx = ctx.clone();
        let guard = self.enter(&mut child_ctx);
        let result = f(&mut child_ctx);
        match &result {
            Ok(_) => guard.success(),
            Err(err) => guard.failure(err),
        }
        result
    }
}

impl Func {
    /// Starts a span for this function. The span joins the context's
    /// current trace, or begins a fresh one when the context carries no
    /// span.
    pub fn task(self: &Arc<Self>, ctx: &mut Context) -> TaskGuard {
        self.task_with_args(ctx, Vec::new())
    }

    pub fn task_with_args(self: &Arc<Self>, ctx: &mut Context, args: Vec<String>) -> TaskGuard {
        new_span(ctx, self, args, new_id(), None, None)
    }

    /// Starts a span on a trace owned elsewhere, recording
    /// `parent_span_id` as the remote parent. The trace is announced to
    /// the registry's trace observers.
    pub fn remote_trace(
        self: &Arc<Self>,
        ctx: &mut Context,
        parent_span_id: i64,
        trace: Arc<Trace>,
    ) -> TaskGuard {
        if let Some(registry) = self.scope().registry() {
            registry.observe_trace(&trace);
        }
        new_span(ctx, self, Vec::new(), new_id(), Some(trace), Some(parent_span_id))
    }

    /// Starts a span on a brand new trace, regardless of any span already
    /// in the context.
    pub fn reset_trace(self: &Arc<Self>, ctx: &mut Context) -> TaskGuard {
        let trace = Trace::new(new_id());
        if let Some(registry) = self.scope().registry() {
            registry.observe_trace(&trace);
        }
        new_span(ctx, self, Vec::new(), new_id(), Some(trace), None)
    }
}

fn new_span(
    ctx: &mut Context,
    func: &Arc<Func>,
    args: Vec<String>,
    id: i64,
    trace: Option<Arc<Trace>>,
    remote_parent_id: Option<i64>,
) -> TaskGuard {
    // a supplied trace always roots a new subtree
    let parent = if trace.is_none() {
        ctx.span().cloned()
    } else {
        None
    };

    let trace = match trace {
        Some(trace) => trace,
        None => match &parent {
            Some(parent) => parent.trace().clone(),
            None => {
                let trace = Trace::new(new_id());
                if let Some(registry) = func.scope().registry() {
                    registry.observe_trace(&trace);
                }
                trace
            }
        },
    };

    let span = Span::new(id, func.clone(), args, trace, parent.as_ref(), remote_parent_id);

    match &parent {
        Some(parent) => {
            func.start(Some(parent.func()));
            parent.add_child(&span);
        }
        None => {
            func.start(None);
            if let Some(registry) = func.scope().registry() {
                registry.root_span_start(&span);
            }
        }
    }

    span.trace().start_span(&span);
    *ctx = ctx.with_span(span.clone());

    TaskGuard {
        span,
        parent,
        finished: false,
    }
}

/// Finishes its span exactly once: explicitly through
/// [`TaskGuard::finish`] (or `success`/`failure`), or on drop, where an
/// in-flight unwind is recorded as a panic and then keeps propagating.
#[must_use]
pub struct TaskGuard {
    span: Arc<Span>,
    parent: Option<Arc<Span>>,
    finished: bool,
}

impl TaskGuard {
    pub fn span(&self) -> &Arc<Span> {
        &self.span
    }

    /// Finishes the span with an explicit outcome.
    pub fn finish(mut self, err: Option<&(dyn std::error::Error + 'static)>) {
        self.finished = true;
        let captured = err.map(SpanError::capture);
        self.complete(captured, false);
    }

    pub fn success(self) {
        self.finish(None)
    }

    pub fn failure(self, err: &(dyn std::error::Error + 'static)) {
        self.finish(Some(err))
    }

    fn complete(&mut self, err: Option<SpanError>, panicked: bool) {
        let finish = Instant::now();
        let span = &self.span;
        span.func().end(err.as_ref(), panicked, finish - span.start());

        let (orphaned, live_children) = span.finish_mark();
        for child in &live_children {
            child.orphan();
        }

        let registry = span.func().scope().registry();
        match &self.parent {
            Some(parent) => {
                parent.remove_child(span);
                if orphaned {
                    if let Some(registry) = &registry {
                        registry.orphan_end(span);
                    }
                }
            }
            None => {
                if let Some(registry) = &registry {
                    registry.root_span_end(span);
                }
            }
        }

        span.trace().finish_span(span, err.as_ref(), panicked, finish);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.complete(None, std::thread::panicking());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::registry::Registry;
    use crate::trace::SpanObserver;

    struct Recording {
        started: AtomicUsize,
        finished: AtomicUsize,
        outcomes: Mutex<Vec<(String, Option<String>, bool)>>,
    }

    impl Recording {
        fn new() -> Arc<Recording> {
            Arc::new(Recording {
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                outcomes: Mutex::new(Vec::new()),
            })
        }
    }

    impl SpanObserver for Arc<Recording> {
        fn start(&self, _span: &Arc<Span>) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn finish(
            &self,
            span: &Arc<Span>,
            err: Option<&SpanError>,
            panicked: bool,
            _finish: Instant,
        ) {
            self.finished.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().push((
                span.func().short_name().to_string(),
                err.map(|e| e.class().to_string()),
                panicked,
            ));
        }
    }

    #[test]
    fn successful_call_updates_func_stats() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let func = scope.func_named("f");

        let mut ctx = Context::new();
        let guard = func.task(&mut ctx);
        assert_eq!(func.current(), 1);
        guard.success();

        assert_eq!(func.current(), 0);
        assert_eq!(func.highwater(), 1);
        assert_eq!(func.success(), 1);
        assert!(func.errors().is_empty());
        assert_eq!(func.failure_times().count, 0);
    }

    #[test]
    fn erroring_call_is_classified() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");

        let mut ctx = Context::new();
        let guard = func.task(&mut ctx);
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        guard.failure(&err);

        assert_eq!(func.success(), 0);
        assert_eq!(func.failure_times().count, 1);
        assert_eq!(func.errors()["TimedOut"], 1);
    }

    #[test]
    fn panic_is_recorded_and_propagates() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");
        let observer = Recording::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe({
            let func = func.clone();
            let observer = observer.clone();
            move || {
                let mut ctx = Context::new();
                let _guard = func.task(&mut ctx);
                let _canceler = ctx.span().unwrap().trace().observe_spans(observer);
                panic!("boom");
            }
        }));

        assert!(result.is_err());
        assert_eq!(func.panics(), 1);
        assert_eq!(func.current(), 0);
        assert_eq!(func.failure_times().count, 1);
        let outcomes = observer.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].2, "observer saw panicked=true");
    }

    #[test]
    fn child_spans_share_the_trace() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let parent_func = scope.func_named("parent");
        let child_func = scope.func_named("child");

        let mut ctx = Context::new();
        let parent_guard = parent_func.task(&mut ctx);
        let root_trace_id = ctx.span().unwrap().trace().id();

        let mut child_ctx = ctx.clone();
        let child_guard = child_func.task(&mut child_ctx);
        let child_span = child_ctx.span().unwrap().clone();
        assert_eq!(child_span.trace().id(), root_trace_id);
        assert_eq!(child_span.parent().unwrap().id(), ctx.span().unwrap().id());

        child_guard.success();
        parent_guard.success();

        // the child recorded its caller
        let mut parents = Vec::new();
        child_func.parents(&mut |p| parents.push(p.map(|f| f.full_name())));
        assert_eq!(parents, [Some("pkg.parent".to_string())]);

        let mut roots = Vec::new();
        parent_func.parents(&mut |p| roots.push(p.is_none()));
        assert_eq!(roots, [true]);
    }

    #[test]
    fn observers_see_start_and_finish_exactly_once() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");
        let observer = Recording::new();

        let mut ctx = Context::new();
        let guard = func.task(&mut ctx);
        let canceler = ctx
            .span()
            .unwrap()
            .trace()
            .observe_spans(observer.clone());

        let mut inner_ctx = ctx.clone();
        let inner = func.task(&mut inner_ctx);
        inner.success();
        guard.success();

        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 2);
        canceler.cancel();
    }

    #[test]
    fn reset_trace_starts_fresh() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");

        let mut ctx = Context::new();
        let outer = func.task(&mut ctx);
        let outer_trace = ctx.span().unwrap().trace().id();

        let mut inner_ctx = ctx.clone();
        let inner = func.reset_trace(&mut inner_ctx);
        let inner_span = inner_ctx.span().unwrap().clone();
        assert_ne!(inner_span.trace().id(), outer_trace);
        assert!(inner_span.parent().is_none());

        inner.success();
        outer.success();
    }

    #[test]
    fn remote_trace_records_remote_parent() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");
        let announced = Arc::new(AtomicUsize::new(0));
        let canceler = registry.observe_traces({
            let announced = announced.clone();
            move |_| {
                announced.fetch_add(1, Ordering::SeqCst);
            }
        });

        let trace = Trace::new(new_id());
        let remote_parent = new_id();
        let mut ctx = Context::new();
        let guard = func.remote_trace(&mut ctx, remote_parent, trace.clone());
        let span = ctx.span().unwrap().clone();
        assert_eq!(span.trace().id(), trace.id());
        assert_eq!(span.parent_id(), Some(remote_parent));
        assert!(span.parent().is_none());
        guard.success();

        assert_eq!(announced.load(Ordering::SeqCst), 1);
        canceler.cancel();
    }

    #[test]
    fn orphan_accounting() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let parent_func = scope.func_named("parent");
        let child_func = scope.func_named("child");

        let mut ctx = Context::new();
        let parent_guard = parent_func.task(&mut ctx);
        let mut child_ctx = ctx.clone();
        let child_guard = child_func.task(&mut child_ctx);
        let child_span = child_ctx.span().unwrap().clone();

        // parent ends while the child is still live
        parent_guard.success();
        assert!(child_span.is_orphaned());
        let mut orphans = Vec::new();
        registry.orphaned_spans(&mut |s| orphans.push(s.id()));
        assert_eq!(orphans, [child_span.id()]);

        child_guard.success();
        let mut orphans = Vec::new();
        registry.orphaned_spans(&mut |s| orphans.push(s.id()));
        assert!(orphans.is_empty());
        let mut live = Vec::new();
        registry.root_spans(&mut |s| live.push(s.id()));
        assert!(live.is_empty());
    }

    #[test]
    fn run_records_result_outcome() {
        let registry = Registry::new();
        let scope = registry.package_named("pkg");
        let task = scope.task("work");

        let ok: Result<i32, std::io::Error> = task.run(&Context::new(), |_ctx| Ok(5));
        assert_eq!(ok.unwrap(), 5);

        let err: Result<(), std::io::Error> = task.run(&Context::new(), |_ctx| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        });
        assert!(err.is_err());

        let func = task.func();
        assert_eq!(func.success(), 1);
        assert_eq!(func.errors()["NotFound"], 1);
    }

    #[test]
    fn args_are_captured() {
        let registry = Registry::new();
        let func = registry.package_named("pkg").func_named("f");
        let mut ctx = Context::new();
        let guard = func.task_with_args(&mut ctx, vec!["7".into(), "alpha".into()]);
        assert_eq!(guard.span().args(), ["7", "alpha"]);
        guard.success();
    }
}
