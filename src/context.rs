// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! The per-request value propagation channel.
//!
//! A [`Context`] is a cheap-to-clone handle carrying the current [`Span`],
//! an opaque type-keyed value store, an optional cancellation channel, and
//! an optional deadline. Instrumented functions take it by mutable
//! reference so the task wrapper can swap in a child context holding the
//! new span.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use minstant::Instant;

use crate::span::Span;

type ValueMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

#[derive(Clone, Default)]
pub struct Context {
    span: Option<Arc<Span>>,
    values: Option<Arc<ValueMap>>,
    done: Option<Receiver<()>>,
    deadline: Option<Instant>,
}

impl Context {
    /// An empty context: no span, no values, never cancelled.
    pub fn new() -> Context {
        Context::default()
    }

    /// The span currently propagating through this context, if any.
    pub fn span(&self) -> Option<&Arc<Span>> {
        self.span.as_ref()
    }

    pub(crate) fn with_span(&self, span: Arc<Span>) -> Context {
        let mut ctx = self.clone();
        ctx.span = Some(span);
        ctx
    }

    /// Returns a context carrying `val`, keyed by its type.
    pub fn with_value<T: Any + Send + Sync>(&self, val: T) -> Context {
        let mut values: ValueMap = match &self.values {
            Some(values) => (**values).clone(),
            None => HashMap::new(),
        };
        values.insert(TypeId::of::<T>(), Arc::new(val));
        let mut ctx = self.clone();
        ctx.values = Some(Arc::new(values));
        ctx
    }

    /// Looks up a value stored with [`Context::with_value`].
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let values = self.values.as_ref()?;
        values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast().ok())
    }

    /// Returns a cancellable child context and the handle that cancels
    /// it. Dropping the handle also cancels.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let (tx, rx) = unbounded();
        let mut ctx = self.clone();
        ctx.done = Some(rx);
        (ctx, CancelHandle { _tx: tx })
    }

    /// A receiver that becomes ready when the context is cancelled.
    /// `None` for contexts with no cancellation attached.
    pub fn done(&self) -> Option<&Receiver<()>> {
        self.done.as_ref()
    }

    pub fn is_done(&self) -> bool {
        match &self.done {
            None => false,
            Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
        }
    }

    /// Returns a context with an advisory deadline attached.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let mut ctx = self.clone();
        ctx.deadline = Some(deadline);
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span.as_ref().map(|s| s.id()))
            .field("cancellable", &self.done.is_some())
            .finish()
    }
}

/// Cancels the context it was created with. Cancellation is level-
/// triggered and permanent.
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {}
}
