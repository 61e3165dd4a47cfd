// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dist::DurationDist;
use crate::funcstats::FuncStats;
use crate::id::new_id;
use crate::scope::Scope;
use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};

/// Statistics for one named function within a [`Scope`]. Created on first
/// name resolution and kept for the life of the process.
pub struct Func {
    id: i64,
    scope: Scope,
    name: String,
    stats: FuncStats,
}

impl Func {
    pub(crate) fn new(scope: Scope, name: String) -> Arc<Func> {
        let key = SeriesKey::new("function").with_tag("name", &name);
        Arc::new(Func {
            id: new_id(),
            scope,
            name,
            stats: FuncStats::new(key),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The name without the scope prefix.
    pub fn short_name(&self) -> &str {
        &self.name
    }

    /// `scope.name` form, used for ordering live spans.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.scope.name(), self.name)
    }

    pub(crate) fn start(&self, parent: Option<&Arc<Func>>) {
        self.stats.start(parent)
    }

    pub(crate) fn end(&self, err: Option<&SpanError>, panicked: bool, duration: std::time::Duration) {
        self.stats.end(err, panicked, duration)
    }

    pub fn current(&self) -> i64 {
        self.stats.current()
    }

    pub fn highwater(&self) -> i64 {
        self.stats.highwater()
    }

    pub fn success(&self) -> i64 {
        self.stats.success()
    }

    pub fn panics(&self) -> i64 {
        self.stats.panics()
    }

    pub fn errors(&self) -> BTreeMap<String, i64> {
        self.stats.errors()
    }

    /// Calls `cb` once per distinct observed caller; `None` stands for
    /// trace-root invocations.
    pub fn parents(&self, cb: &mut dyn FnMut(Option<&Arc<Func>>)) {
        self.stats.parents(cb)
    }

    pub fn success_times(&self) -> DurationDist {
        self.stats.success_times()
    }

    pub fn failure_times(&self) -> DurationDist {
        self.stats.failure_times()
    }
}

impl StatSource for Func {
    fn stats(&self, cb: &mut StatCb<'_>) {
        self.stats.stats(cb)
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("id", &self.id)
            .field("name", &self.full_name())
            .finish()
    }
}

/// An error captured at span exit: a stable class name for aggregation
/// plus the rendered message for presentation.
#[derive(Clone, Debug)]
pub struct SpanError {
    class: String,
    message: String,
}

impl SpanError {
    pub fn capture(err: &(dyn std::error::Error + 'static)) -> SpanError {
        SpanError {
            class: classify(err),
            message: err.to_string(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SpanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

type Classifier = dyn Fn(&(dyn std::error::Error + 'static)) -> Option<String> + Send + Sync;

static CLASSIFIER: RwLock<Option<Box<Classifier>>> = RwLock::new(None);

/// Installs a process-wide error classifier mapping errors to stable,
/// bounded class names for the per-function error map. Returning `None`
/// falls back to the default classification.
pub fn set_error_classifier<F>(classifier: F)
where
    F: Fn(&(dyn std::error::Error + 'static)) -> Option<String> + Send + Sync + 'static,
{
    *CLASSIFIER.write() = Some(Box::new(classifier));
}

fn classify(err: &(dyn std::error::Error + 'static)) -> String {
    if let Some(classifier) = CLASSIFIER.read().as_ref() {
        if let Some(class) = classifier(err) {
            return class;
        }
    }
    default_class(err)
}

// The default recognizes io errors anywhere in the source chain and names
// their kind; `ErrorKind` is a bounded set, which keeps the error map
// bounded for arbitrary io failures.
fn default_class(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            return format!("{:?}", io_err.kind());
        }
        current = e.source();
    }
    "error".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn io_kinds_name_the_class() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(SpanError::capture(&err).class(), "ConnectionRefused");
    }

    #[test]
    fn source_chain_is_walked() {
        let err = Wrapped(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        let captured = SpanError::capture(&err);
        assert_eq!(captured.class(), "BrokenPipe");
        assert!(captured.message().starts_with("wrapped:"));
    }

    #[test]
    fn unrecognized_errors_share_one_class() {
        let err = std::fmt::Error;
        assert_eq!(SpanError::capture(&err).class(), "error");
    }

    #[derive(Debug)]
    struct QuotaExceeded;

    impl fmt::Display for QuotaExceeded {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "quota exceeded")
        }
    }

    impl std::error::Error for QuotaExceeded {}

    #[test]
    fn installed_classifier_takes_precedence() {
        // scoped to a marker type so concurrently running tests keep the
        // default classification for everything else
        set_error_classifier(|err| {
            err.downcast_ref::<QuotaExceeded>()
                .map(|_| "quota".to_string())
        });
        assert_eq!(SpanError::capture(&QuotaExceeded).class(), "quota");

        let io_err = std::io::Error::new(std::io::ErrorKind::WouldBlock, "busy");
        assert_eq!(SpanError::capture(&io_err).class(), "WouldBlock");
    }
}
