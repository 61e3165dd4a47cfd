// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! In-process instrumentation: per-function call statistics, bounded-
//! memory distributions, and a span/trace collector, all exposed as a
//! pull-based stream of `(series, field, value)` tuples.
//!
//! ## Function stats
//!
//! Annotate a function with a task; every invocation updates the
//! function's concurrency gauges, duration distributions, and error
//! taxonomy:
//!
//! ```
//! use once_cell::sync::Lazy;
//! use minimon::{func_name, Context, Scope};
//!
//! static MON: Lazy<Scope> = Lazy::new(|| minimon::package!());
//!
//! fn fetch(ctx: &Context) -> Result<u32, std::io::Error> {
//!     MON.task(func_name!()).run(ctx, |_ctx| {
//!         // do the work
//!         Ok(42)
//!     })
//! }
//!
//! assert_eq!(fetch(&Context::new()).unwrap(), 42);
//! ```
//!
//! ## Pulling stats
//!
//! ```
//! use minimon::{collect, Registry};
//!
//! let registry = Registry::new();
//! registry.package_named("app").counter("requests").inc(1);
//!
//! for (series, value) in collect(&registry) {
//!     println!("{} {}", series, value);
//! }
//! ```
//!
//! ## Watching spans
//!
//! The [`collect`] module can capture the finished subtree of any live
//! trace through matcher-driven observers.

mod context;
mod counter;
mod dist;
mod func;
mod funcstats;
mod id;
mod macros;
mod meter;
mod registry;
mod rng;
mod scope;
mod series;
mod source;
mod span;
mod task;
mod timer;
mod trace;
mod val;

pub mod collect;

pub use context::{CancelHandle, Context};
pub use counter::Counter;
pub use dist::{
    set_window, window, Dist, DistValue, DurationDist, FloatDist, IntDist, OBSERVED_QUANTILES,
    RESERVOIR_SIZE,
};
pub use func::{set_error_classifier, Func, SpanError};
pub use funcstats::{FuncStats, ObservedCall};
pub use id::new_id;
#[doc(hidden)]
pub use macros::short_fn_name;
pub use meter::{DiffMeter, Meter, TICKS_TO_KEEP, TIME_PER_TICK};
pub use registry::{default_registry, Registry};
pub use scope::{Gauge, Scope};
pub use series::{Series, SeriesKey, TagSet};
pub use source::{collect, stat_source_from_struct, StatCb, StatSource, StructSource, StructStats};
pub use span::Span;
pub use task::{Task, TaskGuard};
pub use timer::{RunningTimer, Timer};
pub use trace::{Canceler, Sampled, SpanObserver, Trace};
pub use val::{
    BoolVal, DurationVal, FloatVal, IntVal, StructObservation, StructVal,
    STRUCT_VAL_OBSERVATIONS,
};
