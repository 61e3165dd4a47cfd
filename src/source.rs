// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! The abstract pull interface implemented by every stat source.

use std::collections::BTreeMap;

use crate::series::SeriesKey;

/// The callback a [`StatSource`] streams `(key, field, value)` tuples
/// into.
pub type StatCb<'a> = dyn FnMut(&SeriesKey, &str, f64) + 'a;

/// Anything that can enumerate named floating point values on demand.
pub trait StatSource: Send + Sync {
    fn stats(&self, cb: &mut StatCb<'_>);
}

/// Drains a source into a map keyed by the formatted series string.
/// Equivalent to accumulating every `stats` callback invocation.
pub fn collect(source: &dyn StatSource) -> BTreeMap<String, f64> {
    let mut rv = BTreeMap::new();
    source.stats(&mut |key, field, val| {
        rv.insert(key.with_field(field).to_string(), val);
    });
    rv
}

/// Field enumeration for user structs.
///
/// A type lists its scalar fields explicitly. Nested structs
/// conventionally use dotted names, and fields are skipped by simply not
/// emitting them.
///
/// ```
/// use minimon::StructStats;
///
/// struct PoolStats {
///     active: i64,
///     idle: i64,
/// }
///
/// impl StructStats for PoolStats {
///     fn struct_stats(&self, cb: &mut dyn FnMut(&str, f64)) {
///         cb("active", self.active as f64);
///         cb("idle", self.idle as f64);
///     }
/// }
/// ```
pub trait StructStats {
    fn struct_stats(&self, cb: &mut dyn FnMut(&str, f64));
}

/// Adapts a [`StructStats`] value into a [`StatSource`] emitting under
/// `key`.
pub fn stat_source_from_struct<T>(key: SeriesKey, data: T) -> StructSource<T>
where
    T: StructStats + Send + Sync,
{
    StructSource { key, data }
}

/// The adapter returned by [`stat_source_from_struct`].
pub struct StructSource<T> {
    key: SeriesKey,
    data: T,
}

impl<T> StatSource for StructSource<T>
where
    T: StructStats + Send + Sync,
{
    fn stats(&self, cb: &mut StatCb<'_>) {
        self.data.struct_stats(&mut |name, val| cb(&self.key, name, val));
    }
}
