// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Series keys and tag sets.
//!
//! A [`SeriesKey`] is a measurement name plus a [`TagSet`]; a [`Series`]
//! adds a field name. The formatted form is the influx-style line
//! `measurement,k=v,k2=v2 field`, with `,`, `=` and ` ` escaped by `\`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

static NO_TAGS: Lazy<BTreeMap<String, String>> = Lazy::new(BTreeMap::new);

/// An immutable collection of string key-value pairs, cheap to extend.
///
/// Internally each `TagSet` is a layer holding its own pairs plus a shared
/// link to a parent layer. [`TagSet::set`] and [`TagSet::apply`] are O(1);
/// the flattened view is materialized lazily on first read and cached, as
/// is the escaped string form.
#[derive(Clone, Default)]
pub struct TagSet {
    inner: Option<Arc<Layer>>,
}

struct Layer {
    parent: TagSet,
    kvs: BTreeMap<String, String>,
    all: OnceCell<BTreeMap<String, String>>,
    formatted: OnceCell<String>,
}

impl TagSet {
    /// Returns an empty tag set.
    #[inline]
    pub fn new() -> Self {
        TagSet::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns a tag set with `key` associated to `value`, shadowing any
    /// value from this set.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> TagSet {
        let mut kvs = BTreeMap::new();
        kvs.insert(key.into(), value.into());
        self.child(kvs)
    }

    /// Returns a tag set reflecting `self` overridden by every pair in
    /// `other`. O(1) in the number of keys of either set.
    pub fn apply(&self, other: &TagSet) -> TagSet {
        if other.is_empty() {
            return self.clone();
        }
        self.child(other.all().clone())
    }

    fn child(&self, kvs: BTreeMap<String, String>) -> TagSet {
        TagSet {
            inner: Some(Arc::new(Layer {
                parent: self.clone(),
                kvs,
                all: OnceCell::new(),
                formatted: OnceCell::new(),
            })),
        }
    }

    /// Looks `key` up in the flattened view.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.all().get(key).map(String::as_str)
    }

    /// The flattened view: parent pairs overridden by this layer's pairs,
    /// iterated in lexicographic key order.
    pub fn all(&self) -> &BTreeMap<String, String> {
        match &self.inner {
            None => &NO_TAGS,
            Some(layer) => layer.all.get_or_init(|| {
                let mut all = layer.parent.all().clone();
                for (key, value) in &layer.kvs {
                    all.insert(key.clone(), value.clone());
                }
                all
            }),
        }
    }

    /// The cached `k=v,k2=v2` form with escaping applied.
    pub fn format(&self) -> &str {
        match &self.inner {
            None => "",
            Some(layer) => layer.formatted.get_or_init(|| {
                let mut out = String::new();
                for (i, (key, value)) in self.all().iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_escaped(&mut out, key);
                    out.push('=');
                    write_escaped(&mut out, value);
                }
                out
            }),
        }
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.all() == other.all()
    }
}

impl Eq for TagSet {}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.format())
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.all().iter()).finish()
    }
}

/// A measurement name plus its tags. Identifies a stream of fields.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SeriesKey {
    measurement: String,
    tags: TagSet,
}

impl SeriesKey {
    pub fn new(measurement: impl Into<String>) -> Self {
        SeriesKey {
            measurement: measurement.into(),
            tags: TagSet::new(),
        }
    }

    /// Returns a key with one more tag set.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<String>) -> SeriesKey {
        SeriesKey {
            measurement: self.measurement.clone(),
            tags: self.tags.set(key, value),
        }
    }

    /// Returns a key with the measurement replaced, tags kept.
    pub fn with_measurement(&self, measurement: impl Into<String>) -> SeriesKey {
        SeriesKey {
            measurement: measurement.into(),
            tags: self.tags.clone(),
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Pairs the key with a field name, yielding a full [`Series`].
    pub fn with_field(&self, field: impl Into<String>) -> Series {
        Series {
            key: self.clone(),
            field: field.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_escaped(&mut out, &self.measurement);
        f.write_str(&out)?;
        if !self.tags.is_empty() {
            write!(f, ",{}", self.tags.format())?;
        }
        Ok(())
    }
}

/// A series key plus a field name: one fully-qualified value stream.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Series {
    pub key: SeriesKey,
    pub field: String,
}

impl Series {
    /// Parses the canonical `measurement,k=v field` form, undoing the
    /// escape rules. Returns `None` on malformed input.
    pub fn parse(s: &str) -> Option<Series> {
        let (head, field) = split_unescaped(s, ' ')?;
        let mut pieces = split_all_unescaped(head, ',');
        let measurement = unescape(pieces.next()?);
        let mut tags = TagSet::new();
        for piece in pieces {
            let (key, value) = split_unescaped(piece, '=')?;
            tags = tags.set(unescape(key), unescape(value));
        }
        Some(Series {
            key: SeriesKey {
                measurement,
                tags,
            },
            field: unescape(field),
        })
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut field = String::new();
        write_escaped(&mut field, &self.field);
        write!(f, "{} {}", self.key, field)
    }
}

fn write_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        if c == ',' || c == '=' || c == ' ' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits `s` at the first unescaped `sep` into (before, after).
fn split_unescaped(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((&s[..i], &s[i + c.len_utf8()..]));
        }
    }
    None
}

/// Splits `s` at every unescaped `sep`.
fn split_all_unescaped(s: &str, sep: char) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            pieces.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    pieces.push(&s[start..]);
    pieces.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_shadows_and_parent_is_untouched() {
        let ts0 = TagSet::new().set("k0", "0");
        let ts1 = ts0.set("k0", "1");
        let ts2 = ts0.set("k1", "2");

        assert_eq!(ts0.get("k0"), Some("0"));
        assert_eq!(ts0.get("k1"), None);
        assert_eq!(ts1.get("k0"), Some("1"));
        assert_eq!(ts2.get("k0"), Some("0"));
        assert_eq!(ts2.get("k1"), Some("2"));
    }

    #[test]
    fn apply_is_right_biased() {
        let base = TagSet::new().set("a", "1").set("b", "2");
        let overlay = TagSet::new().set("b", "3").set("c", "4");
        let merged = base.apply(&overlay);

        assert_eq!(merged.get("a"), Some("1"));
        assert_eq!(merged.get("b"), Some("3"));
        assert_eq!(merged.get("c"), Some("4"));

        // chained overlays flatten to the right-biased union
        let more = TagSet::new().set("a", "9");
        let merged = base.apply(&overlay).apply(&more);
        let all = merged.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all["a"], "9");
        assert_eq!(all["b"], "3");
        assert_eq!(all["c"], "4");
    }

    #[test]
    fn apply_empty_is_identity() {
        let base = TagSet::new().set("a", "1");
        let same = base.apply(&TagSet::new());
        assert_eq!(base, same);
    }

    #[test]
    fn flattened_order_is_lexicographic() {
        let ts = TagSet::new().set("b", "2").set("a", "1").set("c", "3");
        let keys: Vec<_> = ts.all().keys().cloned().collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(ts.format(), "a=1,b=2,c=3");
    }

    #[test]
    fn format_escapes_specials() {
        let ts = TagSet::new().set("k,ey", "v=al ue");
        assert_eq!(ts.format(), r"k\,ey=v\=al\ ue");
    }

    #[test]
    fn series_round_trip() {
        let series = SeriesKey::new("mea,sure ment")
            .with_tag("k,ey", "v=alue")
            .with_tag("plain", "with space")
            .with_field("fi=eld");
        let formatted = series.to_string();
        let parsed = Series::parse(&formatted).unwrap();
        assert_eq!(parsed, series);
        assert_eq!(parsed.to_string(), formatted);
    }

    #[test]
    fn series_round_trip_no_tags() {
        let series = SeriesKey::new("m").with_field("f");
        assert_eq!(series.to_string(), "m f");
        assert_eq!(Series::parse("m f").unwrap(), series);
    }

    #[test]
    fn parse_rejects_missing_field() {
        assert!(Series::parse("no_field_here").is_none());
        assert!(Series::parse(r"escaped\ space").is_none());
    }
}
