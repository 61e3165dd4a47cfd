// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Named containers of stat sources, one per package.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::counter::Counter;
use crate::func::Func;
use crate::meter::{DiffMeter, Meter};
use crate::registry::{Registry, RegistryInner};
use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};
use crate::timer::Timer;
use crate::val::{BoolVal, DurationVal, FloatVal, IntVal, StructVal};

/// A sampled callback source. Registered through [`Scope::gauge`];
/// re-registering under the same name replaces the callback.
pub struct Gauge {
    key: SeriesKey,
    cb: Box<dyn Fn() -> f64 + Send + Sync>,
}

impl StatSource for Gauge {
    fn stats(&self, cb: &mut StatCb<'_>) {
        cb(&self.key, "value", (self.cb)())
    }
}

#[derive(Clone)]
enum SourceSlot {
    Func(Arc<Func>),
    Counter(Arc<Counter>),
    Meter(Arc<Meter>),
    DiffMeter(Arc<DiffMeter>),
    IntVal(Arc<IntVal>),
    FloatVal(Arc<FloatVal>),
    DurationVal(Arc<DurationVal>),
    BoolVal(Arc<BoolVal>),
    StructVal(Arc<StructVal>),
    Timer(Arc<Timer>),
    Gauge(Arc<Gauge>),
    Chain(Arc<dyn StatSource>),
}

impl SourceSlot {
    fn as_source(&self) -> &dyn StatSource {
        match self {
            SourceSlot::Func(s) => s.as_ref(),
            SourceSlot::Counter(s) => s.as_ref(),
            SourceSlot::Meter(s) => s.as_ref(),
            SourceSlot::DiffMeter(s) => s.as_ref(),
            SourceSlot::IntVal(s) => s.as_ref(),
            SourceSlot::FloatVal(s) => s.as_ref(),
            SourceSlot::DurationVal(s) => s.as_ref(),
            SourceSlot::BoolVal(s) => s.as_ref(),
            SourceSlot::StructVal(s) => s.as_ref(),
            SourceSlot::Timer(s) => s.as_ref(),
            SourceSlot::Gauge(s) => s.as_ref(),
            SourceSlot::Chain(s) => s.as_ref(),
        }
    }
}

/// A named container of stat sources, belonging to a [`Registry`].
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    registry: Weak<RegistryInner>,
    name: String,
    sources: RwLock<HashMap<String, SourceSlot>>,
}

impl Scope {
    pub(crate) fn new(registry: Weak<RegistryInner>, name: String) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                registry,
                name,
                sources: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn registry(&self) -> Option<Registry> {
        self.inner.registry.upgrade().map(Registry::from_inner)
    }

    pub(crate) fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Looks `name` up under a read lock; registers a fresh source under a
    /// write lock on miss. A hit of the expected kind returns the shared
    /// instance; a hit of any other kind is a programming error.
    fn get_or_register<T>(
        &self,
        name: &str,
        make: impl FnOnce() -> SourceSlot,
        extract: impl Fn(&SourceSlot) -> Option<T>,
    ) -> T {
        let sources = self.inner.sources.upgradable_read();
        if let Some(slot) = sources.get(name) {
            return match extract(slot) {
                Some(found) => found,
                None => panic!(
                    "{:?} in scope {:?} already used for another stats source kind",
                    name, self.inner.name
                ),
            };
        }
        let mut sources = RwLockUpgradableReadGuard::upgrade(sources);
        let slot = make();
        let found = extract(&slot).expect("freshly constructed slot has the requested kind");
        sources.insert(name.to_string(), slot);
        found
    }

    fn key(kind: &str, name: &str) -> SeriesKey {
        SeriesKey::new(kind).with_tag("name", name)
    }

    /// Returns (creating on first use) the named function's stats.
    pub fn func_named(&self, name: &str) -> Arc<Func> {
        self.get_or_register(
            name,
            || SourceSlot::Func(Func::new(self.clone(), name.to_string())),
            |slot| match slot {
                SourceSlot::Func(f) => Some(f.clone()),
                _ => None,
            },
        )
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.get_or_register(
            name,
            || SourceSlot::Counter(Arc::new(Counter::new(Self::key("counter", name)))),
            |slot| match slot {
                SourceSlot::Counter(c) => Some(c.clone()),
                _ => None,
            },
        )
    }

    pub fn meter(&self, name: &str) -> Arc<Meter> {
        self.get_or_register(
            name,
            || SourceSlot::Meter(Meter::new(Self::key("meter", name))),
            |slot| match slot {
                SourceSlot::Meter(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    /// Registers a derived source reporting `minuend - subtrahend`.
    pub fn diff_meter(
        &self,
        name: &str,
        minuend: Arc<Meter>,
        subtrahend: Arc<Meter>,
    ) -> Arc<DiffMeter> {
        self.get_or_register(
            name,
            || {
                SourceSlot::DiffMeter(Arc::new(DiffMeter::new(
                    Self::key("diff_meter", name),
                    minuend,
                    subtrahend,
                )))
            },
            |slot| match slot {
                SourceSlot::DiffMeter(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn int_val(&self, name: &str) -> Arc<IntVal> {
        self.get_or_register(
            name,
            || SourceSlot::IntVal(Arc::new(IntVal::new(Self::key("int_val", name)))),
            |slot| match slot {
                SourceSlot::IntVal(v) => Some(v.clone()),
                _ => None,
            },
        )
    }

    pub fn float_val(&self, name: &str) -> Arc<FloatVal> {
        self.get_or_register(
            name,
            || SourceSlot::FloatVal(Arc::new(FloatVal::new(Self::key("float_val", name)))),
            |slot| match slot {
                SourceSlot::FloatVal(v) => Some(v.clone()),
                _ => None,
            },
        )
    }

    pub fn duration_val(&self, name: &str) -> Arc<DurationVal> {
        self.get_or_register(
            name,
            || {
                SourceSlot::DurationVal(Arc::new(DurationVal::new(Self::key(
                    "duration_val",
                    name,
                ))))
            },
            |slot| match slot {
                SourceSlot::DurationVal(v) => Some(v.clone()),
                _ => None,
            },
        )
    }

    pub fn bool_val(&self, name: &str) -> Arc<BoolVal> {
        self.get_or_register(
            name,
            || SourceSlot::BoolVal(Arc::new(BoolVal::new(Self::key("bool_val", name)))),
            |slot| match slot {
                SourceSlot::BoolVal(v) => Some(v.clone()),
                _ => None,
            },
        )
    }

    pub fn struct_val(&self, name: &str) -> Arc<StructVal> {
        self.get_or_register(
            name,
            || SourceSlot::StructVal(Arc::new(StructVal::new(Self::key("struct_val", name)))),
            |slot| match slot {
                SourceSlot::StructVal(v) => Some(v.clone()),
                _ => None,
            },
        )
    }

    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.get_or_register(
            name,
            || SourceSlot::Timer(Arc::new(Timer::new(Self::key("timer", name)))),
            |slot| match slot {
                SourceSlot::Timer(t) => Some(t.clone()),
                _ => None,
            },
        )
    }

    /// Registers (or replaces) a gauge sampled on every stats pull.
    pub fn gauge(&self, name: &str, cb: impl Fn() -> f64 + Send + Sync + 'static) {
        let gauge = Arc::new(Gauge {
            key: Self::key("gauge", name),
            cb: Box::new(cb),
        });
        let mut sources = self.inner.sources.write();
        match sources.get(name) {
            None | Some(SourceSlot::Gauge(_)) => {
                sources.insert(name.to_string(), SourceSlot::Gauge(gauge));
            }
            Some(_) => panic!(
                "{:?} in scope {:?} already used for another stats source kind",
                name, self.inner.name
            ),
        }
    }

    /// Registers (or replaces) an externally-owned source under `name`.
    pub fn chain(&self, name: &str, source: Arc<dyn StatSource>) {
        let mut sources = self.inner.sources.write();
        match sources.get(name) {
            None | Some(SourceSlot::Chain(_)) => {
                sources.insert(name.to_string(), SourceSlot::Chain(source));
            }
            Some(_) => panic!(
                "{:?} in scope {:?} already used for another stats source kind",
                name, self.inner.name
            ),
        }
    }

    /// Marks one occurrence of the named event.
    pub fn event(&self, name: &str) {
        self.meter(name).mark(1)
    }

    /// Calls `cb` for every function registered in this scope.
    pub fn funcs(&self, cb: &mut dyn FnMut(&Arc<Func>)) {
        let funcs: Vec<Arc<Func>> = {
            let sources = self.inner.sources.read();
            sources
                .values()
                .filter_map(|slot| match slot {
                    SourceSlot::Func(f) => Some(f.clone()),
                    _ => None,
                })
                .collect()
        };
        for func in &funcs {
            cb(func);
        }
    }

}

/// Streams every source's stats in lexicographic source-name order,
/// tagging each emitted key with `scope=<name>`. The ordering is a
/// contract.
impl StatSource for Scope {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let mut sources: Vec<(String, SourceSlot)> = {
            let sources = self.inner.sources.read();
            sources
                .iter()
                .map(|(name, slot)| (name.clone(), slot.clone()))
                .collect()
        };
        sources.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, slot) in &sources {
            slot.as_source().stats(&mut |key, field, val| {
                cb(&key.with_tag("scope", &self.inner.name), field, val)
            });
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("name", &self.inner.name).finish()
    }
}
