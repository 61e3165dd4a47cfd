// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

//! Rate estimation over a small ring of time buckets.

use std::sync::{Arc, Weak};
use std::time::Duration;

use minstant::Instant;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::series::SeriesKey;
use crate::source::{StatCb, StatSource};

/// How many one-tick buckets a meter keeps.
pub const TICKS_TO_KEEP: usize = 4;

/// How long one meter bucket lasts.
pub const TIME_PER_TICK: Duration = Duration::from_secs(60);

/// Counts events and estimates their recent rate.
///
/// A meter keeps [`TICKS_TO_KEEP`] buckets of [`TIME_PER_TICK`] each.
/// [`Meter::mark`] adds to the newest bucket; a process-wide ticker
/// retires the oldest bucket each tick, but only while the newest bucket
/// has seen events, so rare events keep reporting their last non-zero
/// rate.
pub struct Meter {
    key: SeriesKey,
    state: Mutex<MeterState>,
}

struct MeterState {
    total: i64,
    last_tick: Instant,
    slices: [i64; TICKS_TO_KEEP],
}

impl Meter {
    /// Creates a meter and registers it with the process ticker.
    pub fn new(key: SeriesKey) -> Arc<Meter> {
        let meter = Arc::new(Meter {
            key,
            state: Mutex::new(MeterState {
                total: 0,
                last_tick: Instant::now(),
                slices: [0; TICKS_TO_KEEP],
            }),
        });
        TICKER.register(&meter);
        meter
    }

    /// Records `amount` events.
    pub fn mark(&self, amount: i64) {
        let mut state = self.state.lock();
        state.slices[TICKS_TO_KEEP - 1] += amount;
    }

    /// Overrides the finalized total (events retired from the window).
    pub fn set_total(&self, total: i64) {
        self.state.lock().total = total;
    }

    pub(crate) fn tick(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.slices[TICKS_TO_KEEP - 1] == 0 {
            return;
        }
        state.total += state.slices[0];
        state.slices.rotate_left(1);
        state.slices[TICKS_TO_KEEP - 1] = 0;
        state.last_tick = now;
    }

    pub(crate) fn rate_and_total(&self, now: Instant) -> (f64, i64) {
        let (current, total, last_tick) = {
            let state = self.state.lock();
            (
                state.slices.iter().sum::<i64>(),
                state.total,
                state.last_tick,
            )
        };
        // age of the oldest bucket in the window
        let age = (now - last_tick) + TIME_PER_TICK * (TICKS_TO_KEEP as u32 - 1);
        let secs = age.as_secs_f64();
        let rate = if secs > 0.0 { current as f64 / secs } else { 0.0 };
        (rate, total + current)
    }
}

impl StatSource for Meter {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let (rate, total) = self.rate_and_total(Instant::now());
        cb(&self.key, "rate", rate);
        cb(&self.key, "total", total as f64);
    }
}

/// A derived source reporting the difference between two meters.
pub struct DiffMeter {
    key: SeriesKey,
    minuend: Arc<Meter>,
    subtrahend: Arc<Meter>,
}

impl DiffMeter {
    pub fn new(key: SeriesKey, minuend: Arc<Meter>, subtrahend: Arc<Meter>) -> Self {
        DiffMeter {
            key,
            minuend,
            subtrahend,
        }
    }
}

impl StatSource for DiffMeter {
    fn stats(&self, cb: &mut StatCb<'_>) {
        let now = Instant::now();
        let (rate_a, total_a) = self.minuend.rate_and_total(now);
        let (rate_b, total_b) = self.subtrahend.rate_and_total(now);
        cb(&self.key, "rate", rate_a - rate_b);
        cb(&self.key, "total", (total_a - total_b) as f64);
    }
}

static TICKER: Lazy<Ticker> = Lazy::new(|| Ticker {
    state: Mutex::new(TickerState {
        started: false,
        meters: Vec::new(),
    }),
});

struct Ticker {
    state: Mutex<TickerState>,
}

struct TickerState {
    started: bool,
    meters: Vec<Weak<Meter>>,
}

impl Ticker {
    fn register(&self, meter: &Arc<Meter>) {
        let mut state = self.state.lock();
        if !state.started {
            state.started = true;
            std::thread::Builder::new()
                .name("minimon-meter-ticker".into())
                .spawn(run_ticker)
                .expect("failed to spawn meter ticker");
        }
        state.meters.push(Arc::downgrade(meter));
    }

    fn snapshot(&self) -> Vec<Arc<Meter>> {
        let mut state = self.state.lock();
        state.meters.retain(|weak| weak.strong_count() > 0);
        state.meters.iter().filter_map(Weak::upgrade).collect()
    }
}

fn run_ticker() {
    loop {
        std::thread::sleep(TIME_PER_TICK);
        let now = Instant::now();
        for meter in TICKER.snapshot() {
            meter.tick(now);
        }
    }
}
