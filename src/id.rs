// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

static ID_STATE: Lazy<IdState> = Lazy::new(|| IdState {
    counter: AtomicU64::new(rand::random()),
    // An odd stride walks the whole 2^64 ring before repeating.
    stride: rand::random::<u64>() | 3,
});

struct IdState {
    counter: AtomicU64,
    stride: u64,
}

/// Returns a process-unique non-negative integer, used for trace, span,
/// and function ids.
#[inline]
pub fn new_id() -> i64 {
    let state = &*ID_STATE;
    let id = state
        .counter
        .fetch_add(state.stride, Ordering::Relaxed)
        .wrapping_add(state.stride);
    (id >> 1) as i64
}
