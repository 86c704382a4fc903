//! Worker selection per call

use std::time::{Duration, Instant};

use goro_ipc::{Uid, STALE_AFTER_MS};

/// How the pool picks a worker for each call.
///
/// `RoundRobin` walks the pool by uid; `LeastTime` prefers the worker whose
/// liveness tick is most recent. Round-robin over a pool that has not yet
/// grown to its maximum falls back to `LeastTime`; until then there is no
/// stable modulus to walk by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMethod {
    RoundRobin,
    LeastTime,
}

/// Outcome of a selection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Selection {
    pub index: usize,
    /// The pick has not ticked for a second; scale up if the pool allows
    pub stale: bool,
}

/// Pick a worker for `uid` given the pool's latest tick instants.
/// Returns `None` on an empty pool; the caller falls back to a local call.
pub(crate) fn select_worker(
    last_ticks: &[Instant],
    method: DispatchMethod,
    at_max: bool,
    uid: Uid,
    now: Instant,
) -> Option<Selection> {
    if last_ticks.is_empty() {
        return None;
    }

    let index = if method == DispatchMethod::RoundRobin && at_max {
        (uid % last_ticks.len() as u64) as usize
    } else {
        // Most recently responsive worker
        last_ticks
            .iter()
            .enumerate()
            .max_by_key(|(_, tick)| **tick)
            .map(|(i, _)| i)?
    };

    let stale = now.duration_since(last_ticks[index]) >= Duration::from_millis(STALE_AFTER_MS);
    Some(Selection { index, stale })
}
