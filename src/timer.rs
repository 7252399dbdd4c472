// Copyright 2026 The skein Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Monotonic clock and the deadline tree.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::runtime::CoroId;

/// Current monotonic time in milliseconds.
///
/// The zero point is unspecified; only differences are meaningful. The
/// value never decreases.
pub fn now() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as i64 * 1_000 + ts.tv_nsec as i64 / 1_000_000
}

pub(crate) type TimerKey = (i64, u64);

/// Deadlines of suspended coroutines, ordered by expiry.
///
/// Equal expiries are disambiguated by a monotone sequence number, so a
/// key removes exactly the node it was handed out for.
pub(crate) struct TimerTree {
    map: BTreeMap<TimerKey, CoroId>,
    seq: u64,
}

impl TimerTree {
    pub fn new() -> TimerTree {
        TimerTree { map: BTreeMap::new(), seq: 0 }
    }

    pub fn insert(&mut self, expiry: i64, coro: CoroId) -> TimerKey {
        self.seq += 1;
        let key = (expiry, self.seq);
        self.map.insert(key, coro);
        key
    }

    pub fn remove(&mut self, key: TimerKey) {
        self.map.remove(&key);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// How long the poller may block before the earliest deadline fires.
    /// `None` means there is no deadline at all.
    pub fn timeout(&self, now: i64) -> Option<Duration> {
        self.map
            .keys()
            .next()
            .map(|&(expiry, _)| Duration::from_millis((expiry - now).max(0) as u64))
    }

    #[inline]
    pub fn has_expired(&self, now: i64) -> bool {
        matches!(self.map.keys().next(), Some(&(expiry, _)) if expiry <= now)
    }

    /// Pop one expired node, earliest first.
    pub fn pop_expired(&mut self, now: i64) -> Option<(TimerKey, CoroId)> {
        let key = *self.map.keys().next().filter(|&&(expiry, _)| expiry <= now)?;
        let coro = self.map.remove(&key).unwrap();
        Some((key, coro))
    }
}
