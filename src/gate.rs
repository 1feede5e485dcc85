/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::sync::atomic::{AtomicI64, Ordering};

/// Boolean rate limiter with plain (non-atomic) semantics.
#[repr(transparent)]
pub(crate) struct IntervalGate<const FREQ: i64>(i64);

impl<const FREQ: i64> Default for IntervalGate<FREQ> {
    #[inline(always)]
    fn default() -> Self {
        Self(0)
    }
}

impl<const FREQ: i64> IntervalGate<FREQ> {
    #[inline(always)]
    pub fn gate(&mut self, time: i64) -> bool {
        if (time - self.0) >= FREQ {
            self.0 = time;
            true
        } else {
            false
        }
    }
}

/// Boolean rate limiter with atomic (thread safe) semantics.
#[repr(transparent)]
pub(crate) struct AtomicIntervalGate<const FREQ: i64>(AtomicI64);

impl<const FREQ: i64> Default for AtomicIntervalGate<FREQ> {
    #[inline(always)]
    fn default() -> Self {
        Self(AtomicI64::new(0))
    }
}

impl<const FREQ: i64> AtomicIntervalGate<FREQ> {
    #[inline(always)]
    pub fn gate(&self, time: i64) -> bool {
        let prev_time = self.0.load(Ordering::Acquire);
        if (time - prev_time) < FREQ {
            false
        } else {
            self.0.store(time, Ordering::Release);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_limit_by_interval() {
        let mut g: IntervalGate<100> = Default::default();
        assert!(g.gate(100));
        assert!(!g.gate(150));
        assert!(g.gate(200));

        let ag: AtomicIntervalGate<100> = Default::default();
        assert!(ag.gate(100));
        assert!(!ag.gate(199));
        assert!(ag.gate(200));
    }
}
