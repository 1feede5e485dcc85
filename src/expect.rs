/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::proto::EXPECT_TTL;

/// Hard bound on tracked in-flight request packet IDs.
const EXPECT_CAPACITY_MAX: usize = 4096;

/// Registry of outgoing packet IDs for which an OK or ERROR reply would be
/// legitimate. Unsolicited replies are rejected by consulting this.
pub(crate) struct Expect {
    sent: Mutex<HashMap<u64, i64>>,
}

impl Expect {
    pub fn new() -> Self {
        Self { sent: Mutex::new(HashMap::new()) }
    }

    /// Record that a packet with this ID was just sent and a reply is expected.
    pub fn sending(&self, packet_id: u64, now: i64) {
        let mut sent = self.sent.lock();
        if sent.len() >= EXPECT_CAPACITY_MAX {
            sent.retain(|_, t| (now - *t) <= EXPECT_TTL);
            if sent.len() >= EXPECT_CAPACITY_MAX {
                sent.clear();
            }
        }
        sent.insert(packet_id, now);
    }

    /// Check whether a reply naming this packet ID should be accepted, and
    /// consume the expectation so a reply is accepted at most once.
    pub fn expecting(&self, packet_id: u64, now: i64) -> bool {
        self.sent.lock().remove(&packet_id).map_or(false, |t| (now - t) <= EXPECT_TTL)
    }

    /// Purge expired entries.
    pub fn service(&self, now: i64) {
        self.sent.lock().retain(|_, t| (now - *t) <= EXPECT_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_once_within_ttl() {
        let e = Expect::new();
        e.sending(1234, 1000);
        assert!(!e.expecting(99, 1000));
        assert!(e.expecting(1234, 1000 + EXPECT_TTL));
        assert!(!e.expecting(1234, 1000 + EXPECT_TTL));
    }

    #[test]
    fn expired_entries_rejected() {
        let e = Expect::new();
        e.sending(1, 1000);
        assert!(!e.expecting(1, 1001 + EXPECT_TTL));
        e.sending(2, 1000);
        e.service(5000);
        assert!(!e.expecting(2, 1000));
    }

    #[test]
    fn capacity_is_bounded() {
        let e = Expect::new();
        for i in 0..(EXPECT_CAPACITY_MAX as u64 * 2) {
            e.sending(i, i as i64);
        }
        assert!(e.sent.lock().len() <= EXPECT_CAPACITY_MAX);
    }
}
