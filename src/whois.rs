/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::Address;
use crate::path::Path;
use crate::proto::{MAX_WHOIS_WAITING_PACKETS, WHOIS_RETRY_COUNT_MAX, WHOIS_RETRY_DELAY};

/// A packet waiting for its source identity, plus the path it arrived on so
/// it can be authenticated and replayed once the identity is known.
type WaitingPacket = (Vec<u8>, Arc<Path>);

struct WhoisQueueItem {
    waiting: [Option<WaitingPacket>; MAX_WHOIS_WAITING_PACKETS],
    waiting_cursor: usize,
    retries: u16,
    last_retry: i64,
}

impl Default for WhoisQueueItem {
    fn default() -> Self {
        Self {
            waiting: Default::default(),
            waiting_cursor: 0,
            retries: 0,
            // So a fresh entry is immediately due even at tick zero.
            last_retry: -WHOIS_RETRY_DELAY,
        }
    }
}

/// Table of addresses whose identities are being looked up via the roots,
/// ringing up to `MAX_WHOIS_WAITING_PACKETS` packets per address until the
/// lookup resolves or is abandoned.
pub(crate) struct WhoisQueue {
    queue: Mutex<HashMap<Address, WhoisQueueItem>>,
}

impl WhoisQueue {
    pub fn new() -> Self {
        Self { queue: Mutex::new(HashMap::new()) }
    }

    /// Queue a packet from an unknown source. Returns true if an outgoing
    /// WHOIS is due now (i.e. none was sent within the retry delay).
    pub fn enqueue(&self, source: Address, packet: Vec<u8>, path: Arc<Path>, now: i64) -> bool {
        let mut queue = self.queue.lock();
        let item = queue.entry(source).or_default();
        let slot = item.waiting_cursor % MAX_WHOIS_WAITING_PACKETS;
        item.waiting_cursor = item.waiting_cursor.wrapping_add(1);
        item.waiting[slot] = Some((packet, path));
        (now - item.last_retry) >= WHOIS_RETRY_DELAY
    }

    /// The identity of this address became known; remove its entry and return
    /// the packets to replay, in arrival order.
    pub fn peer_arrived(&self, address: Address) -> Vec<WaitingPacket> {
        let mut out = Vec::new();
        if let Some(mut item) = self.queue.lock().remove(&address) {
            for i in 0..MAX_WHOIS_WAITING_PACKETS {
                let slot = (item.waiting_cursor + i) % MAX_WHOIS_WAITING_PACKETS;
                if let Some(p) = item.waiting[slot].take() {
                    out.push(p);
                }
            }
        }
        out
    }

    /// Collect the addresses whose lookup should be (re)transmitted now,
    /// bumping their retry counters.
    pub fn retry_due(&self, now: i64) -> Vec<Address> {
        let mut due = Vec::new();
        for (address, item) in self.queue.lock().iter_mut() {
            if (now - item.last_retry) >= WHOIS_RETRY_DELAY {
                item.last_retry = now;
                item.retries += 1;
                due.push(*address);
            }
        }
        due
    }

    pub fn retries(&self, address: Address) -> u16 {
        self.queue.lock().get(&address).map_or(0, |i| i.retries)
    }

    /// Abandon lookups that have exhausted their retries.
    pub fn service(&self, _now: i64) {
        self.queue.lock().retain(|_, item| item.retries <= WHOIS_RETRY_COUNT_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn test_path() -> Arc<Path> {
        Arc::new(Path::new(-1, SocketAddr::from_str("192.0.2.1:9993").unwrap()))
    }

    fn addr(v: u64) -> Address {
        Address::from_u64(v).unwrap()
    }

    #[test]
    fn ring_keeps_most_recent_packets() {
        let q = WhoisQueue::new();
        let path = test_path();
        for i in 0..(MAX_WHOIS_WAITING_PACKETS + 2) {
            q.enqueue(addr(5), vec![i as u8], path.clone(), 0);
        }
        let waiting = q.peer_arrived(addr(5));
        assert_eq!(waiting.len(), MAX_WHOIS_WAITING_PACKETS);
        // The two oldest packets were overwritten; order of the rest is preserved.
        assert_eq!(waiting[0].0, vec![2_u8]);
        assert_eq!(waiting.last().unwrap().0, vec![(MAX_WHOIS_WAITING_PACKETS + 1) as u8]);
        assert!(q.peer_arrived(addr(5)).is_empty());
    }

    #[test]
    fn retry_schedule() {
        let q = WhoisQueue::new();
        assert!(q.enqueue(addr(9), vec![1], test_path(), 0));
        assert_eq!(q.retry_due(0), vec![addr(9)]);
        assert_eq!(q.retries(addr(9)), 1);
        // Within the delay nothing is due and new packets don't retrigger.
        assert!(!q.enqueue(addr(9), vec![2], test_path(), WHOIS_RETRY_DELAY / 2));
        assert!(q.retry_due(WHOIS_RETRY_DELAY / 2).is_empty());
        assert_eq!(q.retry_due(WHOIS_RETRY_DELAY), vec![addr(9)]);
        assert_eq!(q.retries(addr(9)), 2);
    }

    #[test]
    fn exhausted_lookups_abandoned() {
        let q = WhoisQueue::new();
        q.enqueue(addr(9), vec![1], test_path(), 0);
        for r in 0..WHOIS_RETRY_COUNT_MAX as i64 {
            q.retry_due((r + 1) * WHOIS_RETRY_DELAY);
        }
        q.service(0);
        assert_eq!(q.retries(addr(9)), WHOIS_RETRY_COUNT_MAX);
        q.retry_due((WHOIS_RETRY_COUNT_MAX as i64 + 2) * WHOIS_RETRY_DELAY);
        q.service(0);
        assert_eq!(q.retries(addr(9)), 0);
        assert!(q.peer_arrived(addr(9)).is_empty());
    }
}
