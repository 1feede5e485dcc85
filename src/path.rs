/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::application::{CallContext, HostSystem};
use crate::defrag::{Assembled, Defragmenter, Fragment};

/// Key uniquely identifying a path in the topology map.
pub(crate) type PathKey = (i64, SocketAddr);

/// A (local socket, remote address) pair with liveness statistics.
///
/// Paths are interned by Topology so that every reference to the same
/// physical path is the same object, which lets statistics and the inbound
/// defragmenter live here. Paths hold no references to peers.
pub struct Path {
    pub local_socket: i64,
    pub address: SocketAddr,
    last_send_time_ticks: AtomicI64,
    last_receive_time_ticks: AtomicI64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    defrag: Mutex<Defragmenter>,
}

impl Path {
    pub fn new(local_socket: i64, address: SocketAddr) -> Self {
        Self {
            local_socket,
            address,
            last_send_time_ticks: AtomicI64::new(0),
            last_receive_time_ticks: AtomicI64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            defrag: Mutex::new(Defragmenter::new()),
        }
    }

    #[inline(always)]
    pub(crate) fn key(&self) -> PathKey {
        (self.local_socket, self.address)
    }

    /// Record that any datagram, valid or not, arrived on this path.
    pub fn received(&self, cc: &CallContext, bytes: usize) {
        self.last_receive_time_ticks.store(cc.ticks, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Send raw bytes over this path via the host's socket.
    pub fn send<H: HostSystem>(&self, host: &H, cc: &CallContext, data: &[u8]) -> bool {
        if host.wire_send(self.local_socket, &self.address, data) {
            self.last_send_time_ticks.store(cc.ticks, Ordering::Relaxed);
            self.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    #[inline(always)]
    pub fn last_send_time_ticks(&self) -> i64 {
        self.last_send_time_ticks.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_receive_time_ticks(&self) -> i64 {
        self.last_receive_time_ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn receive_fragment(&self, packet_id: u64, fragment: Fragment, fragment_no: u8, total_fragments: u8, now: i64) -> Assembled {
        self.defrag.lock().assemble(packet_id, fragment, fragment_no, total_fragments, now)
    }

    /// Periodic upkeep: expire stale partial packets.
    pub(crate) fn service(&self, cc: &CallContext) {
        self.defrag.lock().service(cc.ticks);
    }
}
