/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

use crate::application::{CallContext, HostSystem, StateObjectType};
use crate::buf::Buffer;
use crate::crypto::{hmac_sha384, zt_kbkdf_hmac_sha384, Secret, AES_CTR_KEY_SIZE, AES_CTR_NONCE_SIZE, HMAC_SHA384_SIZE, SALSA20_KEY_SIZE};
use crate::dictionary::Dictionary;
use crate::endpoint::marshal_inet_address;
use crate::gate::AtomicIntervalGate;
use crate::identity::Identity;
use crate::node::Node;
use crate::path::Path;
use crate::proto::{
    self, Cipher, Verb, ECHO_RATE_LIMIT, FRAGMENT_HEADER_SIZE, HEADER_FLAG_FRAGMENTED, MAX_FRAGMENTS, PACKET_DEDUP_RING_SIZE,
    PACKET_FLAGS_INDEX, PATH_ALIVE_TIMEOUT, PROTO_VERSION, UDP_DEFAULT_MTU, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
    WHOIS_RATE_LIMIT,
};
use crate::symmetrickey::SymmetricKey;

/// KBKDF label for the key that HMAC-SHA384-authenticates HELLO.
const KBKDF_LABEL_HELLO_HMAC: u8 = b'M';

/// KBKDF label for the AES key encrypting the HELLO metadata dictionary.
const KBKDF_LABEL_HELLO_DICTIONARY: u8 = b'H';

/// Bound on remembered alternate paths per peer.
const PEER_MAX_PATHS: usize = 16;

struct DedupRing {
    ids: [u64; PACKET_DEDUP_RING_SIZE],
    count: usize,
}

impl DedupRing {
    fn new() -> Self {
        Self { ids: [0; PACKET_DEDUP_RING_SIZE], count: 0 }
    }

    /// True if this ID is within the window; otherwise records it.
    fn deduplicate(&mut self, packet_id: u64) -> bool {
        let n = self.count.min(PACKET_DEDUP_RING_SIZE);
        if self.ids[..n].contains(&packet_id) {
            true
        } else {
            self.ids[self.count % PACKET_DEDUP_RING_SIZE] = packet_id;
            self.count = self.count.wrapping_add(1);
            false
        }
    }
}

/// A remote node with which this node can communicate: its identity, session
/// keys, known paths, and the per-peer defenses (dedup, rate gates).
pub struct Peer {
    identity: Identity,

    /// Static key agreed from the two identities, with its message ID counter.
    identity_key: SymmetricKey,

    /// Derived key authenticating HELLO with a full HMAC-SHA384 (v11+).
    hello_hmac_key: Secret<HMAC_SHA384_SIZE>,

    /// Derived AES key encrypting the HELLO metadata dictionary.
    hello_dictionary_key: Secret<AES_CTR_KEY_SIZE>,

    /// Optional signed endpoint bundle, opaque to VL1.
    locator: Mutex<Option<Arc<Vec<u8>>>>,

    /// Known direct paths, most recently received-on first.
    paths: Mutex<Vec<Arc<Path>>>,

    dedup: Mutex<DedupRing>,

    last_send_time_ticks: AtomicI64,
    last_receive_time_ticks: AtomicI64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,

    /// Round trip time in milliseconds, negative while unknown.
    latency: AtomicI64,

    remote_version: AtomicU64,
    remote_protocol_version: AtomicU8,

    whois_rate_gate: AtomicIntervalGate<WHOIS_RATE_LIMIT>,
    echo_rate_gate: AtomicIntervalGate<ECHO_RATE_LIMIT>,
}

impl Peer {
    /// Create a new peer from its identity.
    ///
    /// Returns None if `this_node_identity` lacks its secret keys or key
    /// agreement between the two identities fails.
    pub(crate) fn new(this_node_identity: &Identity, id: Identity) -> Option<Peer> {
        this_node_identity.agree(&id).map(|static_secret| {
            let hello_hmac_key = zt_kbkdf_hmac_sha384(static_secret.as_ref(), KBKDF_LABEL_HELLO_HMAC);
            let dict_key_long = zt_kbkdf_hmac_sha384(static_secret.as_ref(), KBKDF_LABEL_HELLO_DICTIONARY);
            let hello_dictionary_key = Secret(*dict_key_long.first_n::<AES_CTR_KEY_SIZE>());
            Peer {
                identity: id,
                identity_key: SymmetricKey::new(static_secret),
                hello_hmac_key,
                hello_dictionary_key,
                locator: Mutex::new(None),
                paths: Mutex::new(Vec::new()),
                dedup: Mutex::new(DedupRing::new()),
                last_send_time_ticks: AtomicI64::new(0),
                last_receive_time_ticks: AtomicI64::new(0),
                total_bytes_sent: AtomicU64::new(0),
                total_bytes_received: AtomicU64::new(0),
                latency: AtomicI64::new(-1),
                remote_version: AtomicU64::new(0),
                remote_protocol_version: AtomicU8::new(0),
                whois_rate_gate: Default::default(),
                echo_rate_gate: Default::default(),
            }
        })
    }

    #[inline(always)]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline(always)]
    pub fn address(&self) -> crate::address::Address {
        self.identity.address
    }

    /// Current outbound session key.
    #[inline(always)]
    pub(crate) fn key(&self) -> &SymmetricKey {
        &self.identity_key
    }

    /// Current outbound packet cipher.
    #[inline(always)]
    pub fn cipher(&self) -> Cipher {
        Cipher::Poly1305Salsa2012
    }

    /// Static identity agreement key, input to per-packet key derivation.
    #[inline(always)]
    pub fn raw_identity_key(&self) -> &[u8; SALSA20_KEY_SIZE] {
        self.identity_key.key.first_n()
    }

    #[inline(always)]
    pub(crate) fn identity_hello_hmac_key(&self) -> &Secret<HMAC_SHA384_SIZE> {
        &self.hello_hmac_key
    }

    #[inline(always)]
    pub(crate) fn identity_hello_dictionary_key(&self) -> &Secret<AES_CTR_KEY_SIZE> {
        &self.hello_dictionary_key
    }

    pub fn locator(&self) -> Option<Arc<Vec<u8>>> {
        self.locator.lock().clone()
    }

    pub fn set_locator(&self, locator: Option<Vec<u8>>) {
        *self.locator.lock() = locator.map(Arc::new);
    }

    /// True if this packet ID was already seen within the dedup window;
    /// otherwise records it and returns false.
    pub(crate) fn deduplicate_incoming_packet(&self, packet_id: u64) -> bool {
        self.dedup.lock().deduplicate(packet_id)
    }

    #[inline(always)]
    pub fn last_receive_time_ticks(&self) -> i64 {
        self.last_receive_time_ticks.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn last_send_time_ticks(&self) -> i64 {
        self.last_send_time_ticks.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn latency(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    pub(crate) fn record_latency(&self, latency_ms: i64) {
        if latency_ms >= 0 {
            self.latency.store(latency_ms, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_remote_version(&self, proto: u8, major: u8, minor: u8, revision: u16) {
        self.remote_protocol_version.store(proto, Ordering::Relaxed);
        self.remote_version
            .store(((major as u64) << 32) | ((minor as u64) << 16) | (revision as u64), Ordering::Relaxed);
    }

    /// Remote protocol version, or 0 if no HELLO has been exchanged yet.
    #[inline(always)]
    pub fn remote_version_protocol(&self) -> u8 {
        self.remote_protocol_version.load(Ordering::Relaxed)
    }

    /// Remote software version (major, minor, revision), if known.
    pub fn remote_version(&self) -> Option<(u8, u8, u16)> {
        let rv = self.remote_version.load(Ordering::Relaxed);
        if rv != 0 {
            Some(((rv >> 32) as u8, (rv >> 16) as u8, rv as u16))
        } else {
            None
        }
    }

    pub(crate) fn rate_gate_inbound_whois_request(&self, now: i64) -> bool {
        self.whois_rate_gate.gate(now)
    }

    pub(crate) fn rate_gate_echo_request(&self, now: i64) -> bool {
        self.echo_rate_gate.gate(now)
    }

    /// Update liveness and statistics after a fully authenticated and
    /// dispatched packet, and remember the path it came in on.
    pub(crate) fn received(&self, cc: &CallContext, path: &Arc<Path>, hops: u8, _packet_id: u64, payload_len: usize, _verb: Verb, _in_re_verb: Verb) {
        self.last_receive_time_ticks.store(cc.ticks, Ordering::Relaxed);
        self.total_bytes_received
            .fetch_add((payload_len + proto::PACKET_HEADER_SIZE) as u64, Ordering::Relaxed);
        if hops == 0 {
            // Only zero-hop packets prove a direct path.
            let mut paths = self.paths.lock();
            if let Some(i) = paths.iter().position(|p| Arc::ptr_eq(p, path)) {
                if i != 0 {
                    let p = paths.remove(i);
                    paths.insert(0, p);
                }
            } else {
                paths.insert(0, path.clone());
                paths.truncate(PEER_MAX_PATHS);
            }
        }
    }

    /// The most recently used direct path that is still alive.
    pub fn direct_path(&self, now: i64) -> Option<Arc<Path>> {
        self.paths
            .lock()
            .iter()
            .find(|p| (now - p.last_receive_time_ticks()) < PATH_ALIVE_TIMEOUT)
            .cloned()
    }

    /// Send an already armored packet to this peer over the given path,
    /// fragmenting if it exceeds the transport MTU.
    pub(crate) fn send<H: HostSystem>(&self, host: &H, cc: &CallContext, packet: &mut [u8], path: &Path) -> bool {
        let len = packet.len();
        if len > UDP_DEFAULT_MTU {
            let frag_payload = UDP_DEFAULT_MTU - FRAGMENT_HEADER_SIZE;
            let fragment_count = 1 + (len - UDP_DEFAULT_MTU + frag_payload - 1) / frag_payload;
            if fragment_count > MAX_FRAGMENTS {
                return false;
            }
            packet[PACKET_FLAGS_INDEX] |= HEADER_FLAG_FRAGMENTED;
            if !path.send(host, cc, &packet[..UDP_DEFAULT_MTU]) {
                return false;
            }
            let mut frag = [0_u8; UDP_DEFAULT_MTU];
            let mut pos = UDP_DEFAULT_MTU;
            let mut fragment_no = 1_u8;
            while pos < len {
                let chunk = (len - pos).min(frag_payload);
                frag[..FRAGMENT_HEADER_SIZE].copy_from_slice(&proto::fragment_header(packet, fragment_count as u8, fragment_no));
                frag[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + chunk].copy_from_slice(&packet[pos..pos + chunk]);
                if !path.send(host, cc, &frag[..FRAGMENT_HEADER_SIZE + chunk]) {
                    return false;
                }
                pos += chunk;
                fragment_no += 1;
            }
        } else if !path.send(host, cc, packet) {
            return false;
        }
        self.last_send_time_ticks.store(cc.ticks, Ordering::Relaxed);
        self.total_bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        true
    }

    /// Send a HELLO to this peer, either to an explicit endpoint or over the
    /// current best direct path.
    ///
    /// HELLO carries its own authentication: a Poly1305 outer MAC for old
    /// nodes plus an HMAC-SHA384 trailer checked by v11+ nodes, and its
    /// metadata dictionary is encrypted under a key only the two identities
    /// can derive.
    pub fn send_hello<H: HostSystem>(&self, host: &H, node: &Node, cc: &CallContext, explicit_endpoint: Option<SocketAddr>) -> bool {
        let path = if explicit_endpoint.is_none() { self.direct_path(cc.ticks) } else { None };
        let endpoint = match explicit_endpoint.or_else(|| path.as_ref().map(|p| p.address)) {
            Some(ep) => ep,
            None => return false,
        };

        let message_id = self.identity_key.next_message();
        let mut packet: Buffer<UDP_DEFAULT_MTU> = Buffer::new();
        let built = (|| -> std::io::Result<()> {
            proto::new_packet(&mut packet, message_id, self.identity.address, node.identity().address, Verb::Hello)?;
            // The cipher bits are part of what the trailing HMAC covers, so
            // they must be in place before it is computed; armor() will write
            // the same value.
            packet.as_bytes_mut()[PACKET_FLAGS_INDEX] = Cipher::Poly1305None.to_flags();
            packet.append_u8(PROTO_VERSION)?;
            packet.append_u8(VERSION_MAJOR)?;
            packet.append_u8(VERSION_MINOR)?;
            packet.append_u16(VERSION_REVISION)?;
            packet.append_u64(cc.ticks as u64)?;
            node.identity().marshal(&mut packet, false)?;
            marshal_inet_address(&mut packet, Some(&endpoint))?;
            packet.append_u32(0)?; // reserved

            let mut nonce = [0_u8; AES_CTR_NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            packet.append_bytes_fixed(&nonce)?;

            let encrypted_start = packet.len();
            packet.append_u16(0)?; // reserved
            let mut dict = Dictionary::new();
            dict.set_u64(proto::HELLO_DICT_KEY_INSTANCE_ID, node.instance_id);
            dict.set_u64(proto::HELLO_DICT_KEY_CLOCK, cc.clock as u64);
            let dict_bytes = dict.encode();
            packet.append_u16(dict_bytes.len() as u16)?;
            packet.append_bytes(&dict_bytes)?;
            crate::crypto::aes_ctr_crypt_in_place(
                self.hello_dictionary_key.as_bytes(),
                &nonce,
                &mut packet.as_bytes_mut()[encrypted_start..],
            );

            let hmac = hmac_sha384(self.hello_hmac_key.as_ref(), &[packet.as_bytes()]);
            packet.append_bytes_fixed(&hmac)?;
            Ok(())
        })();
        if built.is_err() {
            return false;
        }

        if proto::armor(packet.as_bytes_mut(), &self.identity_key, Cipher::Poly1305None).is_none() {
            return false;
        }
        node.expect().sending(message_id, cc.ticks);

        if let Some(path) = path.as_ref() {
            self.send(host, cc, packet.as_bytes_mut(), path)
        } else {
            let ok = host.wire_send(-1, &endpoint, packet.as_bytes());
            if ok {
                self.last_send_time_ticks.store(cc.ticks, Ordering::Relaxed);
                self.total_bytes_sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
            }
            ok
        }
    }

    /// Persist this peer to the host's cache so its identity can be recalled
    /// without a WHOIS after restart.
    pub(crate) fn save<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        let id_bytes = self.identity.to_bytes(false);
        let mut record = Vec::with_capacity(8 + id_bytes.len());
        record.extend_from_slice(&(cc.clock as u64).to_be_bytes());
        record.extend_from_slice(id_bytes.as_bytes());
        host.state_put(StateObjectType::Peer, &self.identity.address.to_bytes(), &record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_ring_window() {
        let mut ring = DedupRing::new();
        assert!(!ring.deduplicate(7));
        assert!(ring.deduplicate(7));
        for i in 100..(100 + PACKET_DEDUP_RING_SIZE as u64) {
            assert!(!ring.deduplicate(i));
        }
        // 7 fell out of the window.
        assert!(!ring.deduplicate(7));
    }

    #[test]
    fn dedup_accepts_zero_packet_id_once() {
        let mut ring = DedupRing::new();
        assert!(!ring.deduplicate(0));
        assert!(ring.deduplicate(0));
    }
}
