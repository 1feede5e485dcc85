/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

use crate::address::{Address, ADDRESS_SIZE};
use crate::application::{CallContext, HostSystem, InnerProtocol, StateObjectType};
use crate::buf::{self, Buffer};
use crate::crypto::{aes_ctr_crypt_in_place, hmac_sha384, poly1305_mac, secure_eq, AES_CTR_NONCE_SIZE, HMAC_SHA384_SIZE};
use crate::defrag::{Assembled, Fragment};
use crate::dictionary::Dictionary;
use crate::endpoint::{ip_bytes_to_socket_addr, marshal_inet_address, unmarshal_inet_address};
use crate::error::InvalidParameterError;
use crate::expect::Expect;
use crate::gate::IntervalGate;
use crate::identity::Identity;
use crate::path::Path;
use crate::peer::Peer;
use crate::proto::{
    self, Cipher, Dearmored, Verb, BUF_MEM_SIZE, EXPECT_TTL, FRAGMENT_COUNTS_INDEX, FRAGMENT_HEADER_SIZE, FRAGMENT_INDICATOR,
    FRAGMENT_INDICATOR_INDEX, FRAGMENT_SIZE_MIN, HEADER_FLAGS_MASK_HOPS, MAX_FRAGMENTS, MAX_PACKET_LENGTH,
    PACKET_DESTINATION_INDEX, PACKET_FLAGS_INDEX, PACKET_MAC_INDEX, PACKET_PAYLOAD_START, PACKET_SIZE_MIN,
    PACKET_SOURCE_INDEX, PACKET_VERB_INDEX, PATH_KEEPALIVE_PERIOD, PROTO_VERSION, PROTO_VERSION_HELLO_HMAC,
    PROTO_VERSION_MIN, ROOT_HELLO_INTERVAL, ROOT_SYNC_INTERVAL, UDP_DEFAULT_MTU, VERB_FLAG_COMPRESSED, VERB_MASK,
    VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION, WHOIS_RETRY_DELAY,
};
use crate::topology::Topology;
use crate::trace::{PacketDropReason, TraceEvent, TRACE_VL1};
use crate::whois::WhoisQueue;

/// How often peer and path garbage collection runs.
const PEER_SERVICE_INTERVAL: i64 = 30000;

macro_rules! trace_vl1 {
    ($node:expr, $host:expr, $event:expr) => {
        if $node.trace_enabled(TRACE_VL1) {
            $host.event_trace($event);
        }
    };
}

macro_rules! trace_drop {
    ($node:expr, $host:expr, $code:expr, $packet_id:expr, $peer:expr, $path:expr, $hops:expr, $verb:expr, $reason:expr) => {
        trace_vl1!(
            $node,
            $host,
            TraceEvent::IncomingPacketDropped {
                code_location: $code,
                packet_id: $packet_id,
                peer_identity: $peer,
                from: Some(&$path.address),
                hops: $hops,
                verb: ($verb) as u8,
                reason: $reason,
            }
        );
    };
}

#[derive(Default)]
struct BackgroundTaskIntervals {
    root_sync: IntervalGate<ROOT_SYNC_INTERVAL>,
    root_hello: IntervalGate<ROOT_HELLO_INTERVAL>,
    peers: IntervalGate<PEER_SERVICE_INTERVAL>,
    paths: IntervalGate<PATH_KEEPALIVE_PERIOD>,
    whois: IntervalGate<WHOIS_RETRY_DELAY>,
    expect: IntervalGate<EXPECT_TTL>,
}

/// The VL1 engine: a global peer-to-peer packet node.
///
/// This owns the topology, the reply expectation table, and the WHOIS queue,
/// and implements the full inbound pipeline from raw datagram to verb
/// dispatch. Multiple threads may call `on_remote_packet` concurrently.
pub struct Node {
    /// Random ID for this particular run, advertised in HELLO metadata.
    pub instance_id: u64,

    identity: Identity,
    topology: Topology,
    expect: Expect,
    whois: WhoisQueue,
    intervals: Mutex<BackgroundTaskIntervals>,
    trace_flags: AtomicU32,
}

impl Node {
    /// Create a node, loading this node's identity from the host's state
    /// store or generating and saving a new one if permitted.
    pub fn new<H: HostSystem>(host: &H, auto_generate_identity: bool) -> Result<Self, InvalidParameterError> {
        let identity = match host.state_get(StateObjectType::NodeIdentity, &[]) {
            Some(bytes) => {
                let mut cursor = 0;
                Identity::unmarshal(&bytes, &mut cursor).map_err(|_| InvalidParameterError("invalid stored identity"))?
            }
            None => {
                if !auto_generate_identity {
                    return Err(InvalidParameterError("no identity found and auto-generate not enabled"));
                }
                let id = Identity::generate();
                host.state_put(StateObjectType::NodeIdentity, &[], id.to_bytes(true).as_bytes());
                id
            }
        };
        if identity.secret.is_none() {
            return Err(InvalidParameterError("identity lacks secret keys"));
        }
        Ok(Self {
            instance_id: OsRng.next_u64(),
            topology: Topology::new(identity.clone()),
            identity,
            expect: Expect::new(),
            whois: WhoisQueue::new(),
            intervals: Mutex::new(BackgroundTaskIntervals::default()),
            trace_flags: AtomicU32::new(0),
        })
    }

    #[inline(always)]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline(always)]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[inline(always)]
    pub(crate) fn expect(&self) -> &Expect {
        &self.expect
    }

    pub fn set_trace_flags(&self, flags: u32) {
        self.trace_flags.store(flags, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn trace_enabled(&self, flag: u32) -> bool {
        (self.trace_flags.load(Ordering::Relaxed) & flag) != 0
    }

    /// The trust store contents changed; rebuild the root list.
    pub fn trust_store_changed<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        self.topology.trust_store_changed(host, cc);
    }

    /// Called when a datagram is received on the physical wire.
    ///
    /// This is the only packet entry point. It never panics on any input: a
    /// malformed datagram is dropped, optionally with a trace event.
    pub fn on_remote_packet<H: HostSystem, I: InnerProtocol>(
        &self,
        host: &H,
        inner: &I,
        cc: &CallContext,
        local_socket: i64,
        from_address: SocketAddr,
        data: Vec<u8>,
    ) {
        let path = self.topology.path(local_socket, &from_address);
        path.received(cc, data.len());

        if data.len() < FRAGMENT_SIZE_MIN {
            return;
        }
        let dest = match Address::from_bytes(
            data[PACKET_DESTINATION_INDEX..PACKET_DESTINATION_INDEX + ADDRESS_SIZE].try_into().unwrap(),
        ) {
            Some(d) => d,
            None => return,
        };
        if dest != self.identity.address {
            self.relay(host, cc, &path, dest, data);
            return;
        }
        let packet_id = proto::packet_id(&data);

        let assembled: ArrayVec<Fragment, MAX_FRAGMENTS>;
        if data[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR {
            // A non-head fragment of a larger packet.
            let counts = data[FRAGMENT_COUNTS_INDEX];
            match path.receive_fragment(
                packet_id,
                Fragment { buf: data, payload_start: FRAGMENT_HEADER_SIZE },
                counts & 0x0f,
                counts >> 4,
                cc.ticks,
            ) {
                Assembled::Complete(a) => assembled = a,
                _ => return,
            }
        } else {
            if data.len() < PACKET_SIZE_MIN {
                return;
            }
            if proto::packet_is_fragmented(&data) {
                // The head of a fragment series; always fragment zero, and the
                // total count is carried by the other fragments.
                match path.receive_fragment(packet_id, Fragment { buf: data, payload_start: 0 }, 0, 0, cc.ticks) {
                    Assembled::Complete(a) => assembled = a,
                    _ => return,
                }
            } else {
                let mut single = ArrayVec::new();
                single.push(Fragment { buf: data, payload_start: 0 });
                assembled = single;
            }
        }

        // Merge into one contiguous buffer. The unfragmented fast path hands
        // its original buffer through without copying.
        let pkt: Vec<u8> = if assembled.len() == 1 && assembled[0].payload_start == 0 {
            assembled.into_iter().next().unwrap().buf
        } else {
            let total: usize = assembled.iter().map(|f| f.payload().len()).sum();
            if total > BUF_MEM_SIZE {
                return;
            }
            let mut merged = Vec::with_capacity(total);
            for f in assembled.iter() {
                merged.extend_from_slice(f.payload());
            }
            merged
        };
        if pkt.len() < PACKET_SIZE_MIN {
            return;
        }

        let source = match Address::from_bytes(
            pkt[PACKET_SOURCE_INDEX..PACKET_SOURCE_INDEX + ADDRESS_SIZE].try_into().unwrap(),
        ) {
            Some(s) => s,
            None => return,
        };
        let hops = proto::packet_hops(&pkt);
        let cipher = Cipher::from_flags(pkt[PACKET_FLAGS_INDEX]);

        // HELLO establishes keys and so arrives outside them; it carries its
        // own authentication and is allowed to create peer state.
        if matches!(cipher, Some(Cipher::None) | Some(Cipher::Poly1305None))
            && (pkt[PACKET_VERB_INDEX] & VERB_MASK) == Verb::Hello as u8
        {
            let mut pkt = pkt;
            if let Some(peer) = self.handle_hello(host, inner, cc, &path, &mut pkt) {
                peer.received(cc, &path, hops, packet_id, pkt.len().saturating_sub(PACKET_PAYLOAD_START), Verb::Hello, Verb::Nop);
            }
            return;
        }

        match self.topology.peer(host, cc, source, false) {
            Some(peer) => {
                self.authenticate_and_process(host, inner, cc, &path, &peer, pkt);
            }
            None => {
                // Identity unknown; park the packet and ask a root who this is.
                if self.whois.enqueue(source, pkt, path, cc.ticks) {
                    self.send_pending_whois(host, cc);
                }
            }
        }
    }

    /// Authenticate, decrypt, deduplicate, decompress, and dispatch an
    /// assembled packet from a known peer.
    fn authenticate_and_process<H: HostSystem, I: InnerProtocol>(
        &self,
        host: &H,
        inner: &I,
        cc: &CallContext,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        mut pkt: Vec<u8>,
    ) {
        let packet_id = proto::packet_id(&pkt);
        let hops = proto::packet_hops(&pkt);

        let auth = match proto::dearmor(&mut pkt, peer.key()) {
            Dearmored::Authenticated(flags) => flags,
            Dearmored::MacFailed => {
                trace_drop!(self, host, 0xcc89c812, packet_id, Some(peer.identity()), path, hops, Verb::Nop, PacketDropReason::MacFailed);
                return;
            }
            Dearmored::UnsupportedCipher => {
                // NONE and AES-GMAC-SIV are declared but not accepted here yet.
                return;
            }
            Dearmored::InvalidCipher => {
                trace_drop!(self, host, 0x5b001099, packet_id, Some(peer.identity()), path, hops, Verb::Nop, PacketDropReason::InvalidObject);
                return;
            }
        };

        if peer.deduplicate_incoming_packet(packet_id) {
            return;
        }

        let verb_byte = pkt[PACKET_VERB_INDEX];
        if (verb_byte & VERB_FLAG_COMPRESSED) != 0 && pkt.len() > PACKET_PAYLOAD_START {
            // Decompression only ever runs on MAC-validated packets.
            let mut dec = vec![0_u8; BUF_MEM_SIZE];
            dec[..PACKET_PAYLOAD_START].copy_from_slice(&pkt[..PACKET_PAYLOAD_START]);
            match lz4_flex::block::decompress_into(&pkt[PACKET_PAYLOAD_START..], &mut dec[PACKET_PAYLOAD_START..]) {
                Ok(dlen) => {
                    dec.truncate(PACKET_PAYLOAD_START + dlen);
                    pkt = dec;
                }
                Err(_) => {
                    trace_drop!(self, host, 0xee9e4392, packet_id, Some(peer.identity()), path, hops, verb_byte & VERB_MASK, PacketDropReason::InvalidCompressedData);
                    return;
                }
            }
        }

        let verb = match Verb::from_u8(verb_byte) {
            Some(v) => v,
            None => {
                trace_drop!(self, host, 0xeeeeeff0, packet_id, Some(peer.identity()), path, hops, verb_byte & VERB_MASK, PacketDropReason::UnrecognizedVerb);
                return;
            }
        };

        let mut in_re_verb = Verb::Nop;
        let ok = match verb {
            Verb::Nop => true,
            Verb::Hello => self.handle_hello(host, inner, cc, path, &mut pkt).is_some(),
            Verb::Error => self.handle_error(host, inner, cc, path, peer, auth, &pkt, &mut in_re_verb),
            Verb::Ok => self.handle_ok(host, inner, cc, path, peer, auth, &pkt, &mut in_re_verb),
            Verb::Whois => self.handle_whois(host, cc, path, peer, &pkt),
            Verb::Rendezvous => self.handle_rendezvous(host, cc, path, peer, &pkt),
            Verb::Echo => self.handle_echo(host, cc, path, peer, &pkt),
            Verb::PushDirectPaths => self.handle_push_direct_paths(host, cc, path, peer, &pkt),
            Verb::UserMessage => self.handle_user_message(host, cc, path, peer, &pkt),
            Verb::Encap => self.handle_encap(host, peer, &pkt),
            Verb::Frame
            | Verb::ExtFrame
            | Verb::MulticastLike
            | Verb::NetworkCredentials
            | Verb::NetworkConfigRequest
            | Verb::NetworkConfig
            | Verb::MulticastGather
            | Verb::MulticastFrameDeprecated
            | Verb::Multicast => inner.handle_packet(cc, peer, path, auth, verb, &pkt[PACKET_PAYLOAD_START..]),
        };
        if ok {
            peer.received(cc, path, hops, packet_id, pkt.len() - PACKET_PAYLOAD_START, verb, in_re_verb);
        }
    }

    /// Handle HELLO: authenticate the sender's identity claim, create or
    /// confirm the peer, and reply OK(HELLO).
    fn handle_hello<H: HostSystem, I: InnerProtocol>(
        &self,
        host: &H,
        inner: &I,
        cc: &CallContext,
        path: &Arc<Path>,
        pkt: &mut Vec<u8>,
    ) -> Option<Arc<Peer>> {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);

        let mut cursor = PACKET_PAYLOAD_START;
        let fixed = (|| -> std::io::Result<(u8, u8, u8, u16, u64)> {
            Ok((
                buf::read_u8(pkt, &mut cursor)?,
                buf::read_u8(pkt, &mut cursor)?,
                buf::read_u8(pkt, &mut cursor)?,
                buf::read_u16(pkt, &mut cursor)?,
                buf::read_u64(pkt, &mut cursor)?,
            ))
        })();
        let (proto_version, version_major, version_minor, version_revision, timestamp) = match fixed {
            Ok(f) => f,
            Err(_) => {
                trace_drop!(self, host, 0x457f2347, packet_id, None, path, hops, Verb::Hello, PacketDropReason::MalformedPacket);
                return None;
            }
        };
        if proto_version < PROTO_VERSION_MIN {
            trace_drop!(self, host, 0x907a9891, packet_id, None, path, hops, Verb::Hello, PacketDropReason::PeerTooOld);
            return None;
        }

        // The identity must parse and must actually match the claimed source.
        let id = match Identity::unmarshal(pkt, &mut cursor) {
            Ok(id) => id,
            Err(_) => {
                trace_drop!(self, host, 0x707a9810, packet_id, None, path, hops, Verb::Hello, PacketDropReason::InvalidObject);
                return None;
            }
        };
        if id.address.to_bytes() != pkt[PACKET_SOURCE_INDEX..PACKET_SOURCE_INDEX + ADDRESS_SIZE] {
            trace_drop!(self, host, 0x707a9010, packet_id, None, path, hops, Verb::Hello, PacketDropReason::MacFailed);
            return None;
        }

        let peer = match self.topology.peer(host, cc, id.address, true) {
            Some(peer) => {
                if peer.identity() != &id {
                    // A later HELLO never overwrites an existing identity:
                    // this smells like an attempted identity hijack.
                    trace_drop!(self, host, 0x707a9891, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::MacFailed);
                    return None;
                }
                if peer.deduplicate_incoming_packet(packet_id) {
                    return None;
                }
                peer
            }
            None => {
                if !id.locally_validate() {
                    trace_drop!(self, host, 0x707a9892, packet_id, None, path, hops, Verb::Hello, PacketDropReason::InvalidObject);
                    return None;
                }
                match Peer::new(&self.identity, id) {
                    Some(p) => self.topology.add(Arc::new(p)),
                    None => {
                        trace_drop!(self, host, 0x707a9893, packet_id, None, path, hops, Verb::Hello, PacketDropReason::Unspecified);
                        return None;
                    }
                }
            }
        };

        let mut packet_size = pkt.len();
        if proto_version >= PROTO_VERSION_HELLO_HMAC {
            // v11+ HELLO is authenticated by a whole packet HMAC-SHA384 with
            // the hops sub-field masked and the legacy MAC field zeroed.
            if packet_size < cursor + HMAC_SHA384_SIZE {
                trace_drop!(self, host, 0xab9c9891, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::MacFailed);
                return None;
            }
            packet_size -= HMAC_SHA384_SIZE;
            pkt[PACKET_FLAGS_INDEX] &= !HEADER_FLAGS_MASK_HOPS;
            pkt[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8].fill(0);
            let expected = hmac_sha384(peer.identity_hello_hmac_key().as_ref(), &[&pkt[..packet_size]]);
            if !secure_eq(&expected, &pkt[packet_size..packet_size + HMAC_SHA384_SIZE]) {
                trace_drop!(self, host, 0x707a9891, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::MacFailed);
                return None;
            }
        } else {
            // Older versions authenticate HELLO with the outer Poly1305 MAC
            // only (no payload encryption).
            if packet_size <= proto::PACKET_ENCRYPTED_SECTION_START {
                trace_drop!(self, host, 0x11bfff81, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::MacFailed);
                return None;
            }
            let (_, poly_key) = proto::salsa_poly_create(peer.key(), &pkt[..proto::PACKET_ENCRYPTED_SECTION_START], packet_size);
            let tag = poly1305_mac(&poly_key, &pkt[proto::PACKET_ENCRYPTED_SECTION_START..packet_size]);
            if tag[..8] != pkt[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8] {
                trace_drop!(self, host, 0x11bfff82, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::MacFailed);
                return None;
            }
        }

        // The address the sender believes it sent to; parsed both to learn our
        // external address and to advance past it.
        let sent_to = match unmarshal_inet_address(&pkt[..packet_size], &mut cursor) {
            Ok(a) => a,
            Err(_) => {
                trace_drop!(self, host, 0x707a9811, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::InvalidObject);
                return None;
            }
        };
        if let Some(sent_to) = sent_to {
            host.learned_external_address(peer.identity(), sent_to);
        }

        if proto_version >= PROTO_VERSION_HELLO_HMAC {
            cursor += 4; // reserved
            if (cursor + AES_CTR_NONCE_SIZE) < packet_size {
                let nonce: [u8; AES_CTR_NONCE_SIZE] = pkt[cursor..cursor + AES_CTR_NONCE_SIZE].try_into().unwrap();
                cursor += AES_CTR_NONCE_SIZE;
                aes_ctr_crypt_in_place(peer.identity_hello_dictionary_key().as_bytes(), &nonce, &mut pkt[cursor..packet_size]);
                let dict_ok = (|| -> std::io::Result<Option<Dictionary>> {
                    let _reserved = buf::read_u16(&pkt[..packet_size], &mut cursor)?;
                    let dict_size = buf::read_u16(&pkt[..packet_size], &mut cursor)? as usize;
                    let dict_bytes = buf::read_bytes(&pkt[..packet_size], &mut cursor, dict_size)?;
                    Ok(Dictionary::decode(dict_bytes))
                })();
                match dict_ok {
                    Ok(Some(_metadata)) => {
                        // Nothing in the metadata dictionary is load-bearing yet.
                    }
                    Ok(None) => {
                        trace_drop!(self, host, 0x707a9816, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::InvalidObject);
                        return Some(peer);
                    }
                    Err(_) => {
                        trace_drop!(self, host, 0x707a9815, packet_id, Some(peer.identity()), path, hops, Verb::Hello, PacketDropReason::InvalidObject);
                        return Some(peer);
                    }
                }
            }
        }

        // Reply OK(HELLO), echoing the packet ID and timestamp and telling
        // the sender how its address looks from here.
        let reply_id = peer.key().next_message();
        let mut reply: Buffer<UDP_DEFAULT_MTU> = Buffer::new();
        let built = (|| -> std::io::Result<()> {
            proto::new_packet(&mut reply, reply_id, peer.address(), self.identity.address, Verb::Ok)?;
            // Cipher bits participate in the trailing HMAC; armor() rewrites
            // the same value afterwards.
            reply.as_bytes_mut()[PACKET_FLAGS_INDEX] = Cipher::Poly1305None.to_flags();
            reply.append_u8(Verb::Hello as u8)?;
            reply.append_u64(packet_id)?;
            reply.append_u64(timestamp)?;
            reply.append_u8(PROTO_VERSION)?;
            reply.append_u8(VERSION_MAJOR)?;
            reply.append_u8(VERSION_MINOR)?;
            reply.append_u16(VERSION_REVISION)?;
            marshal_inet_address(&mut reply, Some(&path.address))?;
            reply.append_u16(0)?; // legacy "moons" count
            if proto_version >= PROTO_VERSION_HELLO_HMAC {
                reply.append_u16(0)?; // empty metadata dictionary
                let hmac = hmac_sha384(peer.identity_hello_hmac_key().as_ref(), &[reply.as_bytes()]);
                reply.append_bytes_fixed(&hmac)?;
            }
            Ok(())
        })();
        if built.is_err() || proto::armor(reply.as_bytes_mut(), peer.key(), Cipher::Poly1305None).is_none() {
            trace_vl1!(self, host, TraceEvent::UnexpectedError { code_location: 0xa7a009a2, message: "failed to build OK(HELLO)" });
            return None;
        }
        self.expect.sending(reply_id, cc.ticks);
        peer.set_remote_version(proto_version, version_major, version_minor, version_revision);
        peer.send(host, cc, reply.as_bytes_mut(), path);

        // The peer now exists, so anything queued pending its identity can run.
        self.replay_waiting_for(host, inner, cc, &peer);
        Some(peer)
    }

    /// Handle OK: verify the reply was solicited, then finalize by in-re verb.
    #[allow(clippy::too_many_arguments)]
    fn handle_ok<H: HostSystem, I: InnerProtocol>(
        &self,
        host: &H,
        inner: &I,
        cc: &CallContext,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        auth: u8,
        pkt: &[u8],
        in_re_verb_out: &mut Verb,
    ) -> bool {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        let mut cursor = PACKET_PAYLOAD_START;
        let header = (|| -> std::io::Result<(u8, u64)> {
            Ok((buf::read_u8(pkt, &mut cursor)?, buf::read_u64(pkt, &mut cursor)?))
        })();
        let (in_re_verb_raw, in_re_packet_id) = match header {
            Ok(h) => h,
            Err(_) => {
                trace_drop!(self, host, 0x4c1f1ff7, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::MalformedPacket);
                return false;
            }
        };

        if !self.expect.expecting(in_re_packet_id, cc.ticks) {
            trace_drop!(self, host, 0x4c1f1ff8, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::ReplyNotExpected);
            return false;
        }
        let in_re_verb = Verb::from_u8(in_re_verb_raw).unwrap_or(Verb::Nop);
        *in_re_verb_out = in_re_verb;

        match in_re_verb {
            Verb::Hello => {
                let fields = (|| -> std::io::Result<(u64, u8, u8, u8, u16)> {
                    Ok((
                        buf::read_u64(pkt, &mut cursor)?,
                        buf::read_u8(pkt, &mut cursor)?,
                        buf::read_u8(pkt, &mut cursor)?,
                        buf::read_u8(pkt, &mut cursor)?,
                        buf::read_u16(pkt, &mut cursor)?,
                    ))
                })();
                let (timestamp_echo, proto_version, major, minor, revision) = match fields {
                    Ok(f) => f,
                    Err(_) => {
                        trace_drop!(self, host, 0x4c1f1ff7, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::MalformedPacket);
                        return false;
                    }
                };
                peer.record_latency(cc.ticks.saturating_sub(timestamp_echo as i64));
                peer.set_remote_version(proto_version, major, minor, revision);
                if let Ok(Some(external)) = unmarshal_inet_address(pkt, &mut cursor) {
                    host.learned_external_address(peer.identity(), external);
                }
            }
            Verb::Whois => {
                // A root answered our identity lookup; learn each identity and
                // replay anything waiting on it.
                while cursor < pkt.len() {
                    let id = match Identity::unmarshal(pkt, &mut cursor) {
                        Ok(id) => id,
                        Err(_) => {
                            trace_drop!(self, host, 0x3a291fe9, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::MalformedPacket);
                            return false;
                        }
                    };
                    let locator = (|| -> std::io::Result<Vec<u8>> {
                        let len = buf::read_u16(pkt, &mut cursor)? as usize;
                        Ok(buf::read_bytes(pkt, &mut cursor, len)?.to_vec())
                    })();
                    let locator = match locator {
                        Ok(l) => l,
                        Err(_) => {
                            trace_drop!(self, host, 0x3a291fe9, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::MalformedPacket);
                            return false;
                        }
                    };
                    if !id.locally_validate() {
                        trace_drop!(self, host, 0x707a9812, packet_id, Some(peer.identity()), path, hops, Verb::Ok, PacketDropReason::InvalidObject);
                        continue;
                    }
                    let learned = match self.topology.peer(host, cc, id.address, false) {
                        Some(existing) => {
                            if existing.identity() != &id {
                                continue;
                            }
                            existing
                        }
                        None => match Peer::new(&self.identity, id) {
                            Some(p) => self.topology.add(Arc::new(p)),
                            None => continue,
                        },
                    };
                    if !locator.is_empty() {
                        learned.set_locator(Some(locator));
                    }
                    self.replay_waiting_for(host, inner, cc, &learned);
                }
            }
            Verb::Nop => {}
            _ => {
                inner.handle_ok(cc, peer, path, auth, in_re_verb, in_re_packet_id, &pkt[cursor..]);
            }
        }
        true
    }

    /// Handle ERROR: same expectancy discipline as OK.
    #[allow(clippy::too_many_arguments)]
    fn handle_error<H: HostSystem, I: InnerProtocol>(
        &self,
        host: &H,
        inner: &I,
        cc: &CallContext,
        path: &Arc<Path>,
        peer: &Arc<Peer>,
        auth: u8,
        pkt: &[u8],
        in_re_verb_out: &mut Verb,
    ) -> bool {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        let mut cursor = PACKET_PAYLOAD_START;
        let header = (|| -> std::io::Result<(u8, u64, u8)> {
            Ok((buf::read_u8(pkt, &mut cursor)?, buf::read_u64(pkt, &mut cursor)?, buf::read_u8(pkt, &mut cursor)?))
        })();
        let (in_re_verb_raw, in_re_packet_id, error_code) = match header {
            Ok(h) => h,
            Err(_) => {
                trace_drop!(self, host, 0x3beb1947, packet_id, Some(peer.identity()), path, hops, Verb::Error, PacketDropReason::MalformedPacket);
                return false;
            }
        };
        if !self.expect.expecting(in_re_packet_id, cc.ticks) {
            trace_drop!(self, host, 0x4c1f1ff7, packet_id, Some(peer.identity()), path, hops, Verb::Error, PacketDropReason::ReplyNotExpected);
            return false;
        }
        let in_re_verb = Verb::from_u8(in_re_verb_raw).unwrap_or(Verb::Nop);
        *in_re_verb_out = in_re_verb;
        match in_re_verb {
            Verb::Nop | Verb::Hello | Verb::Whois => {}
            _ => {
                inner.handle_error(cc, peer, path, auth, in_re_verb, in_re_packet_id, error_code, &pkt[cursor..]);
            }
        }
        true
    }

    /// Handle an inbound WHOIS: answer with the identities we know, paging
    /// across several packets if the reply would not fit in one.
    fn handle_whois<H: HostSystem>(&self, host: &H, cc: &CallContext, path: &Arc<Path>, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        if !peer.rate_gate_inbound_whois_request(cc.ticks) {
            trace_drop!(self, host, 0x19f7194a, packet_id, Some(peer.identity()), path, hops, Verb::Whois, PacketDropReason::RateLimitExceeded);
            return true;
        }
        let include_locators = peer.remote_version_protocol() >= PROTO_VERSION_HELLO_HMAC;

        let mut cursor = PACKET_PAYLOAD_START;
        let mut reply = self.start_ok_reply(peer, Verb::Whois, packet_id);
        let base_len = reply.len();
        while let Ok(addr_bytes) = buf::read_bytes_fixed::<ADDRESS_SIZE>(pkt, &mut cursor) {
            let queried = match Address::from_bytes(addr_bytes) {
                Some(a) => a,
                None => continue,
            };
            if let Some(known) = self.topology.peer(host, cc, queried, true) {
                let id_bytes = known.identity().to_bytes(false);
                let locator = if include_locators { known.locator() } else { None };
                let entry_len = id_bytes.len() + if include_locators { 2 + locator.as_ref().map_or(0, |l| l.len()) } else { 0 };
                if reply.len() + entry_len > UDP_DEFAULT_MTU && reply.len() > base_len {
                    self.send_armored(host, cc, peer, path, reply);
                    reply = self.start_ok_reply(peer, Verb::Whois, packet_id);
                }
                reply.extend_from_slice(id_bytes.as_bytes());
                if include_locators {
                    let locator = locator.as_deref().map(|l| l.as_slice()).unwrap_or(&[]);
                    reply.extend_from_slice(&(locator.len() as u16).to_be_bytes());
                    reply.extend_from_slice(locator);
                }
            }
        }
        if reply.len() > base_len {
            self.send_armored(host, cc, peer, path, reply);
        }
        true
    }

    /// Handle RENDEZVOUS, a hole punching hint that is honored only when it
    /// comes from a root.
    fn handle_rendezvous<H: HostSystem>(&self, host: &H, cc: &CallContext, path: &Arc<Path>, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        if !self.topology.is_root(peer) {
            return true;
        }
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        let mut cursor = PACKET_PAYLOAD_START;
        let header = (|| -> std::io::Result<([u8; ADDRESS_SIZE], u16, u8)> {
            Ok((
                *buf::read_bytes_fixed(pkt, &mut cursor)?,
                buf::read_u16(pkt, &mut cursor)?,
                buf::read_u8(pkt, &mut cursor)?,
            ))
        })();
        let (with_address, port, address_length) = match header {
            Ok(h) => h,
            Err(_) => {
                trace_drop!(self, host, 0x43e90ab3, packet_id, Some(peer.identity()), path, hops, Verb::Rendezvous, PacketDropReason::MalformedPacket);
                return false;
            }
        };
        let with = Address::from_bytes(&with_address).and_then(|a| self.topology.peer(host, cc, a, false));
        let with = match with {
            Some(w) => w,
            None => return true,
        };

        match address_length {
            4 | 16 if port != 0 => {
                if let Ok(ip) = buf::read_bytes(pkt, &mut cursor, address_length as usize) {
                    if let Some(endpoint) = ip_bytes_to_socket_addr(ip, port) {
                        trace_vl1!(self, host, TraceEvent::TryingNewPath { code_location: 0x55a19aaa, trying: with.identity(), physical_address: endpoint });
                        host.candidate_path(with.identity(), endpoint);
                    }
                } else {
                    trace_drop!(self, host, 0x43e90ab3, packet_id, Some(peer.identity()), path, hops, Verb::Rendezvous, PacketDropReason::MalformedPacket);
                    return false;
                }
            }
            255 => {
                match unmarshal_inet_address(pkt, &mut cursor) {
                    Ok(Some(endpoint)) => {
                        trace_vl1!(self, host, TraceEvent::TryingNewPath { code_location: 0x55a19aab, trying: with.identity(), physical_address: endpoint });
                        host.candidate_path(with.identity(), endpoint);
                    }
                    Ok(None) => {}
                    Err(_) => {
                        trace_drop!(self, host, 0x43e90ab3, packet_id, Some(peer.identity()), path, hops, Verb::Rendezvous, PacketDropReason::MalformedPacket);
                        return false;
                    }
                }
            }
            _ => {}
        }
        true
    }

    /// Handle ECHO: reply OK(ECHO) with the body verbatim, rate gated.
    fn handle_echo<H: HostSystem>(&self, host: &H, cc: &CallContext, path: &Arc<Path>, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        if !peer.rate_gate_echo_request(cc.ticks) {
            trace_drop!(self, host, 0x27878bc1, packet_id, Some(peer.identity()), path, hops, Verb::Echo, PacketDropReason::RateLimitExceeded);
            return true;
        }
        let mut reply = self.start_ok_reply(peer, Verb::Echo, packet_id);
        reply.extend_from_slice(&pkt[PACKET_PAYLOAD_START..]);
        if reply.len() > MAX_PACKET_LENGTH {
            trace_drop!(self, host, 0x14d70bb0, packet_id, Some(peer.identity()), path, hops, Verb::Echo, PacketDropReason::MalformedPacket);
            return false;
        }
        self.send_armored(host, cc, peer, path, reply);
        true
    }

    /// Handle PUSH_DIRECT_PATHS: a list of candidate physical endpoints for
    /// the sending peer, each handed to the host's NAT traversal logic.
    fn handle_push_direct_paths<H: HostSystem>(&self, host: &H, _cc: &CallContext, path: &Arc<Path>, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        let packet_id = proto::packet_id(pkt);
        let hops = proto::packet_hops(pkt);
        let mut cursor = PACKET_PAYLOAD_START;

        let parsed = (|| -> std::io::Result<Vec<SocketAddr>> {
            let mut found = Vec::new();
            let num_paths = buf::read_u16(pkt, &mut cursor)?;
            for _ in 0..num_paths {
                let _flags = buf::read_u8(pkt, &mut cursor)?;
                let ext_len = buf::read_u16(pkt, &mut cursor)? as usize;
                let _extended_attrs = buf::read_bytes(pkt, &mut cursor, ext_len)?;
                let addr_type = buf::read_u8(pkt, &mut cursor)?;
                let addr_record_len = buf::read_u8(pkt, &mut cursor)? as usize;
                if addr_record_len == 0 {
                    return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty address record"));
                }
                let record = buf::read_bytes(pkt, &mut cursor, addr_record_len)?;
                let endpoint = match addr_type {
                    0 => {
                        let mut rc = 0;
                        unmarshal_inet_address(record, &mut rc).ok().flatten()
                    }
                    4 if record.len() >= 6 => {
                        ip_bytes_to_socket_addr(&record[..4], u16::from_be_bytes(record[4..6].try_into().unwrap()))
                    }
                    6 if record.len() >= 18 => {
                        ip_bytes_to_socket_addr(&record[..16], u16::from_be_bytes(record[16..18].try_into().unwrap()))
                    }
                    _ => None,
                };
                if let Some(endpoint) = endpoint {
                    found.push(endpoint);
                }
            }
            Ok(found)
        })();

        match parsed {
            Ok(found) => {
                for endpoint in found {
                    trace_vl1!(self, host, TraceEvent::TryingNewPath { code_location: 0xa5ab1a43, trying: peer.identity(), physical_address: endpoint });
                    host.candidate_path(peer.identity(), endpoint);
                }
                true
            }
            Err(_) => {
                trace_drop!(self, host, 0xb450e10f, packet_id, Some(peer.identity()), path, hops, Verb::PushDirectPaths, PacketDropReason::MalformedPacket);
                false
            }
        }
    }

    /// Handle USER_MESSAGE: surfaced to the host application.
    fn handle_user_message<H: HostSystem>(&self, host: &H, _cc: &CallContext, path: &Arc<Path>, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        let mut cursor = PACKET_PAYLOAD_START;
        match buf::read_u64(pkt, &mut cursor) {
            Ok(message_type) => {
                host.user_message(peer.identity(), message_type, &pkt[cursor..]);
                true
            }
            Err(_) => {
                trace_drop!(self, host, 0x2f9d0b22, proto::packet_id(pkt), Some(peer.identity()), path, proto::packet_hops(pkt), Verb::UserMessage, PacketDropReason::MalformedPacket);
                false
            }
        }
    }

    /// Handle ENCAP: surfaced to the host, which owns encapsulation semantics.
    fn handle_encap<H: HostSystem>(&self, host: &H, peer: &Arc<Peer>, pkt: &[u8]) -> bool {
        host.encap(peer.identity(), &pkt[PACKET_PAYLOAD_START..]);
        true
    }

    /// Hook for relaying packets not addressed to this node. Relaying is not
    /// currently performed.
    fn relay<H: HostSystem>(&self, _host: &H, _cc: &CallContext, _path: &Arc<Path>, _destination: Address, _data: Vec<u8>) {}

    /// Send WHOIS packets to the best root for all due pending lookups.
    fn send_pending_whois<H: HostSystem>(&self, host: &H, cc: &CallContext) {
        let root = match self.topology.root() {
            Some(r) => r,
            None => return,
        };
        let root_path = match root.direct_path(cc.ticks) {
            Some(p) => p,
            None => return,
        };

        let to_send = self.whois.retry_due(cc.ticks);
        let mut i = 0;
        while i < to_send.len() {
            let packet_id = root.key().next_message();
            let mut packet = self.new_packet_vec(packet_id, root.address(), Verb::Whois);
            while i < to_send.len() && packet.len() + ADDRESS_SIZE <= UDP_DEFAULT_MTU {
                packet.extend_from_slice(&to_send[i].to_bytes());
                i += 1;
            }
            if proto::armor(&mut packet, root.key(), root.cipher()).is_some() {
                self.expect.sending(packet_id, cc.ticks);
                root.send(host, cc, &mut packet, &root_path);
            }
        }
    }

    /// Replay packets parked in the WHOIS queue for a peer that just became known.
    fn replay_waiting_for<H: HostSystem, I: InnerProtocol>(&self, host: &H, inner: &I, cc: &CallContext, peer: &Arc<Peer>) {
        for (pkt, path) in self.whois.peer_arrived(peer.address()) {
            self.authenticate_and_process(host, inner, cc, &path, peer, pkt);
        }
    }

    /// Run background tasks and return the desired delay until the next call.
    ///
    /// Call from a single thread (any thread) at least this often.
    pub fn do_background_tasks<H: HostSystem>(&self, host: &H, cc: &CallContext) -> Duration {
        let mut intervals = self.intervals.lock();

        if intervals.root_sync.gate(cc.ticks) {
            self.topology.rank_roots_now();
        }

        if intervals.root_hello.gate(cc.ticks) {
            // Roots get a HELLO at every known endpoint, unlike normal peers;
            // seeing us on v4 and v6 lets them report all our externals.
            for (root, endpoints) in self.topology.root_entries() {
                for endpoint in endpoints {
                    root.send_hello(host, self, cc, Some(endpoint));
                }
            }
        }

        if intervals.peers.gate(cc.ticks) {
            self.topology.periodic(host, cc);
        }

        if intervals.paths.gate(cc.ticks) {
            self.topology.service_paths(cc);
        }

        if intervals.whois.gate(cc.ticks) {
            self.send_pending_whois(host, cc);
            self.whois.service(cc.ticks);
        }

        if intervals.expect.gate(cc.ticks) {
            self.expect.service(cc.ticks);
        }

        Duration::from_millis((ROOT_SYNC_INTERVAL / 2) as u64)
    }

    fn new_packet_vec(&self, packet_id: u64, dest: Address, verb: Verb) -> Vec<u8> {
        let mut v = Vec::with_capacity(128);
        v.extend_from_slice(&packet_id.to_be_bytes());
        v.extend_from_slice(&dest.to_bytes());
        v.extend_from_slice(&self.identity.address.to_bytes());
        v.push(0); // flags
        v.extend_from_slice(&[0_u8; 8]); // MAC
        v.push(verb as u8);
        v
    }

    fn start_ok_reply(&self, peer: &Peer, in_re_verb: Verb, in_re_packet_id: u64) -> Vec<u8> {
        let mut v = self.new_packet_vec(peer.key().next_message(), peer.address(), Verb::Ok);
        v.push(in_re_verb as u8);
        v.extend_from_slice(&in_re_packet_id.to_be_bytes());
        v
    }

    fn send_armored<H: HostSystem>(&self, host: &H, cc: &CallContext, peer: &Peer, path: &Path, mut packet: Vec<u8>) -> bool {
        if proto::armor(&mut packet, peer.key(), peer.cipher()).is_some() {
            peer.send(host, cc, &mut packet, path)
        } else {
            false
        }
    }
}
