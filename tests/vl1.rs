/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use zerotier_vl1::buf::Buffer;
use zerotier_vl1::proto::{
    self, Cipher, Verb, FRAGMENT_HEADER_SIZE, HEADER_FLAG_FRAGMENTED, PACKET_DESTINATION_INDEX, PACKET_FLAGS_INDEX,
    PACKET_PAYLOAD_START, PEER_ALIVE_TIMEOUT, UDP_DEFAULT_MTU, WHOIS_RETRY_DELAY,
};
use zerotier_vl1::{
    Address, CallContext, HostSystem, Identity, InnerProtocol, Node, PacketDropReason, Path, Peer, RootSpec,
    StateObjectType, SymmetricKey, TraceEvent, TRACE_VL1,
};

/* Identity generation grinds a memory-hard work function, so a fixed set is
 * generated once and shared by every test in this file. */

const NODE_A: usize = 0;
const NODE_B: usize = 1;
const NODE_R: usize = 2; // root

static IDENTITIES: OnceLock<[Identity; 3]> = OnceLock::new();

fn identity(i: usize) -> &'static Identity {
    &IDENTITIES.get_or_init(|| [Identity::generate(), Identity::generate(), Identity::generate()])[i]
}

fn addr_of(i: usize) -> SocketAddr {
    SocketAddr::from_str(&format!("10.0.0.{}:9993", i + 1)).unwrap()
}

#[derive(Default)]
struct TestHost {
    wire: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    store: Mutex<HashMap<(u8, Vec<u8>), Vec<u8>>>,
    roots: Mutex<Vec<RootSpec>>,
    drops: Mutex<Vec<(u32, PacketDropReason)>>,
    candidate_paths: Mutex<Vec<(Address, SocketAddr)>>,
    external_addresses: Mutex<Vec<SocketAddr>>,
    user_messages: Mutex<Vec<(u64, Vec<u8>)>>,
}

fn store_key(object_type: StateObjectType) -> u8 {
    match object_type {
        StateObjectType::NodeIdentity => 0,
        StateObjectType::Peer => 1,
    }
}

impl TestHost {
    fn with_identity(id: &Identity) -> Self {
        let host = Self::default();
        host.state_put(StateObjectType::NodeIdentity, &[], id.to_bytes(true).as_bytes());
        host
    }

    fn take_wire(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.wire.lock().unwrap())
    }

    fn drops(&self) -> Vec<(u32, PacketDropReason)> {
        self.drops.lock().unwrap().clone()
    }
}

impl HostSystem for TestHost {
    fn wire_send(&self, _local_socket: i64, to: &SocketAddr, data: &[u8]) -> bool {
        self.wire.lock().unwrap().push((*to, data.to_vec()));
        true
    }

    fn state_get(&self, object_type: StateObjectType, id: &[u8]) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(&(store_key(object_type), id.to_vec())).cloned()
    }

    fn state_put(&self, object_type: StateObjectType, id: &[u8], data: &[u8]) {
        self.store.lock().unwrap().insert((store_key(object_type), id.to_vec()), data.to_vec());
    }

    fn trusted_roots(&self) -> Vec<RootSpec> {
        self.roots.lock().unwrap().clone()
    }

    fn candidate_path(&self, peer: &Identity, physical_address: SocketAddr) {
        self.candidate_paths.lock().unwrap().push((peer.address, physical_address));
    }

    fn learned_external_address(&self, _reporter: &Identity, address: SocketAddr) {
        self.external_addresses.lock().unwrap().push(address);
    }

    fn user_message(&self, _source: &Identity, message_type: u64, message: &[u8]) {
        self.user_messages.lock().unwrap().push((message_type, message.to_vec()));
    }

    fn event_trace(&self, event: TraceEvent<'_>) {
        if let TraceEvent::IncomingPacketDropped { code_location, reason, .. } = event {
            self.drops.lock().unwrap().push((code_location, reason));
        }
    }
}

#[derive(Default)]
struct TestInner {
    packets: Mutex<Vec<(Verb, Vec<u8>)>>,
}

impl TestInner {
    fn packets(&self) -> Vec<(Verb, Vec<u8>)> {
        self.packets.lock().unwrap().clone()
    }
}

impl InnerProtocol for TestInner {
    fn handle_packet(&self, _cc: &CallContext, _source: &Arc<Peer>, _source_path: &Arc<Path>, _auth_flags: u8, verb: Verb, payload: &[u8]) -> bool {
        self.packets.lock().unwrap().push((verb, payload.to_vec()));
        true
    }

    fn handle_ok(
        &self,
        _cc: &CallContext,
        _source: &Arc<Peer>,
        _source_path: &Arc<Path>,
        _auth_flags: u8,
        _in_re_verb: Verb,
        _in_re_packet_id: u64,
        _payload: &[u8],
    ) -> bool {
        true
    }

    fn handle_error(
        &self,
        _cc: &CallContext,
        _source: &Arc<Peer>,
        _source_path: &Arc<Path>,
        _auth_flags: u8,
        _in_re_verb: Verb,
        _in_re_packet_id: u64,
        _error_code: u8,
        _payload: &[u8],
    ) -> bool {
        true
    }
}

struct TestNode {
    index: usize,
    node: Node,
    host: TestHost,
    inner: TestInner,
}

impl TestNode {
    fn new(index: usize) -> Self {
        let host = TestHost::with_identity(identity(index));
        let node = Node::new(&host, false).unwrap();
        node.set_trace_flags(TRACE_VL1);
        Self { index, node, host, inner: TestInner::default() }
    }

    /// Designate another node as this node's (only) root.
    fn trust(&self, root: &TestNode, cc: &CallContext) {
        self.host.roots.lock().unwrap().push(RootSpec {
            identity: identity(root.index).clone(),
            endpoints: vec![addr_of(root.index)],
            locator: None,
        });
        self.node.trust_store_changed(&self.host, cc);
    }

    fn receive_from(&self, sender: usize, data: Vec<u8>, cc: &CallContext) {
        self.node.on_remote_packet(&self.host, &self.inner, cc, 1, addr_of(sender), data);
    }

    fn peer_for(&self, other: usize, cc: &CallContext) -> Option<Arc<Peer>> {
        self.node.topology().peer(&self.host, cc, identity(other).address, false)
    }
}

/// Deliver everything a node has put on the wire to the named recipients.
fn pump(from: &TestNode, to: &[&TestNode], cc: &CallContext) {
    for (dest_addr, data) in from.host.take_wire() {
        for node in to {
            if addr_of(node.index) == dest_addr {
                node.receive_from(from.index, data.clone(), cc);
            }
        }
    }
}

/// Run a HELLO handshake from `a` to `b` by making `b` a root of `a`.
fn establish(a: &TestNode, b: &TestNode, cc: &CallContext) {
    a.trust(b, cc);
    a.node.do_background_tasks(&a.host, cc);
    pump(a, &[b], cc);
    pump(b, &[a], cc);
    assert!(a.peer_for(b.index, cc).is_some());
    assert!(b.peer_for(a.index, cc).is_some());
}

fn session_key(a: usize, b: usize) -> SymmetricKey {
    SymmetricKey::new(identity(a).agree(identity(b)).unwrap())
}

fn craft_frame(src: usize, dest: usize, packet_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut b: Buffer<8192> = Buffer::new();
    proto::new_packet(&mut b, packet_id, identity(dest).address, identity(src).address, Verb::Frame).unwrap();
    b.append_bytes(payload).unwrap();
    let mut packet = b.as_bytes().to_vec();
    proto::armor(&mut packet, &session_key(src, dest), Cipher::Poly1305Salsa2012).unwrap();
    packet
}

fn cc_at(ticks: i64) -> CallContext {
    CallContext { ticks, clock: 1_700_000_000_000 + ticks }
}

#[test]
fn hello_handshake() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);

    // A trusts B as a root and says HELLO to it in the background loop.
    a.trust(&b, &cc);
    a.node.do_background_tasks(&a.host, &cc);
    let out = a.host.take_wire();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, addr_of(NODE_B));

    // B has never heard of A; the HELLO itself creates the peer.
    b.receive_from(NODE_A, out[0].1.clone(), &cc);
    let a_on_b = b.peer_for(NODE_A, &cc).expect("HELLO should create the peer");
    assert_eq!(a_on_b.remote_version_protocol(), proto::PROTO_VERSION);
    assert_eq!(a_on_b.remote_version(), Some((proto::VERSION_MAJOR, proto::VERSION_MINOR, proto::VERSION_REVISION)));
    assert!(b.host.drops().is_empty());

    // B learned its own external address from the HELLO's sent-to field.
    assert_eq!(b.host.external_addresses.lock().unwrap().as_slice(), &[addr_of(NODE_B)]);

    // The OK(HELLO) completes the exchange on A's side.
    pump(&b, &[&a], &cc);
    let b_on_a = a.peer_for(NODE_B, &cc).unwrap();
    assert_eq!(b_on_a.remote_version_protocol(), proto::PROTO_VERSION);
    assert!(b_on_a.latency() >= 0);
    assert!(a.host.drops().is_empty());

    // A replayed HELLO is deduplicated silently.
    let replay_count = b.inner.packets().len();
    a.node.do_background_tasks(&a.host, &cc); // nothing due, interval gated
    assert!(a.host.take_wire().is_empty());
    assert_eq!(b.inner.packets().len(), replay_count);
}

#[test]
fn frame_delivery_and_dedup() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);
    establish(&a, &b, &cc);

    let frame = craft_frame(NODE_A, NODE_B, 0x1002003004005006, b"ethernet goes here");
    b.receive_from(NODE_A, frame.clone(), &cc);
    b.receive_from(NODE_A, frame, &cc);

    // Exactly one delivery to the inner layer; the replay is not a MAC event.
    let packets = b.inner.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].0, Verb::Frame);
    assert_eq!(packets[0].1, b"ethernet goes here");
    assert!(b.host.drops().is_empty());
}

#[test]
fn tampered_mac_is_dropped() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);
    establish(&a, &b, &cc);

    let mut frame = craft_frame(NODE_A, NODE_B, 0x2002003004005006, b"good bytes");
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    b.receive_from(NODE_A, frame, &cc);

    assert!(b.inner.packets().is_empty());
    let drops = b.host.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0], (0xcc89c812, PacketDropReason::MacFailed));
}

#[test]
fn fragmented_frame_reassembles_in_any_order() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);
    establish(&a, &b, &cc);

    let payload: Vec<u8> = (0..3000_u32).map(|i| i as u8).collect();
    let mut packet = craft_frame(NODE_A, NODE_B, 0x3002003004005006, &payload);

    // Split as the sending side would: head plus trailing fragments. The
    // fragmented flag is one of the mutable header bits, so setting it after
    // armoring must not break the MAC.
    let frag_payload = UDP_DEFAULT_MTU - FRAGMENT_HEADER_SIZE;
    let total = (1 + (packet.len() - UDP_DEFAULT_MTU + frag_payload - 1) / frag_payload) as u8;
    packet[PACKET_FLAGS_INDEX] |= HEADER_FLAG_FRAGMENTED;
    let mut pieces: Vec<Vec<u8>> = vec![packet[..UDP_DEFAULT_MTU].to_vec()];
    let mut pos = UDP_DEFAULT_MTU;
    let mut fragment_no = 1;
    while pos < packet.len() {
        let chunk = (packet.len() - pos).min(frag_payload);
        let mut f = proto::fragment_header(&packet, total, fragment_no).to_vec();
        f.extend_from_slice(&packet[pos..pos + chunk]);
        pieces.push(f);
        pos += chunk;
        fragment_no += 1;
    }
    assert!(pieces.len() >= 3);

    // Deliver out of order: last fragment, then head, then the middle.
    b.receive_from(NODE_A, pieces.last().unwrap().clone(), &cc);
    b.receive_from(NODE_A, pieces[0].clone(), &cc);
    for piece in &pieces[1..pieces.len() - 1] {
        b.receive_from(NODE_A, piece.clone(), &cc);
    }

    let packets = b.inner.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].1, payload);
    assert!(b.host.drops().is_empty());
}

#[test]
fn unknown_source_triggers_whois_and_replay() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let r = TestNode::new(NODE_R);
    let mut now = 100_000;
    let cc = cc_at(now);

    // B and A both know the root; B does not know A.
    establish(&b, &r, &cc);
    establish(&a, &r, &cc);

    let frame = craft_frame(NODE_A, NODE_B, 0x4002003004005006, b"early frame");
    b.receive_from(NODE_A, frame, &cc);
    assert!(b.inner.packets().is_empty());

    // B asked the root who A is: one WHOIS on the wire, to R, with A's address.
    let out = b.host.take_wire();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, addr_of(NODE_R));
    let whois = &out[0].1;
    assert_eq!(
        &whois[PACKET_DESTINATION_INDEX..PACKET_DESTINATION_INDEX + 5],
        &identity(NODE_R).address.to_bytes()
    );
    assert_eq!(whois.len(), PACKET_PAYLOAD_START + 5);

    // No reply within the retry delay: the lookup is retransmitted.
    now += WHOIS_RETRY_DELAY + 1;
    let cc2 = cc_at(now);
    b.node.do_background_tasks(&b.host, &cc2);
    let retry = b.host.take_wire();
    assert!(retry.iter().any(|(to, _)| *to == addr_of(NODE_R)));

    // Deliver the first WHOIS to the root, its OK(WHOIS) back to B: B learns
    // A's identity and the parked frame is authenticated and dispatched.
    r.receive_from(NODE_B, whois.clone(), &cc2);
    pump(&r, &[&b], &cc2);
    assert!(b.peer_for(NODE_A, &cc2).is_some());
    let packets = b.inner.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].1, b"early frame");
}

#[test]
fn echo_round_trip() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);
    establish(&a, &b, &cc);

    let mut buf: Buffer<256> = Buffer::new();
    let echo_id = 0x5002003004005006;
    proto::new_packet(&mut buf, echo_id, identity(NODE_B).address, identity(NODE_A).address, Verb::Echo).unwrap();
    buf.append_bytes(b"ping!").unwrap();
    let mut echo = buf.as_bytes().to_vec();
    proto::armor(&mut echo, &session_key(NODE_A, NODE_B), Cipher::Poly1305Salsa2012).unwrap();
    b.receive_from(NODE_A, echo, &cc);

    // The OK(ECHO) goes back to A; dearmor it with the same session key and
    // check the echoed body.
    let out = b.host.take_wire();
    assert_eq!(out.len(), 1);
    let mut reply = out[0].1.clone();
    let key = session_key(NODE_A, NODE_B);
    assert!(matches!(proto::dearmor(&mut reply, &key), proto::Dearmored::Authenticated(_)));
    assert_eq!(reply[PACKET_PAYLOAD_START - 1] & proto::VERB_MASK, Verb::Ok as u8);
    assert_eq!(reply[PACKET_PAYLOAD_START], Verb::Echo as u8);
    assert_eq!(u64::from_be_bytes(reply[PACKET_PAYLOAD_START + 1..PACKET_PAYLOAD_START + 9].try_into().unwrap()), echo_id);
    assert_eq!(&reply[PACKET_PAYLOAD_START + 9..], b"ping!");

    // A second ECHO inside the rate gate window is dropped with a trace.
    let mut buf: Buffer<256> = Buffer::new();
    proto::new_packet(&mut buf, echo_id + 1, identity(NODE_B).address, identity(NODE_A).address, Verb::Echo).unwrap();
    let mut echo2 = buf.as_bytes().to_vec();
    proto::armor(&mut echo2, &session_key(NODE_A, NODE_B), Cipher::Poly1305Salsa2012).unwrap();
    b.receive_from(NODE_A, echo2, &cc);
    assert!(b.host.take_wire().is_empty());
    assert!(b.host.drops().iter().any(|(_, r)| *r == PacketDropReason::RateLimitExceeded));
}

#[test]
fn periodic_gc_keeps_roots_and_saves_evicted_peers() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let r = TestNode::new(NODE_R);
    let cc = cc_at(100_000);

    establish(&b, &r, &cc);
    establish(&a, &b, &cc); // B now also knows A as a normal peer

    // Keep the root fresh while A goes silent past the liveness timeout.
    let later = cc_at(100_000 + PEER_ALIVE_TIMEOUT + 1000);
    let keepalive = craft_frame(NODE_R, NODE_B, 0x6002003004005006, b"root says hi");
    b.receive_from(NODE_R, keepalive, &later);

    b.node.topology().periodic(&b.host, &later);

    let (all, roots) = b.node.topology().all_peers();
    assert_eq!(roots.len(), 1);
    assert!(all.iter().any(|p| p.identity() == identity(NODE_R)));
    assert!(!all.iter().any(|p| p.identity() == identity(NODE_A)), "stale peer must be evicted");

    // The evicted peer was persisted and can be recalled from the cache.
    let recalled = b.node.topology().peer(&b.host, &later, identity(NODE_A).address, true);
    assert!(recalled.is_some(), "evicted peer should reload from the host cache");
    assert_eq!(recalled.unwrap().identity(), identity(NODE_A));
}

#[test]
fn unsolicited_ok_is_rejected() {
    let a = TestNode::new(NODE_A);
    let b = TestNode::new(NODE_B);
    let cc = cc_at(100_000);
    establish(&a, &b, &cc);

    let mut buf: Buffer<256> = Buffer::new();
    proto::new_packet(&mut buf, 0x7002003004005006, identity(NODE_B).address, identity(NODE_A).address, Verb::Ok).unwrap();
    buf.append_u8(Verb::Echo as u8).unwrap();
    buf.append_u64(0xdeadbeefcafe0000).unwrap(); // never sent by B
    let mut ok = buf.as_bytes().to_vec();
    proto::armor(&mut ok, &session_key(NODE_A, NODE_B), Cipher::Poly1305Salsa2012).unwrap();
    b.receive_from(NODE_A, ok, &cc);

    let drops = b.host.drops();
    assert!(drops.iter().any(|(_, r)| *r == PacketDropReason::ReplyNotExpected));
}
