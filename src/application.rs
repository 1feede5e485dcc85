/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::Arc;

use crate::identity::Identity;
use crate::path::Path;
use crate::peer::Peer;
use crate::proto::Verb;
use crate::trace::TraceEvent;

/// Times sampled at entry into the engine and threaded through every call.
///
/// `ticks` is a monotonically increasing millisecond clock used for all
/// timeout logic; `clock` is real wall time in milliseconds since epoch, used
/// only where values must survive restarts (e.g. cached peer records).
#[derive(Clone, Copy)]
pub struct CallContext {
    pub ticks: i64,
    pub clock: i64,
}

/// Object classes in the host's persistent store.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateObjectType {
    NodeIdentity,
    Peer,
}

/// Identity and endpoints of one trusted root, as reported by the host's
/// trust store.
#[derive(Clone)]
pub struct RootSpec {
    pub identity: Identity,
    pub endpoints: Vec<SocketAddr>,
    /// Optional signed endpoint bundle, opaque at this layer.
    pub locator: Option<Vec<u8>>,
}

/// Trait implemented by the surrounding host or service to provide the system
/// facilities VL1 consumes: the physical wire, persistent state, the trust
/// store, and event/trace sinks.
///
/// These are callbacks invoked during `on_remote_packet` and
/// `do_background_tasks`; they should not block longer than a synchronous
/// socket write.
pub trait HostSystem: Sync + Send {
    /// Send a datagram over the physical wire.
    ///
    /// `local_socket` is the host's own bound-socket identifier as previously
    /// passed into `on_remote_packet`, or -1 if any socket may be used. A
    /// return of true means the send succeeded or may have succeeded (UDP).
    fn wire_send(&self, local_socket: i64, to: &SocketAddr, data: &[u8]) -> bool;

    /// Fetch an object from the persistent store, or None if absent.
    fn state_get(&self, object_type: StateObjectType, id: &[u8]) -> Option<Vec<u8>>;

    /// Write an object to the persistent store.
    fn state_put(&self, object_type: StateObjectType, id: &[u8], data: &[u8]);

    /// Report the current set of trusted roots.
    fn trusted_roots(&self) -> Vec<RootSpec>;

    /// A physical address was suggested as a candidate direct path to a peer,
    /// via RENDEZVOUS or PUSH_DIRECT_PATHS. NAT traversal is the host's job.
    fn candidate_path(&self, _peer: &Identity, _physical_address: SocketAddr) {}

    /// A peer told us what our own external address looks like from where it sits.
    fn learned_external_address(&self, _reporter: &Identity, _address: SocketAddr) {}

    /// A USER_MESSAGE packet was received from an authenticated peer.
    fn user_message(&self, _source: &Identity, _message_type: u64, _message: &[u8]) {}

    /// An ENCAP packet was received from an authenticated peer.
    fn encap(&self, _source: &Identity, _payload: &[u8]) {}

    /// Receives trace events, gated by the node's trace flag word.
    /// Advisory only; must never influence protocol behavior.
    fn event_trace(&self, _event: TraceEvent<'_>) {}
}

/// Interface between VL1 and the inner virtual-Ethernet protocol layer.
///
/// Implemented by the VL2 switch; packets reaching these methods have already
/// been authenticated, deduplicated, and decompressed. A return of true means
/// the message was recognized and handled.
pub trait InnerProtocol: Sync + Send {
    /// Handle a packet whose verb belongs to the inner layer (FRAME and friends).
    fn handle_packet(&self, cc: &CallContext, source: &Arc<Peer>, source_path: &Arc<Path>, auth_flags: u8, verb: Verb, payload: &[u8]) -> bool;

    /// Handle an OK in reply to an inner-layer verb.
    fn handle_ok(
        &self,
        cc: &CallContext,
        source: &Arc<Peer>,
        source_path: &Arc<Path>,
        auth_flags: u8,
        in_re_verb: Verb,
        in_re_packet_id: u64,
        payload: &[u8],
    ) -> bool;

    /// Handle an ERROR in reply to an inner-layer verb.
    fn handle_error(
        &self,
        cc: &CallContext,
        source: &Arc<Peer>,
        source_path: &Arc<Path>,
        auth_flags: u8,
        in_re_verb: Verb,
        in_re_packet_id: u64,
        error_code: u8,
        payload: &[u8],
    ) -> bool;
}
