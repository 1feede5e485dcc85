/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;

use crate::identity::Identity;

/* Trace flag bits. Tracing is advisory: events never affect engine behavior,
 * and the flag word is read relaxed without locking since it changes on human
 * timescales. */

pub const TRACE_VL1: u32 = 0x01;
pub const TRACE_VL2: u32 = 0x02;

/// Why an inbound packet was discarded.
///
/// These are data, not errors: an unauthenticated remote can trigger any of
/// them at will, so they are surfaced for debugging and metrics only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketDropReason {
    /// Under-length packet, truncated field, or overflow during parse.
    MalformedPacket,
    /// Identity or address failed to parse, or an unknown cipher ID.
    InvalidObject,
    /// MAC or HMAC mismatch, or an identity mismatch on a known address.
    MacFailed,
    /// LZ4 payload failed to decompress within bounds.
    InvalidCompressedData,
    /// HELLO from a protocol version older than the minimum supported.
    PeerTooOld,
    /// OK or ERROR whose in-re packet ID was never sent or has expired.
    ReplyNotExpected,
    /// A per-peer rate gate tripped.
    RateLimitExceeded,
    /// Unknown verb ID.
    UnrecognizedVerb,
    /// Catch-all for internal initialization failures.
    Unspecified,
}

/// Events that might be interesting to log or aggregate into metrics.
///
/// The code location is an arbitrary pseudo-random identifier that can be
/// grepped for in the source, stable across versions, so a report pinpoints
/// the exact origin without relying on file names and line numbers.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    IncomingPacketDropped {
        code_location: u32,
        packet_id: u64,
        peer_identity: Option<&'a Identity>,
        from: Option<&'a SocketAddr>,
        hops: u8,
        verb: u8,
        reason: PacketDropReason,
    },
    /// A hole-punching or direct-path candidate was handed to the host.
    TryingNewPath {
        code_location: u32,
        trying: &'a Identity,
        physical_address: SocketAddr,
    },
    /// An internal error that should never happen; the packet involved was dropped.
    UnexpectedError {
        code_location: u32,
        message: &'static str,
    },
}
