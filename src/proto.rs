/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use salsa20::cipher::StreamCipher;

use crate::address::{Address, ADDRESS_SIZE};
use crate::buf::Buffer;
use crate::crypto::{poly1305_mac, salsa12, Salsa12, Secret, POLY1305_KEY_SIZE, SALSA20_KEY_SIZE};
use crate::symmetrickey::SymmetricKey;

/// Current protocol version.
pub const PROTO_VERSION: u8 = 12;

/// Minimum remote protocol version we will talk to.
pub const PROTO_VERSION_MIN: u8 = 8;

/// Protocol version at which HELLO gained HMAC-SHA384 authentication and the encrypted dictionary.
pub const PROTO_VERSION_HELLO_HMAC: u8 = 11;

pub const VERSION_MAJOR: u8 = 2;
pub const VERSION_MINOR: u8 = 0;
pub const VERSION_REVISION: u16 = 0;

/* Packet header layout
 *
 * [0..8]   packet ID (also the cryptographic nonce)
 * [8..13]  destination address
 * [13..18] source address
 * [18]     flags: rrCCCFHHH -> reserved, cipher (3 bits), fragmented, hops (3 bits)
 * [19..27] MAC (first 8 bytes of Poly1305 tag, zero when HMAC authenticated)
 * [27]     verb (low 5 bits) and verb flags (compressed = 0x80)
 * [28..]   payload
 */

pub const PACKET_ID_INDEX: usize = 0;
pub const PACKET_DESTINATION_INDEX: usize = 8;
pub const PACKET_SOURCE_INDEX: usize = 13;
pub const PACKET_FLAGS_INDEX: usize = 18;
pub const PACKET_MAC_INDEX: usize = 19;
pub const PACKET_VERB_INDEX: usize = 27;

/// Fixed header size, not including the verb byte.
pub const PACKET_HEADER_SIZE: usize = 27;

/// Index at which the verb's payload begins.
pub const PACKET_PAYLOAD_START: usize = 28;

/// Start of the region covered by the packet MAC (and encrypted by encrypting ciphers).
pub const PACKET_ENCRYPTED_SECTION_START: usize = 27;

/// Minimum size of a whole packet: header plus verb.
pub const PACKET_SIZE_MIN: usize = 28;

pub const HEADER_FLAGS_MASK_HOPS: u8 = 0x07;
pub const HEADER_FLAGS_MASK_CIPHER: u8 = 0x38;
pub const HEADER_FLAGS_CIPHER_SHIFT: u32 = 3;
pub const HEADER_FLAG_FRAGMENTED: u8 = 0x40;

/// Header bits that may legitimately change while a packet is in flight
/// (relaying increments hops, the send path sets the fragmented flag when it
/// splits a packet). These are masked out of per-packet key derivation.
pub const HEADER_FLAGS_MASK_MUTABLE: u8 = HEADER_FLAGS_MASK_HOPS | HEADER_FLAG_FRAGMENTED;

/* Fragment layout: shares [0..13] with the head, then:
 *
 * [13]     0xff fragment indicator (an illegal source address first byte)
 * [14]     TTTTNNNN -> total fragments, fragment number
 * [15]     rrrrrHHH -> reserved, hops
 * [16..]   fragment payload
 */

pub const FRAGMENT_INDICATOR_INDEX: usize = 13;
pub const FRAGMENT_INDICATOR: u8 = 0xff;
pub const FRAGMENT_COUNTS_INDEX: usize = 14;
pub const FRAGMENT_HOPS_INDEX: usize = 15;
pub const FRAGMENT_HEADER_SIZE: usize = 16;

/// Minimum datagram size that could be any valid fragment or head.
pub const FRAGMENT_SIZE_MIN: usize = 16;

/// Maximum number of fragments per packet, including the head.
pub const MAX_FRAGMENTS: usize = 8;

/// Bound on concurrently reassembling packets per path, to resist flooding.
pub const MAX_INBOUND_FRAGMENTED_PACKETS_PER_PATH: usize = 16;

/// Default payload MTU for UDP transport.
pub const UDP_DEFAULT_MTU: usize = 1432;

/// Largest packet that can be carried after reassembly.
pub const MAX_PACKET_LENGTH: usize = UDP_DEFAULT_MTU + (MAX_FRAGMENTS - 1) * (UDP_DEFAULT_MTU - FRAGMENT_HEADER_SIZE);

/// Size of a standard packet work buffer, larger than any assembled packet.
pub const BUF_MEM_SIZE: usize = 16384;

/// Verb (inner) flag indicating an LZ4 compressed payload.
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

pub const VERB_MASK: u8 = 0x1f;

/* Timing constants, all in milliseconds of the monotonic tick clock. */

pub const FRAGMENT_ASSEMBLY_TIMEOUT: i64 = 500;
pub const WHOIS_RETRY_DELAY: i64 = 1000;
pub const WHOIS_RETRY_COUNT_MAX: u16 = 5;
pub const MAX_WHOIS_WAITING_PACKETS: usize = 8;
pub const EXPECT_TTL: i64 = 2000;
pub const PATH_ALIVE_TIMEOUT: i64 = 45000;
pub const PATH_KEEPALIVE_PERIOD: i64 = 20000;
pub const PEER_ALIVE_TIMEOUT: i64 = 600000;
pub const PEER_GLOBAL_TIMEOUT: i64 = 30 * 24 * 60 * 60 * 1000;
pub const PACKET_DEDUP_RING_SIZE: usize = 32;
pub const WHOIS_RATE_LIMIT: i64 = 1000;
pub const ECHO_RATE_LIMIT: i64 = 1000;
pub const ROOT_SYNC_INTERVAL: i64 = 1000;
pub const ROOT_HELLO_INTERVAL: i64 = 60000;

/// Keys recognized in the HELLO metadata dictionary.
pub const HELLO_DICT_KEY_INSTANCE_ID: &str = "I";
pub const HELLO_DICT_KEY_CLOCK: &str = "C";

/// Packet cipher/authentication modes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Cipher {
    /// Reserved; currently rejected on ingress.
    None = 0,
    /// Poly1305 authentication without payload encryption (HELLO and its OK).
    Poly1305None = 1,
    /// Salsa20/12 encryption with Poly1305 authentication.
    Poly1305Salsa2012 = 2,
    /// AES-GMAC-SIV; declared but not yet supported on this path.
    AesGmacSiv = 3,
}

impl Cipher {
    #[inline(always)]
    pub fn from_flags(flags: u8) -> Option<Cipher> {
        match (flags & HEADER_FLAGS_MASK_CIPHER) >> HEADER_FLAGS_CIPHER_SHIFT {
            0 => Some(Cipher::None),
            1 => Some(Cipher::Poly1305None),
            2 => Some(Cipher::Poly1305Salsa2012),
            3 => Some(Cipher::AesGmacSiv),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn to_flags(self) -> u8 {
        (self as u8) << HEADER_FLAGS_CIPHER_SHIFT
    }
}

/// Packet verbs. The VL1 core handles the first group; FRAME and friends
/// belong to the inner protocol layer and are passed through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    ExtFrame = 0x07,
    Echo = 0x08,
    MulticastLike = 0x09,
    NetworkCredentials = 0x0a,
    NetworkConfigRequest = 0x0b,
    NetworkConfig = 0x0c,
    MulticastGather = 0x0d,
    MulticastFrameDeprecated = 0x0e,
    PushDirectPaths = 0x10,
    UserMessage = 0x14,
    Multicast = 0x16,
    Encap = 0x17,
}

impl Verb {
    pub fn from_u8(v: u8) -> Option<Verb> {
        Some(match v & VERB_MASK {
            0x00 => Verb::Nop,
            0x01 => Verb::Hello,
            0x02 => Verb::Error,
            0x03 => Verb::Ok,
            0x04 => Verb::Whois,
            0x05 => Verb::Rendezvous,
            0x06 => Verb::Frame,
            0x07 => Verb::ExtFrame,
            0x08 => Verb::Echo,
            0x09 => Verb::MulticastLike,
            0x0a => Verb::NetworkCredentials,
            0x0b => Verb::NetworkConfigRequest,
            0x0c => Verb::NetworkConfig,
            0x0d => Verb::MulticastGather,
            0x0e => Verb::MulticastFrameDeprecated,
            0x10 => Verb::PushDirectPaths,
            0x14 => Verb::UserMessage,
            0x16 => Verb::Multicast,
            0x17 => Verb::Encap,
            _ => return None,
        })
    }
}

/// Error codes carried by the ERROR verb.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ErrorCode {
    InvalidRequest = 0x01,
    BadProtocolVersion = 0x02,
    ObjNotFound = 0x03,
    UnsupportedOperation = 0x04,
    NeedMembershipCertificate = 0x05,
    NetworkAccessDenied = 0x06,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<ErrorCode> {
        Some(match v {
            0x01 => ErrorCode::InvalidRequest,
            0x02 => ErrorCode::BadProtocolVersion,
            0x03 => ErrorCode::ObjNotFound,
            0x04 => ErrorCode::UnsupportedOperation,
            0x05 => ErrorCode::NeedMembershipCertificate,
            0x06 => ErrorCode::NetworkAccessDenied,
            _ => return None,
        })
    }
}

/* Authentication result flags from dearmor(). */

pub const AUTH_FLAG_AUTHENTICATED: u8 = 0x01;
pub const AUTH_FLAG_ENCRYPTED: u8 = 0x02;

#[inline(always)]
pub fn packet_id(packet: &[u8]) -> u64 {
    u64::from_be_bytes(packet[PACKET_ID_INDEX..PACKET_ID_INDEX + 8].try_into().unwrap())
}

#[inline(always)]
pub fn packet_hops(packet: &[u8]) -> u8 {
    packet[PACKET_FLAGS_INDEX] & HEADER_FLAGS_MASK_HOPS
}

#[inline(always)]
pub fn packet_is_fragmented(packet: &[u8]) -> bool {
    (packet[PACKET_FLAGS_INDEX] & HEADER_FLAG_FRAGMENTED) != 0
}

/// Write the fixed packet prefix (header plus verb) and return the payload start index.
pub fn new_packet<const L: usize>(buf: &mut Buffer<L>, id: u64, dest: Address, src: Address, verb: Verb) -> std::io::Result<usize> {
    buf.clear();
    buf.append_u64(id)?;
    buf.append_bytes_fixed(&dest.to_bytes())?;
    buf.append_bytes_fixed(&src.to_bytes())?;
    buf.append_u8(0)?; // flags, cipher filled in by armor()
    buf.append_padding(0, 8)?; // MAC
    buf.append_u8(verb as u8)?;
    Ok(PACKET_PAYLOAD_START)
}

/// Build the 16 byte header of a non-head fragment.
pub fn fragment_header(id_and_dest: &[u8], total_fragments: u8, fragment_no: u8) -> [u8; FRAGMENT_HEADER_SIZE] {
    debug_assert!(id_and_dest.len() >= 8 + ADDRESS_SIZE);
    let mut h = [0_u8; FRAGMENT_HEADER_SIZE];
    h[..8 + ADDRESS_SIZE].copy_from_slice(&id_and_dest[..8 + ADDRESS_SIZE]);
    h[FRAGMENT_INDICATOR_INDEX] = FRAGMENT_INDICATOR;
    h[FRAGMENT_COUNTS_INDEX] = (total_fragments << 4) | (fragment_no & 0x0f);
    h[FRAGMENT_HOPS_INDEX] = 0;
    h
}

/// Derive the per-packet Salsa20/12 key from a session key and packet characteristics.
///
/// Folding the header into the key makes the header act as additional
/// authenticated data: any change to the immutable header fields yields a
/// different key and therefore a MAC mismatch. The mutable bits (hops and the
/// fragmented flag) are excluded.
pub fn salsa2012_derive_key(base: &[u8; SALSA20_KEY_SIZE], packet_header: &[u8], packet_size: usize) -> Secret<SALSA20_KEY_SIZE> {
    let mut k = Secret(*base);
    for i in 0..PACKET_FLAGS_INDEX {
        k.0[i] ^= packet_header[i];
    }
    k.0[PACKET_FLAGS_INDEX] ^= packet_header[PACKET_FLAGS_INDEX] & !HEADER_FLAGS_MASK_MUTABLE;
    k.0[19] ^= (packet_size >> 8) as u8;
    k.0[20] ^= packet_size as u8;
    k
}

/// Create the Salsa20/12 stream and Poly1305 key for a packet.
///
/// The Poly1305 key is the first 32 bytes of keystream, after which the
/// stream is positioned where payload encryption begins, as in the NaCl
/// secret box construction.
pub fn salsa_poly_create(key: &SymmetricKey, packet_header: &[u8], packet_size: usize) -> (Salsa12, [u8; POLY1305_KEY_SIZE]) {
    let per_packet_key = salsa2012_derive_key(key.key.first_n::<SALSA20_KEY_SIZE>(), packet_header, packet_size);
    let nonce: &[u8; 8] = packet_header[PACKET_ID_INDEX..PACKET_ID_INDEX + 8].try_into().unwrap();
    let mut s20 = salsa12(&per_packet_key.0, nonce);
    let mut poly_key = [0_u8; POLY1305_KEY_SIZE];
    s20.apply_keystream(&mut poly_key);
    (s20, poly_key)
}

/// Encrypt and authenticate a fully built packet in place, filling the MAC
/// field, and return its packet ID. Returns None for ciphers this engine
/// cannot yet produce.
pub fn armor(packet: &mut [u8], key: &SymmetricKey, cipher: Cipher) -> Option<u64> {
    debug_assert!(packet.len() >= PACKET_SIZE_MIN);
    packet[PACKET_FLAGS_INDEX] = (packet[PACKET_FLAGS_INDEX] & !HEADER_FLAGS_MASK_CIPHER) | cipher.to_flags();
    match cipher {
        Cipher::Poly1305None => {
            let (header, payload) = packet.split_at_mut(PACKET_ENCRYPTED_SECTION_START);
            let (_, poly_key) = salsa_poly_create(key, header, header.len() + payload.len());
            let tag = poly1305_mac(&poly_key, payload);
            header[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8].copy_from_slice(&tag[..8]);
        }
        Cipher::Poly1305Salsa2012 => {
            let (header, payload) = packet.split_at_mut(PACKET_ENCRYPTED_SECTION_START);
            let (mut s20, poly_key) = salsa_poly_create(key, header, header.len() + payload.len());
            s20.apply_keystream(payload);
            let tag = poly1305_mac(&poly_key, payload);
            header[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8].copy_from_slice(&tag[..8]);
        }
        Cipher::None | Cipher::AesGmacSiv => return None,
    }
    Some(packet_id(packet))
}

/// Result of in-place authentication of an assembled inbound packet.
#[derive(PartialEq, Eq, Debug)]
pub enum Dearmored {
    /// MAC verified; flags say whether the payload was also encrypted.
    Authenticated(u8),
    MacFailed,
    /// Cipher is declared but not yet handled (NONE, AES-GMAC-SIV).
    UnsupportedCipher,
    /// Flags field does not decode to any known cipher.
    InvalidCipher,
}

/// Authenticate, and for encrypting ciphers decrypt, an assembled packet in place.
pub fn dearmor(packet: &mut [u8], key: &SymmetricKey) -> Dearmored {
    debug_assert!(packet.len() >= PACKET_SIZE_MIN);
    match Cipher::from_flags(packet[PACKET_FLAGS_INDEX]) {
        Some(Cipher::Poly1305None) => {
            let (header, payload) = packet.split_at_mut(PACKET_ENCRYPTED_SECTION_START);
            let (_, poly_key) = salsa_poly_create(key, header, header.len() + payload.len());
            let tag = poly1305_mac(&poly_key, payload);
            if tag[..8] == header[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8] {
                Dearmored::Authenticated(AUTH_FLAG_AUTHENTICATED)
            } else {
                Dearmored::MacFailed
            }
        }
        Some(Cipher::Poly1305Salsa2012) => {
            let (header, payload) = packet.split_at_mut(PACKET_ENCRYPTED_SECTION_START);
            let (mut s20, poly_key) = salsa_poly_create(key, header, header.len() + payload.len());
            let tag = poly1305_mac(&poly_key, payload);
            if tag[..8] == header[PACKET_MAC_INDEX..PACKET_MAC_INDEX + 8] {
                s20.apply_keystream(payload);
                Dearmored::Authenticated(AUTH_FLAG_AUTHENTICATED | AUTH_FLAG_ENCRYPTED)
            } else {
                Dearmored::MacFailed
            }
        }
        Some(Cipher::None) | Some(Cipher::AesGmacSiv) => Dearmored::UnsupportedCipher,
        None => Dearmored::InvalidCipher,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secret;

    fn test_key() -> SymmetricKey {
        let mut s = Secret::<64>::new();
        for (i, b) in s.0.iter_mut().enumerate() {
            *b = i as u8;
        }
        SymmetricKey::new(s)
    }

    fn build(verb: Verb, payload: &[u8]) -> Vec<u8> {
        let mut buf: Buffer<2048> = Buffer::new();
        let a = Address::from_u64(0x0101010101).unwrap();
        let b = Address::from_u64(0x0202020202).unwrap();
        new_packet(&mut buf, 0x1122334455667788, a, b, verb).unwrap();
        buf.append_bytes(payload).unwrap();
        buf.as_bytes().to_vec()
    }

    #[test]
    fn header_layout() {
        let pkt = build(Verb::Frame, &[9, 9, 9]);
        assert_eq!(packet_id(&pkt), 0x1122334455667788);
        assert_eq!(&pkt[PACKET_DESTINATION_INDEX..PACKET_DESTINATION_INDEX + 5], &[1, 1, 1, 1, 1]);
        assert_eq!(&pkt[PACKET_SOURCE_INDEX..PACKET_SOURCE_INDEX + 5], &[2, 2, 2, 2, 2]);
        assert_eq!(pkt[PACKET_VERB_INDEX] & VERB_MASK, Verb::Frame as u8);
        assert_eq!(pkt.len(), PACKET_PAYLOAD_START + 3);
        assert_eq!(packet_hops(&pkt), 0);
        assert!(!packet_is_fragmented(&pkt));
    }

    #[test]
    fn armor_dearmor_round_trip() {
        let key = test_key();
        for cipher in [Cipher::Poly1305None, Cipher::Poly1305Salsa2012] {
            let clear = build(Verb::Frame, b"hello wire");
            let mut pkt = clear.clone();
            assert_eq!(armor(&mut pkt, &key, cipher), Some(packet_id(&clear)));
            if cipher == Cipher::Poly1305Salsa2012 {
                assert_ne!(&pkt[PACKET_PAYLOAD_START..], &clear[PACKET_PAYLOAD_START..]);
            }
            match dearmor(&mut pkt, &key) {
                Dearmored::Authenticated(_) => (),
                other => panic!("{:?}", other),
            }
            assert_eq!(&pkt[PACKET_PAYLOAD_START..], &clear[PACKET_PAYLOAD_START..]);
        }
    }

    #[test]
    fn tampering_fails_mac() {
        let key = test_key();
        let mut pkt = build(Verb::Frame, b"hello wire");
        armor(&mut pkt, &key, Cipher::Poly1305Salsa2012).unwrap();
        for i in 0..pkt.len() {
            // The mutable header bits are excluded from authentication.
            if i == PACKET_FLAGS_INDEX {
                continue;
            }
            let mut tampered = pkt.clone();
            tampered[i] ^= 1;
            assert_eq!(dearmor(&mut tampered, &key), Dearmored::MacFailed, "byte {} not covered", i);
        }
    }

    #[test]
    fn hops_and_fragmented_flag_do_not_break_mac() {
        let key = test_key();
        let mut pkt = build(Verb::Frame, b"payload");
        armor(&mut pkt, &key, Cipher::Poly1305Salsa2012).unwrap();
        pkt[PACKET_FLAGS_INDEX] = (pkt[PACKET_FLAGS_INDEX] & !HEADER_FLAGS_MASK_HOPS) | 3;
        pkt[PACKET_FLAGS_INDEX] |= HEADER_FLAG_FRAGMENTED;
        assert!(matches!(dearmor(&mut pkt, &key), Dearmored::Authenticated(_)));
    }

    #[test]
    fn wrong_key_fails() {
        let key = test_key();
        let other = SymmetricKey::new(Secret([0xab_u8; 64]));
        let mut pkt = build(Verb::Frame, b"payload");
        armor(&mut pkt, &key, Cipher::Poly1305Salsa2012).unwrap();
        assert_eq!(dearmor(&mut pkt, &other), Dearmored::MacFailed);
    }

    #[test]
    fn cipher_flag_round_trip() {
        for c in [Cipher::None, Cipher::Poly1305None, Cipher::Poly1305Salsa2012, Cipher::AesGmacSiv] {
            assert_eq!(Cipher::from_flags(c.to_flags()), Some(c));
        }
    }

    #[test]
    fn verb_codes() {
        assert_eq!(Verb::from_u8(0x01), Some(Verb::Hello));
        assert_eq!(Verb::from_u8(0x17), Some(Verb::Encap));
        assert_eq!(Verb::from_u8(VERB_FLAG_COMPRESSED | 0x06), Some(Verb::Frame));
        assert_eq!(Verb::from_u8(0x1f), None);
    }

    #[test]
    fn error_codes() {
        for c in [
            ErrorCode::InvalidRequest,
            ErrorCode::BadProtocolVersion,
            ErrorCode::ObjNotFound,
            ErrorCode::UnsupportedOperation,
            ErrorCode::NeedMembershipCertificate,
            ErrorCode::NetworkAccessDenied,
        ] {
            assert_eq!(ErrorCode::from_u8(c as u8), Some(c));
        }
        assert_eq!(ErrorCode::from_u8(0x7f), None);
    }

    #[test]
    fn fragment_header_encoding() {
        let pkt = build(Verb::Frame, &[0; 64]);
        let h = fragment_header(&pkt, 3, 2);
        assert_eq!(&h[..8], &pkt[..8]);
        assert_eq!(&h[8..13], &pkt[PACKET_DESTINATION_INDEX..PACKET_DESTINATION_INDEX + 5]);
        assert_eq!(h[FRAGMENT_INDICATOR_INDEX], FRAGMENT_INDICATOR);
        assert_eq!(h[FRAGMENT_COUNTS_INDEX] >> 4, 3);
        assert_eq!(h[FRAGMENT_COUNTS_INDEX] & 0x0f, 2);
    }
}
