/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::io::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::buf::{self, Buffer};

/* Wire form of an IP endpoint, self delimiting:
 *
 *   0x00                        nil / unspecified
 *   0x04 ip[4] port[2]          IPv4
 *   0x06 ip[16] port[2]         IPv6
 *
 * Unrecognized type tags are a parse error at this layer.
 */

pub const INET_ADDRESS_TYPE_NIL: u8 = 0x00;
pub const INET_ADDRESS_TYPE_IPV4: u8 = 0x04;
pub const INET_ADDRESS_TYPE_IPV6: u8 = 0x06;

/// Marshaled size of the largest inet address form.
pub const INET_ADDRESS_MARSHAL_SIZE_MAX: usize = 1 + 16 + 2;

pub fn marshal_inet_address<const L: usize>(buf: &mut Buffer<L>, addr: Option<&SocketAddr>) -> Result<()> {
    match addr {
        None => buf.append_u8(INET_ADDRESS_TYPE_NIL),
        Some(SocketAddr::V4(a)) => {
            buf.append_u8(INET_ADDRESS_TYPE_IPV4)?;
            buf.append_bytes_fixed(&a.ip().octets())?;
            buf.append_u16(a.port())
        }
        Some(SocketAddr::V6(a)) => {
            buf.append_u8(INET_ADDRESS_TYPE_IPV6)?;
            buf.append_bytes_fixed(&a.ip().octets())?;
            buf.append_u16(a.port())
        }
    }
}

pub fn unmarshal_inet_address(b: &[u8], cursor: &mut usize) -> Result<Option<SocketAddr>> {
    match buf::read_u8(b, cursor)? {
        INET_ADDRESS_TYPE_NIL => Ok(None),
        INET_ADDRESS_TYPE_IPV4 => {
            let ip: [u8; 4] = *buf::read_bytes_fixed(b, cursor)?;
            let port = buf::read_u16(b, cursor)?;
            Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)))
        }
        INET_ADDRESS_TYPE_IPV6 => {
            let ip: [u8; 16] = *buf::read_bytes_fixed(b, cursor)?;
            let port = buf::read_u16(b, cursor)?;
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)))
        }
        _ => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "unrecognized inet address type")),
    }
}

/// Build a socket address from a raw IP byte field of length 4 or 16, as
/// carried by RENDEZVOUS and PUSH_DIRECT_PATHS.
pub fn ip_bytes_to_socket_addr(ip: &[u8], port: u16) -> Option<SocketAddr> {
    match ip.len() {
        4 => {
            let ip: [u8; 4] = ip.try_into().unwrap();
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        16 => {
            let ip: [u8; 16] = ip.try_into().unwrap();
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => None,
    }
}
