/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::io::{Error, ErrorKind, Result};

fn overflow_err() -> Error {
    Error::new(ErrorKind::UnexpectedEof, "buffer overflow")
}

/// A bounds checked binary I/O buffer with append and cursor-read accessors.
///
/// All integer accessors are big-endian, which is the wire byte order for
/// every multi-byte field in the protocol.
#[derive(Clone)]
pub struct Buffer<const L: usize>(usize, [u8; L]);

impl<const L: usize> Default for Buffer<L> {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl<const L: usize> Buffer<L> {
    pub const CAPACITY: usize = L;

    #[inline(always)]
    pub fn new() -> Self {
        Self(0, [0_u8; L])
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.1[..self.0]
    }

    #[inline(always)]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.1[..self.0]
    }

    pub fn clear(&mut self) {
        self.1[..self.0].fill(0);
        self.0 = 0;
    }

    /// Set the length of this buffer's contents, zeroing anything newly exposed.
    pub fn set_size(&mut self, s: usize) {
        assert!(s <= L);
        if s > self.0 {
            self.1[self.0..s].fill(0);
        }
        self.0 = s;
    }

    pub fn append_u8(&mut self, i: u8) -> Result<()> {
        let ptr = self.0;
        if ptr < L {
            self.0 = ptr + 1;
            self.1[ptr] = i;
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    pub fn append_u16(&mut self, i: u16) -> Result<()> {
        self.append_bytes(&i.to_be_bytes())
    }

    pub fn append_u32(&mut self, i: u32) -> Result<()> {
        self.append_bytes(&i.to_be_bytes())
    }

    pub fn append_u64(&mut self, i: u64) -> Result<()> {
        self.append_bytes(&i.to_be_bytes())
    }

    pub fn append_bytes(&mut self, b: &[u8]) -> Result<()> {
        let ptr = self.0;
        let end = ptr + b.len();
        if end <= L {
            self.0 = end;
            self.1[ptr..end].copy_from_slice(b);
            Ok(())
        } else {
            Err(overflow_err())
        }
    }

    #[inline(always)]
    pub fn append_bytes_fixed<const S: usize>(&mut self, b: &[u8; S]) -> Result<()> {
        self.append_bytes(b)
    }

    pub fn append_padding(&mut self, b: u8, count: usize) -> Result<()> {
        let ptr = self.0;
        let end = ptr + count;
        if end <= L {
            self.0 = end;
            self.1[ptr..end].fill(b);
            Ok(())
        } else {
            Err(overflow_err())
        }
    }
}

/* Cursor reads over raw slices, used when parsing assembled inbound packets. */

pub fn read_u8(b: &[u8], cursor: &mut usize) -> Result<u8> {
    let i = *cursor;
    if i < b.len() {
        *cursor = i + 1;
        Ok(b[i])
    } else {
        Err(overflow_err())
    }
}

pub fn read_u16(b: &[u8], cursor: &mut usize) -> Result<u16> {
    Ok(u16::from_be_bytes(*read_bytes_fixed(b, cursor)?))
}

pub fn read_u32(b: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_be_bytes(*read_bytes_fixed(b, cursor)?))
}

pub fn read_u64(b: &[u8], cursor: &mut usize) -> Result<u64> {
    Ok(u64::from_be_bytes(*read_bytes_fixed(b, cursor)?))
}

pub fn read_bytes<'a>(b: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *cursor;
    let end = start.checked_add(len).ok_or_else(overflow_err)?;
    if end <= b.len() {
        *cursor = end;
        Ok(&b[start..end])
    } else {
        Err(overflow_err())
    }
}

pub fn read_bytes_fixed<'a, const S: usize>(b: &'a [u8], cursor: &mut usize) -> Result<&'a [u8; S]> {
    let f = read_bytes(b, cursor, S)?;
    Ok(f.try_into().unwrap())
}
