/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use sha2::{Digest, Sha384, Sha512};
use zeroize::Zeroize;

pub const SALSA20_KEY_SIZE: usize = 32;
pub const SALSA20_NONCE_SIZE: usize = 8;
pub const POLY1305_KEY_SIZE: usize = 32;
pub const POLY1305_MAC_SIZE: usize = 16;
pub const AES_CTR_KEY_SIZE: usize = 16;
pub const AES_CTR_NONCE_SIZE: usize = 12;
pub const HMAC_SHA384_SIZE: usize = 48;
pub const SHA512_HASH_SIZE: usize = 64;

pub type Salsa12 = salsa20::Salsa12;
pub type Salsa20 = salsa20::Salsa20;

/// Constant time byte slice equality.
pub fn secure_eq<A: AsRef<[u8]> + ?Sized, B: AsRef<[u8]> + ?Sized>(a: &A, b: &B) -> bool {
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.len() == b.len() {
        let mut x = 0u8;
        for (aa, bb) in a.iter().zip(b.iter()) {
            x |= *aa ^ *bb;
        }
        x == 0
    } else {
        false
    }
}

/// Container for secrets that clears them on drop.
///
/// This doesn't catch every copy a library might make internally, but using it
/// for everything long-lived keeps key material out of dead memory and swap.
#[derive(Clone)]
#[repr(transparent)]
pub struct Secret<const L: usize>(pub [u8; L]);

impl<const L: usize> Secret<L> {
    #[inline(always)]
    pub fn new() -> Self {
        Self([0_u8; L])
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; L] {
        &self.0
    }

    /// Get the first N bytes of this secret as a fixed length array.
    #[inline(always)]
    pub fn first_n<const N: usize>(&self) -> &[u8; N] {
        assert!(N <= L);
        self.0[..N].try_into().unwrap()
    }
}

impl<const L: usize> Default for Secret<L> {
    #[inline(always)]
    fn default() -> Self {
        Self([0_u8; L])
    }
}

impl<const L: usize> Drop for Secret<L> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<const L: usize> AsRef<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const L: usize> PartialEq for Secret<L> {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&self.0, &other.0)
    }
}
impl<const L: usize> Eq for Secret<L> {}

impl<const L: usize> core::fmt::Debug for Secret<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Secret<{}>(REDACTED)", L)
    }
}

/// Create a Salsa20/12 instance keyed and positioned for a packet.
#[inline(always)]
pub fn salsa12(key: &[u8; SALSA20_KEY_SIZE], nonce: &[u8; SALSA20_NONCE_SIZE]) -> Salsa12 {
    Salsa12::new(key.into(), nonce.into())
}

/// One-shot Poly1305 over a message with NaCl (unpadded) semantics.
#[inline(always)]
pub fn poly1305_mac(key: &[u8; POLY1305_KEY_SIZE], msg: &[u8]) -> [u8; POLY1305_MAC_SIZE] {
    Poly1305::new(key.into()).compute_unpadded(msg).into()
}

pub fn sha512(msg: &[&[u8]]) -> [u8; SHA512_HASH_SIZE] {
    let mut h = Sha512::new();
    for m in msg {
        h.update(m);
    }
    let mut out = [0_u8; SHA512_HASH_SIZE];
    out.copy_from_slice(h.finalize().as_slice());
    out
}

pub fn hmac_sha384(key: &[u8], msg: &[&[u8]]) -> [u8; HMAC_SHA384_SIZE] {
    let mut m = <Hmac<Sha384> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    for b in msg {
        m.update(b);
    }
    let mut out = [0_u8; HMAC_SHA384_SIZE];
    out.copy_from_slice(m.finalize().into_bytes().as_slice());
    out
}

pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut m = <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    m.update(msg);
    let mut out = [0_u8; 64];
    out.copy_from_slice(m.finalize().into_bytes().as_slice());
    out
}

/// NIST SP 800-108 style KBKDF using HMAC-SHA-384 with a one byte label.
pub fn zt_kbkdf_hmac_sha384(key: &[u8], label: u8) -> Secret<HMAC_SHA384_SIZE> {
    Secret(hmac_sha384(key, &[&[0, 0, 0, 1, b'Z', b'T', label, 0, 0, 0, 0, 1, 0x80]]))
}

/// AES-128-CTR in place with a 96-bit nonce and 32-bit big-endian counter starting at zero.
pub fn aes_ctr_crypt_in_place(key: &[u8; AES_CTR_KEY_SIZE], nonce: &[u8; AES_CTR_NONCE_SIZE], data: &mut [u8]) {
    let mut iv = [0_u8; 16];
    iv[..AES_CTR_NONCE_SIZE].copy_from_slice(nonce);
    let mut ctr = ctr::Ctr32BE::<Aes128>::new(key.into(), (&iv).into());
    ctr.apply_keystream(data);
}
