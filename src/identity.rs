/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::fmt;
use std::io::{Error, ErrorKind, Result};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use p384::ecdsa;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::address::Address;
use crate::buf::{self, Buffer};
use crate::crypto::{hmac_sha512, secure_eq, sha512, Salsa20, Secret};

pub const C25519_PUBLIC_KEY_SIZE: usize = 32;
pub const C25519_SECRET_KEY_SIZE: usize = 32;
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SECRET_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const P384_PUBLIC_KEY_SIZE: usize = 49;
pub const P384_SECRET_KEY_SIZE: usize = 48;
pub const P384_ECDSA_SIGNATURE_SIZE: usize = 96;

/// Curve25519 and Ed25519 (the legacy algorithm, always present).
pub const IDENTITY_ALGORITHM_X25519: u8 = 0x01;

/// NIST P-384 ECDH and ECDSA extension.
pub const IDENTITY_ALGORITHM_EC_NIST_P384: u8 = 0x02;

/// First byte of the work function output must be below this for a valid identity.
pub const IDENTITY_POW_THRESHOLD: u8 = 17;

/// Sanity bound for a marshaled identity.
pub const IDENTITY_MARSHAL_SIZE_MAX: usize = 512;

const P384_PUBLIC_ONLY_BUNDLE_SIZE: u16 =
    (P384_PUBLIC_KEY_SIZE + P384_PUBLIC_KEY_SIZE + P384_ECDSA_SIGNATURE_SIZE + ED25519_SIGNATURE_SIZE) as u16;
const P384_PUBLIC_AND_PRIVATE_BUNDLE_SIZE: u16 =
    P384_PUBLIC_ONLY_BUNDLE_SIZE + (P384_SECRET_KEY_SIZE + P384_SECRET_KEY_SIZE) as u16;

#[derive(Clone)]
pub struct IdentityP384Public {
    pub ecdh: p384::PublicKey,
    pub ecdsa: ecdsa::VerifyingKey,
    pub ecdsa_self_signature: [u8; P384_ECDSA_SIGNATURE_SIZE],
    pub ed25519_self_signature: [u8; ED25519_SIGNATURE_SIZE],
}

#[derive(Clone)]
pub struct IdentityP384Secret {
    pub ecdh: p384::SecretKey,
    pub ecdsa: ecdsa::SigningKey,
}

#[derive(Clone)]
pub struct IdentitySecret {
    pub c25519: StaticSecret,
    pub ed25519: SigningKey,
    pub p384: Option<IdentityP384Secret>,
}

/// A ZeroTier identity: an address backed by public key material whose hash
/// provably derives that address.
///
/// Identities are immutable once constructed. Equality is by fingerprint,
/// which covers the address and all public keys.
#[derive(Clone)]
pub struct Identity {
    pub address: Address,
    pub c25519: [u8; C25519_PUBLIC_KEY_SIZE],
    pub ed25519: [u8; ED25519_PUBLIC_KEY_SIZE],
    pub p384: Option<IdentityP384Public>,
    pub secret: Option<IdentitySecret>,
    pub fingerprint: [u8; 64],
}

fn invalid(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

impl Identity {
    /// Generate a new identity, grinding key pairs until the address derivation
    /// work function is satisfied. This takes a perceptible fraction of a second.
    pub fn generate() -> Self {
        let ed25519 = SigningKey::generate(&mut OsRng);
        let ed25519_pub = ed25519.verifying_key().to_bytes();
        let (address, c25519) = loop {
            let c25519 = StaticSecret::random_from_rng(OsRng);
            let c25519_pub = X25519PublicKey::from(&c25519).to_bytes();
            let mut digest = sha512(&[&c25519_pub, &ed25519_pub]);
            address_derivation_work_function(&mut digest);
            if digest[0] < IDENTITY_POW_THRESHOLD {
                if let Some(address) = Address::from_bytes(digest[59..64].try_into().unwrap()) {
                    break (address, c25519);
                }
            }
        };
        let c25519_pub = X25519PublicKey::from(&c25519).to_bytes();

        let p384_ecdh = p384::SecretKey::random(&mut OsRng);
        let p384_ecdsa = ecdsa::SigningKey::random(&mut OsRng);
        let ecdh_pub = p384_public_to_bytes(&p384_ecdh.public_key());
        let ecdsa_pub = ecdsa_public_to_bytes(p384_ecdsa.verifying_key());

        let mut self_sign_buf = Vec::with_capacity(256);
        self_sign_buf.extend_from_slice(&address.to_bytes());
        self_sign_buf.extend_from_slice(&c25519_pub);
        self_sign_buf.extend_from_slice(&ed25519_pub);
        self_sign_buf.push(IDENTITY_ALGORITHM_EC_NIST_P384);
        self_sign_buf.extend_from_slice(&ecdh_pub);
        self_sign_buf.extend_from_slice(&ecdsa_pub);

        let ecdsa_sig: ecdsa::Signature = p384_ecdsa.sign(&self_sign_buf);
        let mut ecdsa_self_signature = [0_u8; P384_ECDSA_SIGNATURE_SIZE];
        ecdsa_self_signature.copy_from_slice(ecdsa_sig.to_bytes().as_slice());

        // The ed25519 signature binds the new keys to the original key pair and
        // covers the (non-deterministic) ECDSA signature so an identity with the
        // same address cannot be given a different fingerprint by mangling it.
        self_sign_buf.extend_from_slice(&ecdsa_self_signature);
        let ed25519_self_signature = ed25519.sign(&self_sign_buf).to_bytes();

        let fingerprint = fingerprint_of(&address, &c25519_pub, &ed25519_pub, Some((&ecdh_pub, &ecdsa_pub)));
        Self {
            address,
            c25519: c25519_pub,
            ed25519: ed25519_pub,
            p384: Some(IdentityP384Public {
                ecdh: p384_ecdh.public_key(),
                ecdsa: p384_ecdsa.verifying_key().clone(),
                ecdsa_self_signature,
                ed25519_self_signature,
            }),
            secret: Some(IdentitySecret {
                c25519,
                ed25519,
                p384: Some(IdentityP384Secret { ecdh: p384_ecdh, ecdsa: p384_ecdsa }),
            }),
            fingerprint,
        }
    }

    pub fn algorithms(&self) -> u8 {
        if self.p384.is_some() {
            IDENTITY_ALGORITHM_X25519 | IDENTITY_ALGORITHM_EC_NIST_P384
        } else {
            IDENTITY_ALGORITHM_X25519
        }
    }

    /// Locally check the validity of this identity.
    ///
    /// This runs the memory-intensive work function and so takes real time.
    pub fn locally_validate(&self) -> bool {
        if let Some(p384) = self.p384.as_ref() {
            let mut self_sign_buf = Vec::with_capacity(256);
            self_sign_buf.extend_from_slice(&self.address.to_bytes());
            self_sign_buf.extend_from_slice(&self.c25519);
            self_sign_buf.extend_from_slice(&self.ed25519);
            self_sign_buf.push(IDENTITY_ALGORITHM_EC_NIST_P384);
            self_sign_buf.extend_from_slice(&p384_public_to_bytes(&p384.ecdh));
            self_sign_buf.extend_from_slice(&ecdsa_public_to_bytes(&p384.ecdsa));

            let sig = match ecdsa::Signature::from_slice(&p384.ecdsa_self_signature) {
                Ok(s) => s,
                Err(_) => return false,
            };
            if p384.ecdsa.verify(&self_sign_buf, &sig).is_err() {
                return false;
            }

            self_sign_buf.extend_from_slice(&p384.ecdsa_self_signature);
            let vk = match VerifyingKey::from_bytes(&self.ed25519) {
                Ok(k) => k,
                Err(_) => return false,
            };
            let ed_sig = ed25519_dalek::Signature::from_bytes(&p384.ed25519_self_signature);
            if vk.verify(&self_sign_buf, &ed_sig).is_err() {
                return false;
            }
        }

        let mut digest = sha512(&[&self.c25519, &self.ed25519]);
        address_derivation_work_function(&mut digest);
        digest[0] < IDENTITY_POW_THRESHOLD
            && Address::from_bytes(digest[59..64].try_into().unwrap()).map_or(false, |a| a == self.address)
    }

    /// Perform key agreement with another identity, requiring our secret keys.
    ///
    /// If both identities carry P-384 keys the result mixes both curves via
    /// HMAC-SHA-512(SHA-512(x25519 secret), p384 secret); otherwise it is the
    /// hash of the x25519 agreement alone. 512 bits so that downstream KDFs
    /// lose no entropy; packet ciphers use the leading bytes.
    pub fn agree(&self, other: &Identity) -> Option<Secret<64>> {
        let secret = self.secret.as_ref()?;
        let c25519_shared = secret.c25519.diffie_hellman(&X25519PublicKey::from(other.c25519));
        let c25519_secret = Secret(sha512(&[c25519_shared.as_bytes()]));
        if let (Some(my_p384), Some(their_p384)) = (secret.p384.as_ref(), other.p384.as_ref()) {
            let p384_shared = p384::ecdh::diffie_hellman(my_p384.ecdh.to_nonzero_scalar(), their_p384.ecdh.as_affine());
            Some(Secret(hmac_sha512(&c25519_secret.0, p384_shared.raw_secret_bytes().as_slice())))
        } else {
            Some(c25519_secret)
        }
    }

    pub fn marshal<const L: usize>(&self, buf: &mut Buffer<L>, include_private: bool) -> Result<()> {
        buf.append_bytes_fixed(&self.address.to_bytes())?;
        buf.append_u8(0x00)?; // legacy x25519 section tag
        buf.append_bytes_fixed(&self.c25519)?;
        buf.append_bytes_fixed(&self.ed25519)?;
        if include_private && self.secret.is_some() {
            let secret = self.secret.as_ref().unwrap();
            buf.append_u8((C25519_SECRET_KEY_SIZE + ED25519_SECRET_KEY_SIZE) as u8)?;
            buf.append_bytes_fixed(&secret.c25519.to_bytes())?;
            buf.append_bytes_fixed(&secret.ed25519.to_bytes())?;
        } else {
            buf.append_u8(0)?;
        }

        if let Some(p384) = self.p384.as_ref() {
            let secret = if include_private {
                self.secret.as_ref().and_then(|s| s.p384.as_ref())
            } else {
                None
            };
            let bundle_size = if secret.is_some() {
                P384_PUBLIC_AND_PRIVATE_BUNDLE_SIZE
            } else {
                P384_PUBLIC_ONLY_BUNDLE_SIZE
            };

            // Versions that predate P-384 parse what follows the x25519 keys as
            // an unrecognized variable length InetAddress (0x03 plus a 16-bit
            // size) and skip it, so this section must stay behind that prefix.
            buf.append_u8(0x03)?;
            buf.append_u16(bundle_size + 3)?;
            buf.append_u8(IDENTITY_ALGORITHM_EC_NIST_P384)?;
            buf.append_u16(bundle_size)?;
            buf.append_bytes_fixed(&p384_public_to_bytes(&p384.ecdh))?;
            buf.append_bytes_fixed(&ecdsa_public_to_bytes(&p384.ecdsa))?;
            buf.append_bytes_fixed(&p384.ecdsa_self_signature)?;
            buf.append_bytes_fixed(&p384.ed25519_self_signature)?;
            if let Some(secret) = secret {
                buf.append_bytes(secret.ecdh.to_bytes().as_slice())?;
                buf.append_bytes(secret.ecdsa.to_bytes().as_slice())?;
            }
        }
        Ok(())
    }

    /// Parse an identity from a buffer, advancing the cursor past it.
    ///
    /// This checks key self consistency (declared public keys must match any
    /// included secrets) but does not run the expensive full validation.
    pub fn unmarshal(b: &[u8], cursor: &mut usize) -> Result<Identity> {
        let address =
            Address::from_bytes(buf::read_bytes_fixed(b, cursor)?).ok_or_else(|| invalid("invalid address"))?;

        let tag = buf::read_u8(b, cursor)?;
        if tag != 0x00 && tag != IDENTITY_ALGORITHM_X25519 {
            return Err(invalid("x25519 keys missing"));
        }
        let c25519: [u8; C25519_PUBLIC_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
        let ed25519: [u8; ED25519_PUBLIC_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;

        let sec_size = buf::read_u8(b, cursor)?;
        let x25519_secret = match sec_size as usize {
            0 => None,
            s if s == C25519_SECRET_KEY_SIZE + ED25519_SECRET_KEY_SIZE => {
                let c_sec: [u8; C25519_SECRET_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
                let e_sec: [u8; ED25519_SECRET_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
                let c_sec = StaticSecret::from(c_sec);
                let e_sec = SigningKey::from_bytes(&e_sec);
                if X25519PublicKey::from(&c_sec).to_bytes() != c25519 || e_sec.verifying_key().to_bytes() != ed25519 {
                    return Err(invalid("x25519 secret does not match public"));
                }
                Some((c_sec, e_sec))
            }
            _ => return Err(invalid("invalid x25519 secret")),
        };

        let mut p384_public = None;
        let mut p384_secret = None;
        if *cursor < b.len() && b[*cursor] == 0x03 {
            *cursor += 1;
            let _skip_size = buf::read_u16(b, cursor)?;
            if buf::read_u8(b, cursor)? != IDENTITY_ALGORITHM_EC_NIST_P384 {
                return Err(invalid("unrecognized key section"));
            }
            let size = buf::read_u16(b, cursor)?;
            if size != P384_PUBLIC_ONLY_BUNDLE_SIZE && size != P384_PUBLIC_AND_PRIVATE_BUNDLE_SIZE {
                return Err(invalid("invalid p384 section size"));
            }
            let ecdh_pub: [u8; P384_PUBLIC_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
            let ecdsa_pub: [u8; P384_PUBLIC_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
            let ecdsa_self_signature: [u8; P384_ECDSA_SIGNATURE_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
            let ed25519_self_signature: [u8; ED25519_SIGNATURE_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
            let ecdh = p384::PublicKey::from_sec1_bytes(&ecdh_pub).map_err(|_| invalid("invalid p384 ecdh key"))?;
            let ecdsa =
                ecdsa::VerifyingKey::from_sec1_bytes(&ecdsa_pub).map_err(|_| invalid("invalid p384 ecdsa key"))?;

            if size == P384_PUBLIC_AND_PRIVATE_BUNDLE_SIZE {
                let ecdh_sec: [u8; P384_SECRET_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
                let ecdsa_sec: [u8; P384_SECRET_KEY_SIZE] = *buf::read_bytes_fixed(b, cursor)?;
                let ecdh_sec =
                    p384::SecretKey::from_slice(&ecdh_sec).map_err(|_| invalid("invalid p384 ecdh secret"))?;
                let ecdsa_sec =
                    ecdsa::SigningKey::from_slice(&ecdsa_sec).map_err(|_| invalid("invalid p384 ecdsa secret"))?;
                if ecdh_sec.public_key() != ecdh || ecdsa_sec.verifying_key() != &ecdsa {
                    return Err(invalid("p384 secret does not match public"));
                }
                p384_secret = Some(IdentityP384Secret { ecdh: ecdh_sec, ecdsa: ecdsa_sec });
            }
            p384_public = Some(IdentityP384Public { ecdh, ecdsa, ecdsa_self_signature, ed25519_self_signature });
        }

        let p384_key_bytes = p384_public
            .as_ref()
            .map(|p| (p384_public_to_bytes(&p.ecdh), ecdsa_public_to_bytes(&p.ecdsa)));
        let fingerprint = fingerprint_of(&address, &c25519, &ed25519, p384_key_bytes.as_ref().map(|p| (&p.0, &p.1)));

        Ok(Identity {
            address,
            c25519,
            ed25519,
            p384: p384_public,
            secret: x25519_secret.map(|(c25519, ed25519)| IdentitySecret { c25519, ed25519, p384: p384_secret }),
            fingerprint,
        })
    }

    pub fn to_bytes(&self, include_private: bool) -> Buffer<IDENTITY_MARSHAL_SIZE_MAX> {
        let mut b: Buffer<IDENTITY_MARSHAL_SIZE_MAX> = Buffer::new();
        self.marshal(&mut b, include_private).expect("identity exceeds marshal size bound");
        b
    }
}

fn p384_public_to_bytes(k: &p384::PublicKey) -> [u8; P384_PUBLIC_KEY_SIZE] {
    let ep = k.to_encoded_point(true);
    let mut out = [0_u8; P384_PUBLIC_KEY_SIZE];
    out.copy_from_slice(ep.as_bytes());
    out
}

fn ecdsa_public_to_bytes(k: &ecdsa::VerifyingKey) -> [u8; P384_PUBLIC_KEY_SIZE] {
    let ep = k.to_encoded_point(true);
    let mut out = [0_u8; P384_PUBLIC_KEY_SIZE];
    out.copy_from_slice(ep.as_bytes());
    out
}

fn fingerprint_of(
    address: &Address,
    c25519: &[u8; C25519_PUBLIC_KEY_SIZE],
    ed25519: &[u8; ED25519_PUBLIC_KEY_SIZE],
    p384: Option<(&[u8; P384_PUBLIC_KEY_SIZE], &[u8; P384_PUBLIC_KEY_SIZE])>,
) -> [u8; 64] {
    match p384 {
        Some((ecdh, ecdsa)) => sha512(&[
            &address.to_bytes(),
            c25519,
            ed25519,
            &[IDENTITY_ALGORITHM_EC_NIST_P384],
            ecdh,
            ecdsa,
        ]),
        None => sha512(&[&address.to_bytes(), c25519, ed25519]),
    }
}

const ADDRESS_DERIVATION_HASH_MEMORY_SIZE: usize = 2097152;

/// The memory-intensive work function that turns a key hash into an address.
///
/// Addresses are only unique identifiers; the keys are what truly determine
/// node identity. The memory hardness just makes brute forcing a chosen or
/// colliding address expensive.
fn address_derivation_work_function(digest: &mut [u8; 64]) {
    let mut genmem = vec![0_u8; ADDRESS_DERIVATION_HASH_MEMORY_SIZE];

    let key: [u8; 32] = digest[..32].try_into().unwrap();
    let nonce: [u8; 8] = digest[32..40].try_into().unwrap();
    let mut s20 = Salsa20::new((&key).into(), (&nonce).into());

    s20.apply_keystream(&mut genmem[..64]);
    let mut i = 64;
    while i < ADDRESS_DERIVATION_HASH_MEMORY_SIZE {
        let (prev, cur) = genmem.split_at_mut(i);
        cur[..64].copy_from_slice(&prev[i - 64..]);
        s20.apply_keystream(&mut cur[..64]);
        i += 64;
    }

    let mut i = 0;
    while i < (ADDRESS_DERIVATION_HASH_MEMORY_SIZE / 8) {
        let o = i * 8;
        let idx1 = ((u64::from_be_bytes(genmem[o..o + 8].try_into().unwrap()) & 7) * 8) as usize;
        let idx2 = ((u64::from_be_bytes(genmem[o + 8..o + 16].try_into().unwrap())
            % (ADDRESS_DERIVATION_HASH_MEMORY_SIZE as u64 / 8))
            * 8) as usize;
        let mut tmp = [0_u8; 8];
        tmp.copy_from_slice(&genmem[idx2..idx2 + 8]);
        genmem[idx2..idx2 + 8].copy_from_slice(&digest[idx1..idx1 + 8]);
        digest[idx1..idx1 + 8].copy_from_slice(&tmp);
        s20.apply_keystream(digest);
        i += 2;
    }
}

impl PartialEq for Identity {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&self.fingerprint, &other.fingerprint)
    }
}
impl Eq for Identity {}

impl std::hash::Hash for Identity {
    #[inline(always)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.address.to_u64())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("algorithms", &self.algorithms())
            .field("secret", &self.secret.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_validate_marshal_agree() {
        let a = Identity::generate();
        assert!(a.locally_validate());
        assert!(a.p384.is_some() && a.secret.is_some());

        // Round trip with and without private keys.
        let b = a.to_bytes(true);
        let mut cursor = 0;
        let a2 = Identity::unmarshal(b.as_bytes(), &mut cursor).unwrap();
        assert_eq!(cursor, b.len());
        assert_eq!(a2, a);
        assert!(a2.secret.is_some());
        assert!(a2.secret.as_ref().unwrap().p384.is_some());

        let b = a.to_bytes(false);
        let mut cursor = 0;
        let a3 = Identity::unmarshal(b.as_bytes(), &mut cursor).unwrap();
        assert_eq!(a3, a);
        assert!(a3.secret.is_none());
        assert!(a3.locally_validate());

        // A second identity, agreement must be symmetric and non-trivial.
        let z = Identity::generate();
        assert_ne!(z, a);
        let k1 = a.agree(&z).unwrap();
        let k2 = z.agree(&a).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1.0, [0_u8; 64]);

        // Public-only side can still be agreed *with* by a secret holder.
        assert!(a3.agree(&z).is_none());
        assert_eq!(z.agree(&a3).unwrap(), k2);

        // Tampering with the claimed address must fail validation.
        let mut forged = a.clone();
        forged.address = Address::from_u64(a.address.to_u64() ^ 1).unwrap();
        assert!(!forged.locally_validate());
    }

    #[test]
    fn unmarshal_stops_at_identity_end() {
        let a = Identity::generate();
        let mut b: Buffer<IDENTITY_MARSHAL_SIZE_MAX> = Buffer::new();
        a.marshal(&mut b, false).unwrap();
        let id_len = b.len();
        // Trailing data, e.g. the rest of a HELLO, must be left unread.
        b.append_bytes(&[0x00, 0xaa, 0xbb, 0xcc]).unwrap();
        let mut cursor = 0;
        let a2 = Identity::unmarshal(b.as_bytes(), &mut cursor).unwrap();
        assert_eq!(cursor, id_len);
        assert_eq!(a2, a);
    }

    #[test]
    fn truncated_identity_rejected() {
        let a = Identity::generate();
        let b = a.to_bytes(false);
        for l in [0, 4, 6, 40, 74, b.len() - 1] {
            let mut cursor = 0;
            assert!(Identity::unmarshal(&b.as_bytes()[..l], &mut cursor).is_err(), "length {}", l);
        }
    }
}
