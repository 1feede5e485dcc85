/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::collections::BTreeMap;

/// A packed key=value metadata dictionary.
///
/// Records are `key=value\n` with the bytes NUL, CR, LF, `=` and `\` escaped
/// by backslash in values. Keys are plain ASCII and may not contain `=` or
/// newline. Integer values are stored as hex strings. Iteration order is
/// deterministic so encodings are stable.
#[derive(Default, Clone)]
pub struct Dictionary(BTreeMap<String, Vec<u8>>);

impl Dictionary {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn set_bytes(&mut self, k: &str, v: Vec<u8>) {
        self.0.insert(k.to_string(), v);
    }

    pub fn set_str(&mut self, k: &str, v: &str) {
        self.0.insert(k.to_string(), v.as_bytes().to_vec());
    }

    pub fn set_u64(&mut self, k: &str, v: u64) {
        self.0.insert(k.to_string(), format!("{:x}", v).into_bytes());
    }

    pub fn get_bytes(&self, k: &str) -> Option<&[u8]> {
        self.0.get(k).map(|v| v.as_slice())
    }

    pub fn get_str(&self, k: &str) -> Option<&str> {
        self.get_bytes(k).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_u64(&self, k: &str) -> Option<u64> {
        self.get_str(k).and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * self.0.len());
        for (k, v) in self.0.iter() {
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            for b in v.iter() {
                match *b {
                    0 => out.extend_from_slice(b"\\0"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    b'=' => out.extend_from_slice(b"\\e"),
                    b => out.push(b),
                }
            }
            out.push(b'\n');
        }
        out
    }

    pub fn decode(b: &[u8]) -> Option<Dictionary> {
        let mut d = Dictionary::new();
        let mut key: Vec<u8> = Vec::new();
        let mut value: Vec<u8> = Vec::new();
        let mut in_value = false;
        let mut escape = false;
        for c in b.iter().copied() {
            if !in_value {
                match c {
                    b'=' => in_value = true,
                    b'\r' | b'\n' => {
                        if !key.is_empty() {
                            return None;
                        }
                    }
                    b'\\' | 0 => return None,
                    c => key.push(c),
                }
            } else if escape {
                escape = false;
                value.push(match c {
                    b'0' => 0,
                    b'r' => b'\r',
                    b'n' => b'\n',
                    b'\\' => b'\\',
                    b'e' => b'=',
                    _ => return None,
                });
            } else {
                match c {
                    b'\\' => escape = true,
                    b'\n' => {
                        let k = String::from_utf8(std::mem::take(&mut key)).ok()?;
                        d.0.insert(k, std::mem::take(&mut value));
                        in_value = false;
                    }
                    b'=' => return None,
                    c => value.push(c),
                }
            }
        }
        if in_value || escape || !key.is_empty() {
            return None;
        }
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_escapes() {
        let mut d = Dictionary::new();
        d.set_u64("I", 0xdeadbeef);
        d.set_u64("C", 12345);
        d.set_str("v", "2.0.0");
        d.set_bytes("raw", vec![0, b'=', b'\n', b'\\', b'\r', 7]);
        let enc = d.encode();
        let d2 = Dictionary::decode(&enc).unwrap();
        assert_eq!(d2.get_u64("I"), Some(0xdeadbeef));
        assert_eq!(d2.get_u64("C"), Some(12345));
        assert_eq!(d2.get_str("v"), Some("2.0.0"));
        assert_eq!(d2.get_bytes("raw"), Some(&[0, b'=', b'\n', b'\\', b'\r', 7][..]));
        assert_eq!(d2.encode(), enc);
    }

    #[test]
    fn empty_is_empty() {
        let d = Dictionary::new();
        assert!(d.is_empty());
        assert_eq!(d.encode(), b"");
        assert!(Dictionary::decode(b"").unwrap().is_empty());
    }

    #[test]
    fn malformed_rejected() {
        assert!(Dictionary::decode(b"novalue").is_none());
        assert!(Dictionary::decode(b"a=b\nc=").is_none());
        assert!(Dictionary::decode(b"a=b\\q\n").is_none());
        assert!(Dictionary::decode(b"a=b=c\n").is_none());
    }
}
