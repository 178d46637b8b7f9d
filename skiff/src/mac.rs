// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac as _};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(&'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub const NONE: Name = Name("none");
pub const HMAC_SHA1: Name = Name("hmac-sha1");
pub const HMAC_SHA2_256: Name = Name("hmac-sha2-256");
pub const HMAC_SHA2_512: Name = Name("hmac-sha2-512");

/// Descriptor of a MAC algorithm: the key material it needs and a
/// factory making a keyed instance.
pub struct MacAlgorithm {
    pub name: Name,
    pub key_len: usize,
    pub mac_len: usize,
    pub make_mac: fn(key: &[u8]) -> MacKey,
}

pub static MAC_NONE: MacAlgorithm = MacAlgorithm {
    name: NONE,
    key_len: 0,
    mac_len: 0,
    make_mac: make_none,
};

pub static MAC_HMAC_SHA1: MacAlgorithm = MacAlgorithm {
    name: HMAC_SHA1,
    key_len: 20,
    mac_len: 20,
    make_mac: make_sha1,
};

pub static MAC_HMAC_SHA2_256: MacAlgorithm = MacAlgorithm {
    name: HMAC_SHA2_256,
    key_len: 32,
    mac_len: 32,
    make_mac: make_sha256,
};

pub static MAC_HMAC_SHA2_512: MacAlgorithm = MacAlgorithm {
    name: HMAC_SHA2_512,
    key_len: 64,
    mac_len: 64,
    make_mac: make_sha512,
};

fn make_none(_: &[u8]) -> MacKey {
    MacKey::None
}
fn make_sha1(key: &[u8]) -> MacKey {
    MacKey::HmacSha1(Hmac::new_from_slice(key).unwrap())
}
fn make_sha256(key: &[u8]) -> MacKey {
    MacKey::HmacSha256(Hmac::new_from_slice(key).unwrap())
}
fn make_sha512(key: &[u8]) -> MacKey {
    MacKey::HmacSha512(Hmac::new_from_slice(key).unwrap())
}

/// A keyed MAC. The MAC input is always
/// `u32 sequence number ‖ cleartext packet`.
#[derive(Clone)]
pub enum MacKey {
    None,
    HmacSha1(Hmac<Sha1>),
    HmacSha256(Hmac<Sha256>),
    HmacSha512(Hmac<Sha512>),
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MacKey {{ (hidden) }}")
    }
}

macro_rules! with_seqn {
    ($mac:expr, $seqn:expr, $payload:expr) => {{
        let mut mac = $mac.clone();
        let mut seqn_bytes = [0; 4];
        BigEndian::write_u32(&mut seqn_bytes, $seqn);
        mac.update(&seqn_bytes);
        mac.update($payload);
        mac
    }};
}

impl MacKey {
    pub fn mac_len(&self) -> usize {
        match self {
            MacKey::None => 0,
            MacKey::HmacSha1(_) => 20,
            MacKey::HmacSha256(_) => 32,
            MacKey::HmacSha512(_) => 64,
        }
    }

    /// Compute the tag over `seqn ‖ payload` into `out`.
    pub fn compute(&self, seqn: u32, payload: &[u8], out: &mut [u8]) {
        match self {
            MacKey::None => {}
            MacKey::HmacSha1(mac) => {
                out.copy_from_slice(&with_seqn!(mac, seqn, payload).finalize().into_bytes())
            }
            MacKey::HmacSha256(mac) => {
                out.copy_from_slice(&with_seqn!(mac, seqn, payload).finalize().into_bytes())
            }
            MacKey::HmacSha512(mac) => {
                out.copy_from_slice(&with_seqn!(mac, seqn, payload).finalize().into_bytes())
            }
        }
    }

    /// Constant-time verification of a received tag.
    pub fn verify(&self, seqn: u32, payload: &[u8], tag: &[u8]) -> bool {
        match self {
            MacKey::None => tag.is_empty(),
            MacKey::HmacSha1(mac) => with_seqn!(mac, seqn, payload).verify_slice(tag).is_ok(),
            MacKey::HmacSha256(mac) => with_seqn!(mac, seqn, payload).verify_slice(tag).is_ok(),
            MacKey::HmacSha512(mac) => with_seqn!(mac, seqn, payload).verify_slice(tag).is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_covers_sequence_number() {
        let key = [7u8; 32];
        let mac = (MAC_HMAC_SHA2_256.make_mac)(&key);
        let mut tag = [0u8; 32];
        mac.compute(3, b"payload", &mut tag);
        assert!(mac.verify(3, b"payload", &tag));
        assert!(!mac.verify(4, b"payload", &tag));
        assert!(!mac.verify(3, b"payloae", &tag));
    }

    #[test]
    fn none_mac_is_empty() {
        let mac = (MAC_NONE.make_mac)(&[]);
        assert_eq!(mac.mac_len(), 0);
        assert!(mac.verify(0, b"x", &[]));
    }
}
