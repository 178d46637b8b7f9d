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
use crate::cipher::{self, Cipher};
use crate::compression::Compression;
use crate::mac::{self, MacAlgorithm};
use crate::{kex, msg, Error};
use cryptovec::CryptoVec;
use once_cell::sync::Lazy;
use rand::RngCore;
use skiff_keys::encoding::{Encoding, Reader};
use skiff_keys::key;
use std::borrow::Cow;
use std::collections::HashMap;
use std::str::from_utf8;

/// One slot of the KEXINIT proposal. Carried in
/// [`Error::NoCommonAlgorithm`] when an intersection is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    KeyExchange,
    HostKey,
    CipherClientToServer,
    CipherServerToClient,
    MacClientToServer,
    MacServerToClient,
    CompressionClientToServer,
    CompressionServerToClient,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Slot::KeyExchange => "kex_algorithms",
            Slot::HostKey => "server_host_key",
            Slot::CipherClientToServer => "cipher_c2s",
            Slot::CipherServerToClient => "cipher_s2c",
            Slot::MacClientToServer => "mac_c2s",
            Slot::MacServerToClient => "mac_s2c",
            Slot::CompressionClientToServer => "compression_c2s",
            Slot::CompressionServerToClient => "compression_s2c",
        };
        f.write_str(name)
    }
}

/// The outcome of a KEXINIT negotiation: one algorithm per slot,
/// already resolved against the registry.
pub struct Names {
    pub kex: kex::Name,
    pub key: key::Name,
    pub cipher_c2s: &'static Cipher,
    pub cipher_s2c: &'static Cipher,
    pub mac_c2s: &'static MacAlgorithm,
    pub mac_s2c: &'static MacAlgorithm,
    pub client_compression: Compression,
    pub server_compression: Compression,
    pub ignore_guessed: bool,
}

impl std::fmt::Debug for Names {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Names")
            .field("kex", &self.kex.as_ref())
            .field("key", &self.key.0)
            .field("cipher_c2s", &self.cipher_c2s.name.as_ref())
            .field("cipher_s2c", &self.cipher_s2c.name.as_ref())
            .field("mac_c2s", &self.mac_c2s.name.as_ref())
            .field("mac_s2c", &self.mac_s2c.name.as_ref())
            .field("client_compression", &self.client_compression)
            .field("server_compression", &self.server_compression)
            .field("ignore_guessed", &self.ignore_guessed)
            .finish()
    }
}

/// The registry mapping algorithm names to their factories. The core
/// only ever refers to algorithms by name; a different provider may
/// register a different set.
pub struct Registry {
    ciphers: HashMap<&'static str, &'static Cipher>,
    macs: HashMap<&'static str, &'static MacAlgorithm>,
}

impl Registry {
    pub fn builtin() -> Registry {
        let mut ciphers: HashMap<&'static str, &'static Cipher> = HashMap::new();
        for c in [
            &cipher::block::CIPHER_AES128_CTR,
            &cipher::block::CIPHER_AES192_CTR,
            &cipher::block::CIPHER_AES256_CTR,
        ] {
            ciphers.insert(c.name.as_ref(), c);
        }
        let mut macs: HashMap<&'static str, &'static MacAlgorithm> = HashMap::new();
        for m in [
            &mac::MAC_HMAC_SHA2_256,
            &mac::MAC_HMAC_SHA2_512,
            &mac::MAC_HMAC_SHA1,
        ] {
            macs.insert(m.name.as_ref(), m);
        }
        Registry { ciphers, macs }
    }

    pub fn register_cipher(&mut self, c: &'static Cipher) {
        self.ciphers.insert(c.name.as_ref(), c);
    }

    pub fn register_mac(&mut self, m: &'static MacAlgorithm) {
        self.macs.insert(m.name.as_ref(), m);
    }

    pub fn cipher(&self, name: &str) -> Option<&'static Cipher> {
        self.ciphers.get(name).copied()
    }

    pub fn mac(&self, name: &str) -> Option<&'static MacAlgorithm> {
        self.macs.get(name).copied()
    }
}

static BUILTIN: Lazy<Registry> = Lazy::new(Registry::builtin);

/// The default security provider. The empty provider name maps here.
pub fn builtin_registry() -> &'static Registry {
    &BUILTIN
}

/// Lists of preferred algorithms, one per KEXINIT slot.
#[derive(Debug, Clone)]
pub struct Preferred {
    pub kex: Cow<'static, [&'static str]>,
    pub key: Cow<'static, [&'static str]>,
    pub cipher_c2s: Cow<'static, [&'static str]>,
    pub cipher_s2c: Cow<'static, [&'static str]>,
    pub mac_c2s: Cow<'static, [&'static str]>,
    pub mac_s2c: Cow<'static, [&'static str]>,
    pub compression_c2s: Cow<'static, [&'static str]>,
    pub compression_s2c: Cow<'static, [&'static str]>,
    pub languages_c2s: Cow<'static, [&'static str]>,
    pub languages_s2c: Cow<'static, [&'static str]>,
}

const DEFAULT_KEX: &[&str] = &[
    kex::DH_GEX_SHA256.0,
    kex::DH_GEX_SHA1.0,
    kex::DH_GROUP14_SHA1.0,
    kex::DH_GROUP1_SHA1.0,
];

const DEFAULT_KEY: &[&str] = &[
    key::RSA_SHA2_512.0,
    key::RSA_SHA2_256.0,
    key::SSH_RSA.0,
    key::SSH_DSS.0,
];

const DEFAULT_CIPHER: &[&str] = &["aes128-ctr", "aes192-ctr", "aes256-ctr"];

const DEFAULT_MAC: &[&str] = &["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"];

const DEFAULT_COMPRESSION: &[&str] = &["none", "zlib@openssh.com", "zlib"];

const PREFER_COMPRESSION: &[&str] = &["zlib@openssh.com", "zlib", "none"];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        kex: Cow::Borrowed(DEFAULT_KEX),
        key: Cow::Borrowed(DEFAULT_KEY),
        cipher_c2s: Cow::Borrowed(DEFAULT_CIPHER),
        cipher_s2c: Cow::Borrowed(DEFAULT_CIPHER),
        mac_c2s: Cow::Borrowed(DEFAULT_MAC),
        mac_s2c: Cow::Borrowed(DEFAULT_MAC),
        compression_c2s: Cow::Borrowed(DEFAULT_COMPRESSION),
        compression_s2c: Cow::Borrowed(DEFAULT_COMPRESSION),
        languages_c2s: Cow::Borrowed(&[]),
        languages_s2c: Cow::Borrowed(&[]),
    };

    pub const COMPRESSED: Preferred = Preferred {
        kex: Cow::Borrowed(DEFAULT_KEX),
        key: Cow::Borrowed(DEFAULT_KEY),
        cipher_c2s: Cow::Borrowed(DEFAULT_CIPHER),
        cipher_s2c: Cow::Borrowed(DEFAULT_CIPHER),
        mac_c2s: Cow::Borrowed(DEFAULT_MAC),
        mac_s2c: Cow::Borrowed(DEFAULT_MAC),
        compression_c2s: Cow::Borrowed(PREFER_COMPRESSION),
        compression_s2c: Cow::Borrowed(PREFER_COMPRESSION),
        languages_c2s: Cow::Borrowed(&[]),
        languages_s2c: Cow::Borrowed(&[]),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

/// Named algorithms.
pub trait Named {
    /// The name of this algorithm.
    fn name(&self) -> &'static str;
}

impl Named for () {
    fn name(&self) -> &'static str {
        ""
    }
}

/// Pick the first client name that the server also lists. The boolean
/// says whether both sides named it first, which decides whether a
/// guessed first kex packet was right.
fn select(client_list: &[&'static str], server_list: &[u8]) -> Option<(bool, &'static str)> {
    let mut both_first_choice = true;
    for &c in client_list {
        for s in server_list.split(|&x| x == b',') {
            if s == c.as_bytes() {
                return Some((both_first_choice, c));
            }
            both_first_choice = false
        }
    }
    None
}

/// Parse a server KEXINIT payload against our preferences.
pub fn read_kex(buffer: &[u8], pref: &Preferred, registry: &Registry) -> Result<Names, Error> {
    // Skip the message byte and the 16-byte cookie.
    let mut r = buffer.reader(17);

    let kex_string = r.read_string()?;
    let (kex_both_first, kex_algorithm) = select(&pref.kex, kex_string).ok_or_else(|| {
        debug!(
            "no common kex algorithm, server supports {:?}",
            from_utf8(kex_string)
        );
        Error::NoCommonAlgorithm(Slot::KeyExchange)
    })?;

    let key_string = r.read_string()?;
    let (key_both_first, key_algorithm) = select(&pref.key, key_string).ok_or_else(|| {
        debug!(
            "no common host key algorithm, server supports {:?}",
            from_utf8(key_string)
        );
        Error::NoCommonAlgorithm(Slot::HostKey)
    })?;

    let cipher_c2s = select(&pref.cipher_c2s, r.read_string()?)
        .and_then(|(_, name)| registry.cipher(name))
        .ok_or(Error::NoCommonAlgorithm(Slot::CipherClientToServer))?;
    let cipher_s2c = select(&pref.cipher_s2c, r.read_string()?)
        .and_then(|(_, name)| registry.cipher(name))
        .ok_or(Error::NoCommonAlgorithm(Slot::CipherServerToClient))?;

    let mac_c2s = select(&pref.mac_c2s, r.read_string()?)
        .and_then(|(_, name)| registry.mac(name))
        .ok_or(Error::NoCommonAlgorithm(Slot::MacClientToServer))?;
    let mac_s2c = select(&pref.mac_s2c, r.read_string()?)
        .and_then(|(_, name)| registry.mac(name))
        .ok_or(Error::NoCommonAlgorithm(Slot::MacServerToClient))?;

    let client_compression = select(&pref.compression_c2s, r.read_string()?)
        .map(|(_, c)| Compression::from_string(c))
        .ok_or(Error::NoCommonAlgorithm(Slot::CompressionClientToServer))?;
    let server_compression = select(&pref.compression_s2c, r.read_string()?)
        .map(|(_, c)| Compression::from_string(c))
        .ok_or(Error::NoCommonAlgorithm(Slot::CompressionServerToClient))?;

    r.read_string()?; // languages client-to-server
    r.read_string()?; // languages server-to-client

    let follows = r.read_bool()?;
    Ok(Names {
        kex: kex::Name(kex_algorithm),
        key: key::Name(key_algorithm),
        cipher_c2s,
        cipher_s2c,
        mac_c2s,
        mac_s2c,
        client_compression,
        server_compression,
        // Ignore the next packet if (1) it follows and (2) it's not the correct guess.
        ignore_guessed: follows && !(kex_both_first && key_both_first),
    })
}

/// Serialize our KEXINIT proposal.
pub fn write_kex(prefs: &Preferred, buf: &mut CryptoVec) -> Result<(), Error> {
    buf.push(msg::KEXINIT);

    let mut cookie = [0; 16];
    rand::thread_rng().fill_bytes(&mut cookie);
    buf.extend(&cookie);

    buf.extend_list(prefs.kex.iter());
    buf.extend_list(prefs.key.iter());

    buf.extend_list(prefs.cipher_c2s.iter());
    buf.extend_list(prefs.cipher_s2c.iter());

    buf.extend_list(prefs.mac_c2s.iter());
    buf.extend_list(prefs.mac_s2c.iter());

    buf.extend_list(prefs.compression_c2s.iter());
    buf.extend_list(prefs.compression_s2c.iter());

    buf.extend_list(prefs.languages_c2s.iter());
    buf.extend_list(prefs.languages_s2c.iter());

    buf.push(0); // first_kex_packet_follows is always false
    buf.extend(&[0, 0, 0, 0]); // reserved
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_kexinit(
        kex: &str,
        key: &str,
        cipher: &str,
        mac: &str,
        compression: &str,
    ) -> CryptoVec {
        let mut buf = CryptoVec::new();
        buf.push(msg::KEXINIT);
        buf.extend(&[0; 16]);
        buf.extend_ssh_string(kex.as_bytes());
        buf.extend_ssh_string(key.as_bytes());
        buf.extend_ssh_string(cipher.as_bytes());
        buf.extend_ssh_string(cipher.as_bytes());
        buf.extend_ssh_string(mac.as_bytes());
        buf.extend_ssh_string(mac.as_bytes());
        buf.extend_ssh_string(compression.as_bytes());
        buf.extend_ssh_string(compression.as_bytes());
        buf.write_empty_list();
        buf.write_empty_list();
        buf.push(0);
        buf.extend(&[0, 0, 0, 0]);
        buf
    }

    #[test]
    fn picks_first_client_name_in_server_list() {
        let server = server_kexinit(
            "diffie-hellman-group1-sha1,diffie-hellman-group-exchange-sha256",
            "ssh-rsa",
            "aes256-ctr,aes128-ctr",
            "hmac-sha1,hmac-sha2-256",
            "none",
        );
        let names = read_kex(&server, &Preferred::DEFAULT, builtin_registry()).unwrap();
        // Client preference order wins.
        assert_eq!(names.kex, kex::DH_GEX_SHA256);
        assert_eq!(names.cipher_c2s.name.as_ref(), "aes128-ctr");
        assert_eq!(names.mac_c2s.name.as_ref(), "hmac-sha2-256");
        assert!(!names.ignore_guessed);
    }

    #[test]
    fn no_common_cipher_names_the_slot() {
        let server = server_kexinit(
            "diffie-hellman-group14-sha1",
            "ssh-rsa",
            "3des-cbc",
            "hmac-sha1",
            "none",
        );
        match read_kex(&server, &Preferred::DEFAULT, builtin_registry()) {
            Err(Error::NoCommonAlgorithm(Slot::CipherClientToServer)) => {}
            r => panic!("expected a cipher mismatch, got {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn proposal_roundtrips_through_read_kex() {
        let mut buf = CryptoVec::new();
        write_kex(&Preferred::DEFAULT, &mut buf).unwrap();
        let names = read_kex(&buf, &Preferred::DEFAULT, builtin_registry()).unwrap();
        assert_eq!(names.kex, kex::DH_GEX_SHA256);
        assert_eq!(names.key.0, key::RSA_SHA2_512.0);
        assert_eq!(names.client_compression, Compression::None);
    }
}
