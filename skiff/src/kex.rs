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
use crate::cipher::{OpeningCipher, SealingCipher};
use crate::negotiation::Names;
use crate::session::Exchange;
use crate::{msg, Error};
use cryptovec::CryptoVec;
use digest::Digest;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::Sha256;
use skiff_keys::encoding::{Encoding, Reader};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(pub(crate) &'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub const DH_GROUP1_SHA1: Name = Name("diffie-hellman-group1-sha1");
pub const DH_GROUP14_SHA1: Name = Name("diffie-hellman-group14-sha1");
pub const DH_GEX_SHA1: Name = Name("diffie-hellman-group-exchange-sha1");
pub const DH_GEX_SHA256: Name = Name("diffie-hellman-group-exchange-sha256");

/// Group sizes requested during group exchange, RFC 4419.
pub const GEX_MINIMAL_SIZE: u32 = 1024;
pub const GEX_PREFERRED_SIZE: u32 = 2048;
pub const GEX_MAXIMAL_SIZE: u32 = 8192;

// The Oakley group 2 prime, RFC 2409 section 6.2.
const GROUP1_P: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

// The 2048-bit MODP group 14, RFC 3526 section 3.
const GROUP14_P: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

static GROUP1: Lazy<DhGroup> = Lazy::new(|| DhGroup {
    p: BigUint::parse_bytes(GROUP1_P, 16).unwrap(),
    g: BigUint::from(2u32),
});

static GROUP14: Lazy<DhGroup> = Lazy::new(|| DhGroup {
    p: BigUint::parse_bytes(GROUP14_P, 16).unwrap(),
    g: BigUint::from(2u32),
});

#[cfg(test)]
pub(crate) fn group14() -> &'static DhGroup {
    &GROUP14
}

#[derive(Clone)]
pub struct DhGroup {
    pub p: BigUint,
    pub g: BigUint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HashAlg {
    Sha1,
    Sha256,
}

/// Parameters sent in our `KEX_DH_GEX_REQUEST`, part of the exchange
/// hash.
#[derive(Clone, Copy, Debug)]
struct GexParams {
    min: u32,
    preferred: u32,
    max: u32,
}

/// One run of a Diffie-Hellman key exchange.
pub struct Algorithm {
    name: Name,
    hash: HashAlg,
    group: Option<DhGroup>,
    gex: Option<GexParams>,
    local_secret: Option<BigUint>,
    shared_secret: Option<BigUint>,
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Algorithm {{ name: {:?}, local_secret: [hidden], shared_secret: [hidden] }}",
            self.name,
        )
    }
}

pub(crate) fn is_group_exchange(name: Name) -> bool {
    name == DH_GEX_SHA1 || name == DH_GEX_SHA256
}

impl Algorithm {
    /// Start the client side of the exchange. For a fixed group this
    /// writes `KEXDH_INIT`; for group exchange it writes
    /// `KEX_DH_GEX_REQUEST` and the exponent is only chosen once the
    /// group arrives.
    pub fn client_dh(
        name: Name,
        client_ephemeral: &mut CryptoVec,
        buf: &mut CryptoVec,
    ) -> Result<Algorithm, Error> {
        let hash = match name {
            DH_GEX_SHA256 => HashAlg::Sha256,
            DH_GEX_SHA1 | DH_GROUP1_SHA1 | DH_GROUP14_SHA1 => HashAlg::Sha1,
            _ => return Err(Error::Kex),
        };
        let mut algorithm = Algorithm {
            name,
            hash,
            group: None,
            gex: None,
            local_secret: None,
            shared_secret: None,
        };
        if is_group_exchange(name) {
            let gex = GexParams {
                min: GEX_MINIMAL_SIZE,
                preferred: GEX_PREFERRED_SIZE,
                max: GEX_MAXIMAL_SIZE,
            };
            buf.push(msg::KEX_DH_GEX_REQUEST);
            buf.push_u32_be(gex.min);
            buf.push_u32_be(gex.preferred);
            buf.push_u32_be(gex.max);
            algorithm.gex = Some(gex);
        } else {
            let group = if name == DH_GROUP1_SHA1 {
                GROUP1.clone()
            } else {
                GROUP14.clone()
            };
            let e = algorithm.generate_exponent(&group);
            algorithm.group = Some(group);
            client_ephemeral.clear();
            client_ephemeral.extend(&e.to_bytes_be());
            buf.push(msg::KEXDH_INIT);
            buf.extend_ssh_mpint(client_ephemeral);
        }
        Ok(algorithm)
    }

    /// Handle `KEX_DH_GEX_GROUP`: adopt the server's group, choose
    /// the exponent and write `KEX_DH_GEX_INIT`.
    pub fn client_gex_group(
        &mut self,
        payload: &[u8],
        client_ephemeral: &mut CryptoVec,
        buf: &mut CryptoVec,
    ) -> Result<(), Error> {
        debug_assert!(self.gex.is_some());
        let mut r = payload.reader(1);
        let p = BigUint::from_bytes_be(r.read_mpint()?);
        let g = BigUint::from_bytes_be(r.read_mpint()?);
        let bits = p.bits() as u32;
        if bits < GEX_MINIMAL_SIZE || bits > GEX_MAXIMAL_SIZE {
            debug!("server sent a {}-bit group", bits);
            return Err(Error::Kex);
        }
        let group = DhGroup { p, g };
        let e = self.generate_exponent(&group);
        self.group = Some(group);
        client_ephemeral.clear();
        client_ephemeral.extend(&e.to_bytes_be());
        buf.push(msg::KEX_DH_GEX_INIT);
        buf.extend_ssh_mpint(client_ephemeral);
        Ok(())
    }

    fn generate_exponent(&mut self, group: &DhGroup) -> BigUint {
        let one = BigUint::from(1u32);
        let p_minus_one = &group.p - &one;
        let mut rng = rand::thread_rng();
        loop {
            let x = rng.gen_biguint(group.p.bits() - 2);
            if x <= one {
                continue;
            }
            let e = group.g.modpow(&x, &group.p);
            // 2 <= e <= p - 1, RFC 4253 section 8.
            if e > one && e < p_minus_one {
                self.local_secret = Some(x);
                return e;
            }
        }
    }

    /// K = f^x mod p.
    pub fn compute_shared_secret(&mut self, remote_ephemeral: &[u8]) -> Result<(), Error> {
        let group = self.group.as_ref().ok_or(Error::Kex)?;
        let x = self.local_secret.take().ok_or(Error::Kex)?;
        let f = BigUint::from_bytes_be(remote_ephemeral);
        let one = BigUint::from(1u32);
        if f <= one || f >= &group.p - &one {
            return Err(Error::Kex);
        }
        self.shared_secret = Some(f.modpow(&x, &group.p));
        Ok(())
    }

    fn digest(&self, data: &[u8], out: &mut CryptoVec) {
        match self.hash {
            HashAlg::Sha1 => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                out.extend(&hasher.finalize());
            }
            HashAlg::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                out.extend(&hasher.finalize());
            }
        }
    }

    /// The exchange hash H, RFC 4253 section 8 (and RFC 4419 section
    /// 3 for group exchange).
    pub fn compute_exchange_hash(
        &self,
        exchange: &Exchange,
        buffer: &mut CryptoVec,
    ) -> Result<CryptoVec, Error> {
        buffer.clear();
        buffer.extend_ssh_string(&exchange.client_id);
        buffer.extend_ssh_string(&exchange.server_id);
        buffer.extend_ssh_string(&exchange.client_kex_init);
        buffer.extend_ssh_string(&exchange.server_kex_init);
        buffer.extend_ssh_string(&exchange.server_host_key);

        if let Some(gex) = self.gex {
            let group = self.group.as_ref().ok_or(Error::Kex)?;
            buffer.push_u32_be(gex.min);
            buffer.push_u32_be(gex.preferred);
            buffer.push_u32_be(gex.max);
            buffer.extend_ssh_mpint(&group.p.to_bytes_be());
            buffer.extend_ssh_mpint(&group.g.to_bytes_be());
        }

        buffer.extend_ssh_mpint(&exchange.client_ephemeral);
        buffer.extend_ssh_mpint(&exchange.server_ephemeral);

        let shared = self.shared_secret.as_ref().ok_or(Error::Kex)?;
        buffer.extend_ssh_mpint(&shared.to_bytes_be());

        let mut hash = CryptoVec::new();
        self.digest(buffer, &mut hash);
        Ok(hash)
    }

    // One derived key, RFC 4253 section 7.2: hash(K ‖ H ‖ letter ‖
    // session_id), extended with hash(K ‖ H ‖ partial) until long
    // enough.
    fn derive_key(
        &self,
        letter: u8,
        len: usize,
        session_id: &[u8],
        exchange_hash: &[u8],
        buffer: &mut CryptoVec,
        key: &mut CryptoVec,
    ) -> Result<(), Error> {
        let shared = self.shared_secret.as_ref().ok_or(Error::Kex)?;
        let shared = shared.to_bytes_be();
        key.clear();
        buffer.clear();
        buffer.extend_ssh_mpint(&shared);
        buffer.extend(exchange_hash);
        buffer.push(letter);
        buffer.extend(session_id);
        self.digest(buffer, key);

        while key.len() < len {
            buffer.clear();
            buffer.extend_ssh_mpint(&shared);
            buffer.extend(exchange_hash);
            buffer.extend(key);
            let mut extension = CryptoVec::new();
            self.digest(buffer, &mut extension);
            key.extend(&extension);
        }
        key.resize(len);
        Ok(())
    }

    /// Derive the six session keys and build both directions of the
    /// pipeline. IVs are 'A'/'B', encryption keys 'C'/'D', MAC keys
    /// 'E'/'F', client-to-server first.
    pub fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        names: &Names,
    ) -> Result<(SealingCipher, OpeningCipher), Error> {
        let mut buffer = CryptoVec::new();
        let mut key = CryptoVec::new();
        let mut iv = CryptoVec::new();
        let mut mac_key = CryptoVec::new();

        let one_direction = |iv_letter: u8,
                                 key_letter: u8,
                                 mac_letter: u8,
                                 cipher: &'static crate::cipher::Cipher,
                                 mac: &'static crate::mac::MacAlgorithm,
                                 buffer: &mut CryptoVec,
                                 iv: &mut CryptoVec,
                                 key: &mut CryptoVec,
                                 mac_key: &mut CryptoVec|
         -> Result<(), Error> {
            self.derive_key(iv_letter, cipher.iv_len, session_id, exchange_hash, buffer, iv)?;
            self.derive_key(
                key_letter,
                cipher.key_len,
                session_id,
                exchange_hash,
                buffer,
                key,
            )?;
            self.derive_key(
                mac_letter,
                mac.key_len,
                session_id,
                exchange_hash,
                buffer,
                mac_key,
            )?;
            Ok(())
        };

        one_direction(
            b'A',
            b'C',
            b'E',
            names.cipher_c2s,
            names.mac_c2s,
            &mut buffer,
            &mut iv,
            &mut key,
            &mut mac_key,
        )?;
        let sealing = (names.cipher_c2s.make_sealing_key)(
            &key,
            &iv,
            (names.mac_c2s.make_mac)(&mac_key),
        );

        one_direction(
            b'B',
            b'D',
            b'F',
            names.cipher_s2c,
            names.mac_s2c,
            &mut buffer,
            &mut iv,
            &mut key,
            &mut mac_key,
        )?;
        let opening = (names.cipher_s2c.make_opening_key)(
            &key,
            &iv,
            (names.mac_s2c.make_mac)(&mac_key),
        );

        buffer.clear();
        Ok((sealing, opening))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_exchange() -> Exchange {
        let mut ex = Exchange::new();
        ex.client_id.extend(b"SSH-2.0-client");
        ex.server_id.extend(b"SSH-2.0-server");
        ex.client_kex_init.extend(b"ckex");
        ex.server_kex_init.extend(b"skex");
        ex.server_host_key.extend(b"hostkey");
        ex
    }

    #[test]
    fn group14_shared_secret_agreement() {
        // Run both ends of the exchange by hand and check they agree.
        let mut client_ephemeral = CryptoVec::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GROUP14_SHA1, &mut client_ephemeral, &mut buf).unwrap();
        assert_eq!(buf[0], msg::KEXDH_INIT);

        let group = GROUP14.clone();
        let mut rng = rand::thread_rng();
        let y = rng.gen_biguint(256);
        let f = group.g.modpow(&y, &group.p);
        let e = BigUint::from_bytes_be(&client_ephemeral);
        let server_k = e.modpow(&y, &group.p);

        client.compute_shared_secret(&f.to_bytes_be()).unwrap();
        assert_eq!(client.shared_secret.as_ref().unwrap(), &server_k);
    }

    #[test]
    fn rejects_degenerate_server_ephemeral() {
        let mut client_ephemeral = CryptoVec::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GROUP1_SHA1, &mut client_ephemeral, &mut buf).unwrap();
        assert!(client.compute_shared_secret(&[1]).is_err());
    }

    #[test]
    fn gex_request_then_group() {
        let mut client_ephemeral = CryptoVec::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GEX_SHA256, &mut client_ephemeral, &mut buf).unwrap();
        assert_eq!(buf[0], msg::KEX_DH_GEX_REQUEST);
        assert!(client_ephemeral.is_empty());

        // Server replies with group 14.
        let mut group_msg = CryptoVec::new();
        group_msg.push(msg::KEX_DH_GEX_GROUP);
        group_msg.extend_ssh_mpint(&GROUP14.p.to_bytes_be());
        group_msg.extend_ssh_mpint(&GROUP14.g.to_bytes_be());
        buf.clear();
        client
            .client_gex_group(&group_msg, &mut client_ephemeral, &mut buf)
            .unwrap();
        assert_eq!(buf[0], msg::KEX_DH_GEX_INIT);
        assert!(!client_ephemeral.is_empty());
    }

    #[test]
    fn gex_rejects_undersized_group() {
        let mut client_ephemeral = CryptoVec::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GEX_SHA1, &mut client_ephemeral, &mut buf).unwrap();
        let mut group_msg = CryptoVec::new();
        group_msg.push(msg::KEX_DH_GEX_GROUP);
        group_msg.extend_ssh_mpint(&BigUint::from(0x10001u32).to_bytes_be());
        group_msg.extend_ssh_mpint(&BigUint::from(2u32).to_bytes_be());
        buf.clear();
        assert!(client
            .client_gex_group(&group_msg, &mut client_ephemeral, &mut buf)
            .is_err());
    }

    #[test]
    fn derived_keys_have_requested_lengths() {
        let mut client_ephemeral = CryptoVec::new();
        let mut buf = CryptoVec::new();
        let mut client =
            Algorithm::client_dh(DH_GROUP14_SHA1, &mut client_ephemeral, &mut buf).unwrap();
        let group = GROUP14.clone();
        let mut rng = rand::thread_rng();
        let y = rng.gen_biguint(256);
        let f = group.g.modpow(&y, &group.p);
        client.compute_shared_secret(&f.to_bytes_be()).unwrap();

        let mut exchange = dummy_exchange();
        exchange.client_ephemeral.extend(&client_ephemeral);
        exchange.server_ephemeral.extend(&f.to_bytes_be());
        let mut buffer = CryptoVec::new();
        let hash = client.compute_exchange_hash(&exchange, &mut buffer).unwrap();
        // SHA-1 based exchange.
        assert_eq!(hash.len(), 20);

        // SHA-1 produces 20 bytes per round; a 64-byte MAC key needs
        // the extension loop.
        let mut key = CryptoVec::new();
        client
            .derive_key(b'E', 64, &hash, &hash, &mut buffer, &mut key)
            .unwrap();
        assert_eq!(key.len(), 64);
    }
}
