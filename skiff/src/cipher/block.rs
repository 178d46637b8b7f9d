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

// AES in counter mode with a separate HMAC, the classic
// encrypt-and-MAC construction of RFC 4253.

use crate::mac::MacKey;
use crate::Error;
use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const NAME_AES128_CTR: super::Name = super::Name("aes128-ctr");
pub const NAME_AES192_CTR: super::Name = super::Name("aes192-ctr");
pub const NAME_AES256_CTR: super::Name = super::Name("aes256-ctr");

pub static CIPHER_AES128_CTR: super::Cipher = super::Cipher {
    name: NAME_AES128_CTR,
    key_len: 16,
    iv_len: 16,
    block_size: 16,
    make_opening_key: make_opening_128,
    make_sealing_key: make_sealing_128,
};

pub static CIPHER_AES192_CTR: super::Cipher = super::Cipher {
    name: NAME_AES192_CTR,
    key_len: 24,
    iv_len: 16,
    block_size: 16,
    make_opening_key: make_opening_192,
    make_sealing_key: make_sealing_192,
};

pub static CIPHER_AES256_CTR: super::Cipher = super::Cipher {
    name: NAME_AES256_CTR,
    key_len: 32,
    iv_len: 16,
    block_size: 16,
    make_opening_key: make_opening_256,
    make_sealing_key: make_sealing_256,
};

enum Ctr {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl Ctr {
    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Ctr::Aes128(c) => c.apply_keystream(data),
            Ctr::Aes192(c) => c.apply_keystream(data),
            Ctr::Aes256(c) => c.apply_keystream(data),
        }
    }
}

pub struct OpeningKey {
    ctr: Ctr,
    mac: MacKey,
}

pub struct SealingKey {
    ctr: Ctr,
    mac: MacKey,
}

fn make_opening_128(key: &[u8], iv: &[u8], mac: MacKey) -> super::OpeningCipher {
    super::OpeningCipher::Block(OpeningKey {
        ctr: Ctr::Aes128(Aes128Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

fn make_sealing_128(key: &[u8], iv: &[u8], mac: MacKey) -> super::SealingCipher {
    super::SealingCipher::Block(SealingKey {
        ctr: Ctr::Aes128(Aes128Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

fn make_opening_192(key: &[u8], iv: &[u8], mac: MacKey) -> super::OpeningCipher {
    super::OpeningCipher::Block(OpeningKey {
        ctr: Ctr::Aes192(Aes192Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

fn make_sealing_192(key: &[u8], iv: &[u8], mac: MacKey) -> super::SealingCipher {
    super::SealingCipher::Block(SealingKey {
        ctr: Ctr::Aes192(Aes192Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

fn make_opening_256(key: &[u8], iv: &[u8], mac: MacKey) -> super::OpeningCipher {
    super::OpeningCipher::Block(OpeningKey {
        ctr: Ctr::Aes256(Aes256Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

fn make_sealing_256(key: &[u8], iv: &[u8], mac: MacKey) -> super::SealingCipher {
    super::SealingCipher::Block(SealingKey {
        ctr: Ctr::Aes256(Aes256Ctr::new_from_slices(key, iv).unwrap()),
        mac,
    })
}

const BLOCK_SIZE: usize = 16;

impl super::OpeningKey for OpeningKey {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn decrypt(&mut self, ciphertext_in_plaintext_out: &mut [u8]) {
        self.ctr.apply(ciphertext_in_plaintext_out)
    }

    fn verify(&self, seqn: u32, plaintext: &[u8], tag: &[u8]) -> Result<(), Error> {
        if self.mac.verify(seqn, plaintext, tag) {
            Ok(())
        } else {
            Err(Error::PacketAuth)
        }
    }
}

impl super::SealingKey for SealingKey {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn tag_len(&self) -> usize {
        self.mac.mac_len()
    }

    fn padding_length(&self, payload: &[u8]) -> usize {
        let padding_len = BLOCK_SIZE - ((5 + payload.len()) % BLOCK_SIZE);
        if padding_len < 4 {
            padding_len + BLOCK_SIZE
        } else {
            padding_len
        }
    }

    // https://tools.ietf.org/html/rfc4253#section-6, padding must be
    // random.
    fn fill_padding(&self, padding_out: &mut [u8]) {
        rand::thread_rng().fill_bytes(padding_out)
    }

    fn compute_mac(&self, seqn: u32, plaintext: &[u8], tag_out: &mut [u8]) {
        self.mac.compute(seqn, plaintext, tag_out)
    }

    fn encrypt(&mut self, plaintext_in_ciphertext_out: &mut [u8]) {
        self.ctr.apply(plaintext_in_ciphertext_out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::SealingKey as _;
    use super::*;
    use crate::mac;

    #[test]
    fn padding_is_multiple_of_block() {
        let sealing = SealingKey {
            ctr: Ctr::Aes128(Aes128Ctr::new_from_slices(&[0; 16], &[0; 16]).unwrap()),
            mac: (mac::MAC_NONE.make_mac)(&[]),
        };
        for len in 0..200 {
            let payload = vec![0u8; len];
            let padding = sealing.padding_length(&payload);
            assert!(padding >= 4);
            assert!(padding <= 255);
            assert_eq!((5 + len + padding) % BLOCK_SIZE, 0);
        }
    }
}
