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

//! SSH identities for the `skiff` client library: parse public keys,
//! load and decipher private key files, sign authentication
//! challenges, and keep an ordered identity set for the `publickey`
//! method.

#![deny(trivial_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate thiserror;
#[macro_use]
extern crate log;

use data_encoding::BASE64_MIME;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub mod encoding;
mod identity;
pub mod key;
pub mod signature;

mod format;
pub use format::*;
pub use identity::{Identity, IdentitySet};

#[derive(Debug, Error)]
pub enum Error {
    /// The key could not be read, for an unknown reason.
    #[error("Could not read key")]
    CouldNotReadKey,
    /// The type of the key is unsupported.
    #[error("Unsupported key type")]
    UnsupportedKeyType(Vec<u8>),
    /// The key is encrypted (should supply a passphrase?)
    #[error("The key is encrypted")]
    KeyIsEncrypted,
    /// Index out of bounds while decoding.
    #[error("Index out of bounds")]
    IndexOutOfBounds,
    /// Unknown signature type.
    #[error("Unknown signature type: {}", sig_type)]
    UnknownSignatureType { sig_type: String },
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Openssl(#[from] openssl::error::ErrorStack),
    #[error("Base64 decoding error: {0}")]
    Decode(#[from] data_encoding::DecodeError),
}

/// Load a public key from a file. RSA and DSA keys are supported.
pub fn load_public_key<P: AsRef<Path>>(path: P) -> Result<key::PublicKey, Error> {
    let mut pubkey = String::new();
    let mut file = File::open(path.as_ref())?;
    file.read_to_string(&mut pubkey)?;

    let mut split = pubkey.split_whitespace();
    match (split.next(), split.next()) {
        (Some(_), Some(key)) => parse_public_key_base64(key),
        (Some(key), None) => parse_public_key_base64(key),
        _ => Err(Error::CouldNotReadKey),
    }
}

/// Reads a public key from the standard encoding. In some cases, the
/// encoding is prefixed with a key type identifier and a space (such
/// as `ssh-rsa AAAAB3N...`).
pub fn parse_public_key_base64(key: &str) -> Result<key::PublicKey, Error> {
    let base = BASE64_MIME.decode(key.as_bytes())?;
    key::parse_public_key(&base)
}

pub trait PublicKeyBase64 {
    /// Create the base64 part of the public key blob.
    fn public_key_bytes(&self) -> Vec<u8>;
    fn public_key_base64(&self) -> String {
        let mut s = BASE64_MIME.encode(&self.public_key_bytes());
        assert_eq!(s.pop(), Some('\n'));
        assert_eq!(s.pop(), Some('\r'));
        s
    }
}

impl PublicKeyBase64 for key::PublicKey {
    fn public_key_bytes(&self) -> Vec<u8> {
        use encoding::Encoding;
        let mut s = Vec::new();
        match *self {
            key::PublicKey::RSA { ref key, .. } => {
                let rsa = key.0.rsa().unwrap();
                let e = rsa.e().to_vec();
                let n = rsa.n().to_vec();
                s.extend_ssh_string(b"ssh-rsa");
                s.extend_ssh_mpint(&e);
                s.extend_ssh_mpint(&n);
            }
            key::PublicKey::DSA { ref key } => {
                let dsa = key.0.dsa().unwrap();
                s.extend_ssh_string(b"ssh-dss");
                s.extend_ssh_mpint(&dsa.p().to_vec());
                s.extend_ssh_mpint(&dsa.q().to_vec());
                s.extend_ssh_mpint(&dsa.g().to_vec());
                s.extend_ssh_mpint(&dsa.pub_key().to_vec());
            }
        }
        s
    }
}

impl PublicKeyBase64 for key::KeyPair {
    fn public_key_bytes(&self) -> Vec<u8> {
        use encoding::Encoding;
        let mut s = Vec::new();
        match *self {
            key::KeyPair::RSA { ref key, .. } => {
                let e = key.e().to_vec();
                let n = key.n().to_vec();
                s.extend_ssh_string(b"ssh-rsa");
                s.extend_ssh_mpint(&e);
                s.extend_ssh_mpint(&n);
            }
            key::KeyPair::DSA { ref key } => {
                s.extend_ssh_string(b"ssh-dss");
                s.extend_ssh_mpint(&key.p().to_vec());
                s.extend_ssh_mpint(&key.q().to_vec());
                s.extend_ssh_mpint(&key.g().to_vec());
                s.extend_ssh_mpint(&key.pub_key().to_vec());
            }
        }
        s
    }
}

/// Write a public key file line (`<algo> <base64>`).
pub fn write_public_key_base64<W: std::io::Write, K: PublicKeyBase64 + key::Named>(
    mut w: W,
    publickey: &K,
) -> Result<(), Error> {
    writeln!(w, "{} {}", publickey.name(), publickey.public_key_base64())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_base64_roundtrip() {
        let pair = key::KeyPair::generate_rsa(2048, key::SignatureHash::SHA2_256).unwrap();
        let public = pair.clone_public_key();
        let b64 = public.public_key_base64();
        let parsed = parse_public_key_base64(&b64).unwrap();
        assert_eq!(parsed.public_key_bytes(), public.public_key_bytes());
    }
}
