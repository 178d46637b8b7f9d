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
use crate::encoding::{Encoding, Reader};
use crate::key::SignatureHash;
use crate::Error;
use cryptovec::CryptoVec;

/// The type of a signature, depending on the algorithm used.
#[derive(Debug, Clone)]
pub enum Signature {
    /// An RSA signature.
    RSA { hash: SignatureHash, bytes: Vec<u8> },
    /// A DSA signature: `r ‖ s`, 40 bytes.
    DSA { bytes: Vec<u8> },
}

impl Signature {
    /// Name under which this signature travels on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Signature::RSA { hash, .. } => hash.name().0,
            Signature::DSA { .. } => crate::key::SSH_DSS.0,
        }
    }

    /// Push the SSH wire form of this signature:
    /// `string(string name ‖ string bytes)`.
    pub fn push_to(&self, buffer: &mut CryptoVec) {
        let (name, bytes) = match self {
            Signature::RSA { hash, bytes } => (hash.name().0.as_bytes(), &bytes[..]),
            Signature::DSA { bytes } => (crate::key::SSH_DSS.0.as_bytes(), &bytes[..]),
        };
        buffer.push_u32_be((name.len() + bytes.len() + 8) as u32);
        buffer.extend_ssh_string(name);
        buffer.extend_ssh_string(bytes);
    }

    /// Parse a signature blob: `string name ‖ string bytes`.
    pub fn parse(sig: &[u8]) -> Result<Self, Error> {
        let mut r = sig.reader(0);
        let typ = r.read_string()?;
        let bytes = r.read_string()?;
        match typ {
            b"rsa-sha2-256" | b"rsa-sha2-512" | b"ssh-rsa" => Ok(Signature::RSA {
                hash: SignatureHash::from_rsa_name(typ).unwrap(),
                bytes: bytes.to_vec(),
            }),
            b"ssh-dss" => Ok(Signature::DSA {
                bytes: bytes.to_vec(),
            }),
            _ => Err(Error::UnknownSignatureType {
                sig_type: String::from_utf8_lossy(typ).into_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_wire_roundtrip() {
        let sig = Signature::RSA {
            hash: SignatureHash::SHA2_256,
            bytes: vec![1, 2, 3, 4],
        };
        let mut buf = CryptoVec::new();
        sig.push_to(&mut buf);
        let mut r = buf.reader(0);
        let blob = r.read_string().unwrap();
        match Signature::parse(blob).unwrap() {
            Signature::RSA { hash, bytes } => {
                assert_eq!(hash, SignatureHash::SHA2_256);
                assert_eq!(bytes, vec![1, 2, 3, 4]);
            }
            _ => panic!("wrong signature type"),
        }
    }
}
