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
use crate::key::{KeyPair, SignatureHash};
use crate::Error;
use openssl::pkey::PKey;

/// Decode a PEM private key, deciphering it with the supplied
/// passphrase when it is encrypted (PKCS#5/PKCS#8). RSA and DSA keys
/// are supported.
pub fn decode_secret_key(pem: &[u8], passphrase: Option<&str>) -> Result<KeyPair, Error> {
    let pkey = match passphrase {
        Some(pass) => PKey::private_key_from_pem_passphrase(pem, pass.as_bytes()).map_err(|e| {
            debug!("private_key_from_pem_passphrase: {:?}", e);
            Error::CouldNotReadKey
        })?,
        None => PKey::private_key_from_pem_callback(pem, |_| {
            // An empty passphrase fails decryption instead of
            // blocking on a terminal prompt.
            Ok(0)
        })
        .map_err(|e| {
            debug!("private_key_from_pem: {:?}", e);
            if pem_is_encrypted(pem) {
                Error::KeyIsEncrypted
            } else {
                Error::CouldNotReadKey
            }
        })?,
    };
    if let Ok(rsa) = pkey.rsa() {
        return Ok(KeyPair::RSA {
            key: rsa,
            hash: SignatureHash::SHA2_256,
        });
    }
    if let Ok(dsa) = pkey.dsa() {
        return Ok(KeyPair::DSA { key: dsa });
    }
    Err(Error::CouldNotReadKey)
}

fn pem_is_encrypted(pem: &[u8]) -> bool {
    // PKCS#5 marks encryption in the PEM headers, PKCS#8 in the tag.
    let text = String::from_utf8_lossy(pem);
    text.contains("ENCRYPTED") || text.contains("Proc-Type: 4,ENCRYPTED")
}

/// Load a secret key from a file.
pub fn load_secret_key<P: AsRef<std::path::Path>>(
    path: P,
    passphrase: Option<&str>,
) -> Result<KeyPair, Error> {
    let pem = std::fs::read(path)?;
    decode_secret_key(&pem, passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_generated_rsa_pem() {
        let key = openssl::rsa::Rsa::generate(2048).unwrap();
        let pem = key.private_key_to_pem().unwrap();
        let pair = decode_secret_key(&pem, None).unwrap();
        match pair {
            KeyPair::RSA { .. } => {}
            _ => panic!("expected an RSA key"),
        }
    }

    #[test]
    fn decode_encrypted_rsa_pem() {
        let key = openssl::rsa::Rsa::generate(2048).unwrap();
        let pem = key
            .private_key_to_pem_passphrase(openssl::symm::Cipher::aes_128_cbc(), b"blabla")
            .unwrap();
        assert!(matches!(
            decode_secret_key(&pem, None),
            Err(Error::KeyIsEncrypted)
        ));
        let pair = decode_secret_key(&pem, Some("blabla")).unwrap();
        match pair {
            KeyPair::RSA { .. } => {}
            _ => panic!("expected an RSA key"),
        }
    }

    #[test]
    fn decode_dsa_pem() {
        let key = openssl::dsa::Dsa::generate(1024).unwrap();
        let pem = key.private_key_to_pem().unwrap();
        let pair = decode_secret_key(&pem, None).unwrap();
        match pair {
            KeyPair::DSA { .. } => {}
            _ => panic!("expected a DSA key"),
        }
    }
}
