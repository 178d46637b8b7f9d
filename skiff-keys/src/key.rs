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
use crate::encoding::Reader;
pub use crate::signature::*;
use crate::Error;
use cryptovec::CryptoVec;
use openssl::pkey::{PKey, Private, Public};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// Name of a public key algorithm.
pub struct Name(pub &'static str);

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

/// The name of the ssh-rsa algorithm for SSH.
pub const SSH_RSA: Name = Name("ssh-rsa");
/// The name of the ssh-dss algorithm for SSH.
pub const SSH_DSS: Name = Name("ssh-dss");
/// The name of the rsa-sha2-512 algorithm for SSH.
pub const RSA_SHA2_512: Name = Name("rsa-sha2-512");
/// The name of the rsa-sha2-256 algorithm for SSH.
pub const RSA_SHA2_256: Name = Name("rsa-sha2-256");

impl Name {
    /// Base name of the private key file for a key name.
    pub fn identity_file(&self) -> &'static str {
        match *self {
            SSH_DSS => "id_dsa",
            _ => "id_rsa",
        }
    }
}

/// The hash function used for signing with an RSA key.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
#[allow(non_camel_case_types)]
pub enum SignatureHash {
    /// SHA2, 256 bits.
    SHA2_256,
    /// SHA2, 512 bits.
    SHA2_512,
    /// SHA1
    SHA1,
}

impl SignatureHash {
    pub fn name(&self) -> Name {
        match *self {
            SignatureHash::SHA2_256 => RSA_SHA2_256,
            SignatureHash::SHA2_512 => RSA_SHA2_512,
            SignatureHash::SHA1 => SSH_RSA,
        }
    }

    pub fn from_rsa_name(name: &[u8]) -> Option<Self> {
        match name {
            b"rsa-sha2-256" => Some(SignatureHash::SHA2_256),
            b"rsa-sha2-512" => Some(SignatureHash::SHA2_512),
            b"ssh-rsa" => Some(SignatureHash::SHA1),
            _ => None,
        }
    }

    fn to_message_digest(self) -> openssl::hash::MessageDigest {
        use openssl::hash::MessageDigest;
        match self {
            SignatureHash::SHA2_256 => MessageDigest::sha256(),
            SignatureHash::SHA2_512 => MessageDigest::sha512(),
            SignatureHash::SHA1 => MessageDigest::sha1(),
        }
    }
}

/// A public key from OpenSSL.
#[derive(Clone)]
pub struct OpenSSLPKey(pub PKey<Public>);

impl PartialEq for OpenSSLPKey {
    fn eq(&self, b: &OpenSSLPKey) -> bool {
        self.0.public_eq(&b.0)
    }
}
impl Eq for OpenSSLPKey {}
impl std::fmt::Debug for OpenSSLPKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "OpenSSLPKey {{ (hidden) }}")
    }
}

/// Public key
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum PublicKey {
    #[doc(hidden)]
    RSA {
        key: OpenSSLPKey,
        hash: SignatureHash,
    },
    #[doc(hidden)]
    DSA { key: OpenSSLPKey },
}

impl PublicKey {
    /// Parse a public key blob in SSH wire format. `algo` is the
    /// negotiated algorithm name, which for RSA keys selects the
    /// signature hash.
    pub fn parse(algo: &[u8], pubkey: &[u8]) -> Result<Self, Error> {
        match algo {
            b"ssh-rsa" | b"rsa-sha2-256" | b"rsa-sha2-512" => {
                let mut p = pubkey.reader(0);
                let key_algo = p.read_string()?;
                if key_algo != b"ssh-rsa" {
                    return Err(Error::CouldNotReadKey);
                }
                let key_e = p.read_string()?;
                let key_n = p.read_string()?;
                use openssl::bn::BigNum;
                use openssl::rsa::Rsa;
                Ok(PublicKey::RSA {
                    key: OpenSSLPKey(PKey::from_rsa(Rsa::from_public_components(
                        BigNum::from_slice(key_n)?,
                        BigNum::from_slice(key_e)?,
                    )?)?),
                    hash: SignatureHash::from_rsa_name(algo).unwrap_or(SignatureHash::SHA1),
                })
            }
            b"ssh-dss" => {
                let mut r = pubkey.reader(0);
                let key_algo = r.read_string()?;
                if key_algo != b"ssh-dss" {
                    return Err(Error::CouldNotReadKey);
                }
                use openssl::bn::BigNum;
                use openssl::dsa::Dsa;
                let p = BigNum::from_slice(r.read_mpint()?)?;
                let q = BigNum::from_slice(r.read_mpint()?)?;
                let g = BigNum::from_slice(r.read_mpint()?)?;
                let y = BigNum::from_slice(r.read_mpint()?)?;
                Ok(PublicKey::DSA {
                    key: OpenSSLPKey(PKey::from_dsa(Dsa::from_public_components(p, q, g, y)?)?),
                })
            }
            _ => Err(Error::UnsupportedKeyType(algo.to_vec())),
        }
    }

    /// Algorithm name for that key.
    pub fn name(&self) -> &'static str {
        match *self {
            PublicKey::RSA { ref hash, .. } => hash.name().0,
            PublicKey::DSA { .. } => SSH_DSS.0,
        }
    }

    /// Change the hash used by RSA signatures, following a
    /// `rsa-sha2-*` negotiation.
    pub fn set_algorithm(&mut self, algorithm: &[u8]) {
        if let PublicKey::RSA { ref mut hash, .. } = self {
            if let Some(h) = SignatureHash::from_rsa_name(algorithm) {
                *hash = h
            }
        }
    }

    /// Verify a signature blob over `buffer`.
    pub fn verify_detached(&self, buffer: &[u8], sig: &[u8]) -> bool {
        use openssl::sign::Verifier;
        match self {
            PublicKey::RSA { ref key, ref hash } => {
                let verify = || {
                    let mut verifier = Verifier::new(hash.to_message_digest(), &key.0)?;
                    verifier.update(buffer)?;
                    verifier.verify(sig)
                };
                verify().unwrap_or(false)
            }
            PublicKey::DSA { ref key } => {
                // SSH carries DSA signatures as two raw 160-bit
                // integers; openssl wants DER.
                let verify = || -> Result<bool, Error> {
                    let der = dsa_sig_to_der(sig)?;
                    let mut verifier =
                        Verifier::new(openssl::hash::MessageDigest::sha1(), &key.0)?;
                    verifier.update(buffer)?;
                    Ok(verifier.verify(&der)?)
                };
                verify().unwrap_or(false)
            }
        }
    }

    /// Compute the key fingerprint, hashed with sha2-256.
    pub fn fingerprint(&self) -> String {
        use crate::PublicKeyBase64;
        use sha2::{Digest, Sha256};
        let key = self.public_key_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&key[..]);
        data_encoding::BASE64_NOPAD.encode(&hasher.finalize())
    }
}

/// Named algorithms.
pub trait Named {
    /// The name of this algorithm.
    fn name(&self) -> &'static str;
}

impl Named for PublicKey {
    fn name(&self) -> &'static str {
        PublicKey::name(self)
    }
}

impl Named for KeyPair {
    fn name(&self) -> &'static str {
        KeyPair::name(self)
    }
}

#[doc(hidden)]
pub trait Verify {
    fn verify_client_auth(&self, buffer: &[u8], sig: &[u8]) -> bool;
    fn verify_server_auth(&self, buffer: &[u8], sig: &[u8]) -> bool;
}

impl Verify for PublicKey {
    fn verify_client_auth(&self, buffer: &[u8], sig: &[u8]) -> bool {
        self.verify_detached(buffer, sig)
    }
    fn verify_server_auth(&self, buffer: &[u8], sig: &[u8]) -> bool {
        self.verify_detached(buffer, sig)
    }
}

/// A secret key usable for authentication.
pub enum KeyPair {
    RSA {
        key: openssl::rsa::Rsa<Private>,
        hash: SignatureHash,
    },
    DSA {
        key: openssl::dsa::Dsa<Private>,
    },
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            KeyPair::RSA { .. } => write!(f, "RSA {{ (hidden) }}"),
            KeyPair::DSA { .. } => write!(f, "DSA {{ (hidden) }}"),
        }
    }
}

impl<'b> crate::encoding::Bytes for &'b KeyPair {
    fn bytes(&self) -> &[u8] {
        self.name().as_bytes()
    }
}

impl KeyPair {
    /// Copy the public key of this key pair.
    pub fn clone_public_key(&self) -> PublicKey {
        match self {
            KeyPair::RSA { ref key, ref hash } => {
                use openssl::rsa::Rsa;
                let key = Rsa::from_public_components(
                    key.n().to_owned().unwrap(),
                    key.e().to_owned().unwrap(),
                )
                .unwrap();
                PublicKey::RSA {
                    key: OpenSSLPKey(PKey::from_rsa(key).unwrap()),
                    hash: *hash,
                }
            }
            KeyPair::DSA { ref key } => {
                use openssl::dsa::Dsa;
                let key = Dsa::from_public_components(
                    key.p().to_owned().unwrap(),
                    key.q().to_owned().unwrap(),
                    key.g().to_owned().unwrap(),
                    key.pub_key().to_owned().unwrap(),
                )
                .unwrap();
                PublicKey::DSA {
                    key: OpenSSLPKey(PKey::from_dsa(key).unwrap()),
                }
            }
        }
    }

    /// Name of this key algorithm.
    pub fn name(&self) -> &'static str {
        match *self {
            KeyPair::RSA { ref hash, .. } => hash.name().0,
            KeyPair::DSA { .. } => SSH_DSS.0,
        }
    }

    pub fn generate_rsa(bits: usize, hash: SignatureHash) -> Option<Self> {
        let key = openssl::rsa::Rsa::generate(bits as u32).ok()?;
        Some(KeyPair::RSA { key, hash })
    }

    pub fn generate_dsa() -> Option<Self> {
        let key = openssl::dsa::Dsa::generate(1024).ok()?;
        Some(KeyPair::DSA { key })
    }

    /// Sign a slice using this algorithm.
    pub fn sign_detached(&self, to_sign: &[u8]) -> Result<Signature, Error> {
        match self {
            KeyPair::RSA { ref key, ref hash } => Ok(Signature::RSA {
                bytes: rsa_signature(hash, key, to_sign)?,
                hash: *hash,
            }),
            KeyPair::DSA { ref key } => Ok(Signature::DSA {
                bytes: dsa_signature(key, to_sign)?,
            }),
        }
    }

    /// Sign the content of `buffer` and push the signature blob onto
    /// it, as the `publickey` authentication method requires.
    pub fn add_self_signature(&self, buffer: &mut CryptoVec) -> Result<(), Error> {
        let signature = self.sign_detached(buffer)?;
        signature.push_to(buffer);
        Ok(())
    }
}

fn rsa_signature(
    hash: &SignatureHash,
    key: &openssl::rsa::Rsa<Private>,
    b: &[u8],
) -> Result<Vec<u8>, Error> {
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;
    let pkey = PKey::from_rsa(Rsa::from_private_components(
        key.n().to_owned()?,
        key.e().to_owned()?,
        key.d().to_owned()?,
        key.p().unwrap().to_owned()?,
        key.q().unwrap().to_owned()?,
        key.dmp1().unwrap().to_owned()?,
        key.dmq1().unwrap().to_owned()?,
        key.iqmp().unwrap().to_owned()?,
    )?)?;
    let mut signer = Signer::new(hash.to_message_digest(), &pkey)?;
    signer.update(b)?;
    Ok(signer.sign_to_vec()?)
}

fn dsa_signature(key: &openssl::dsa::Dsa<Private>, b: &[u8]) -> Result<Vec<u8>, Error> {
    use openssl::dsa::Dsa;
    use openssl::sign::Signer;
    let key = Dsa::from_private_components(
        key.p().to_owned()?,
        key.q().to_owned()?,
        key.g().to_owned()?,
        key.priv_key().to_owned()?,
        key.pub_key().to_owned()?,
    )?;
    let pkey = PKey::from_dsa(key)?;
    let mut signer = Signer::new(openssl::hash::MessageDigest::sha1(), &pkey)?;
    signer.update(b)?;
    let der = signer.sign_to_vec()?;
    der_sig_to_dsa(&der)
}

// The SSH wire form of an ssh-dss signature is r ‖ s, each padded to
// 20 bytes. openssl produces and consumes DER SEQUENCE { r, s }.
fn dsa_sig_to_der(sig: &[u8]) -> Result<Vec<u8>, Error> {
    if sig.len() != 40 {
        return Err(Error::CouldNotReadKey);
    }
    use openssl::bn::BigNum;
    let r = BigNum::from_slice(&sig[..20])?;
    let s = BigNum::from_slice(&sig[20..])?;
    let sig = openssl::dsa::DsaSig::from_private_components(r, s)?;
    Ok(sig.to_der()?)
}

fn der_sig_to_dsa(der: &[u8]) -> Result<Vec<u8>, Error> {
    let sig = openssl::dsa::DsaSig::from_der(der)?;
    let r = sig.r().to_vec();
    let s = sig.s().to_vec();
    if r.len() > 20 || s.len() > 20 {
        return Err(Error::CouldNotReadKey);
    }
    let mut out = vec![0; 40];
    out[20 - r.len()..20].copy_from_slice(&r);
    out[40 - s.len()..].copy_from_slice(&s);
    Ok(out)
}

/// Parse a public key blob, where the algorithm name is the leading
/// string of the blob itself.
pub fn parse_public_key(p: &[u8]) -> Result<PublicKey, Error> {
    let mut pos = p.reader(0);
    let t = pos.read_string()?;
    PublicKey::parse(t, p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PublicKeyBase64;

    #[test]
    fn rsa_public_blob_roundtrip() {
        let pair = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256).unwrap();
        let public = pair.clone_public_key();
        let blob = public.public_key_bytes();
        let parsed = parse_public_key(&blob).unwrap();
        assert_eq!(parsed.public_key_bytes(), blob);
    }

    #[test]
    fn rsa_sign_verify() {
        let pair = KeyPair::generate_rsa(2048, SignatureHash::SHA2_256).unwrap();
        let public = pair.clone_public_key();
        let sig = pair.sign_detached(b"the quick brown fox").unwrap();
        match sig {
            Signature::RSA { ref bytes, .. } => {
                assert!(public.verify_detached(b"the quick brown fox", bytes));
                assert!(!public.verify_detached(b"the quick brown fix", bytes));
            }
            _ => panic!("rsa key produced a non-rsa signature"),
        }
    }

    #[test]
    fn dsa_sign_verify() {
        let pair = KeyPair::generate_dsa().unwrap();
        let public = pair.clone_public_key();
        let sig = pair.sign_detached(b"payload").unwrap();
        match sig {
            Signature::DSA { ref bytes } => {
                assert_eq!(bytes.len(), 40);
                assert!(public.verify_detached(b"payload", bytes));
            }
            _ => panic!("dsa key produced a non-dsa signature"),
        }
    }
}
