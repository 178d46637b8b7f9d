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
use crate::key::KeyPair;
use crate::{Error, PublicKeyBase64};
use std::path::Path;
use std::sync::Arc;

/// A named private key, as consulted by the `publickey`
/// authentication method.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Display name, usually the path the key was loaded from.
    pub name: String,
    pub key: Arc<KeyPair>,
}

impl Identity {
    /// Load an identity from a PEM file, deciphering it with
    /// `passphrase` if it is encrypted.
    pub fn from_file<P: AsRef<Path>>(path: P, passphrase: Option<&str>) -> Result<Self, Error> {
        let name = path.as_ref().display().to_string();
        let key = crate::load_secret_key(path, passphrase)?;
        Ok(Identity {
            name,
            key: Arc::new(key),
        })
    }

    /// Load an identity from PEM bytes.
    pub fn from_bytes(
        name: impl Into<String>,
        pem: &[u8],
        passphrase: Option<&str>,
    ) -> Result<Self, Error> {
        let key = crate::decode_secret_key(pem, passphrase)?;
        Ok(Identity {
            name: name.into(),
            key: Arc::new(key),
        })
    }

    /// Public key blob in SSH wire form.
    pub fn public_blob(&self) -> Vec<u8> {
        self.key.public_key_bytes()
    }
}

/// An ordered set of identities. The `publickey` method tries them
/// in insertion order.
#[derive(Debug, Default)]
pub struct IdentitySet {
    identities: Vec<Identity>,
}

impl IdentitySet {
    pub fn new() -> Self {
        IdentitySet {
            identities: Vec::new(),
        }
    }

    /// Add an identity at the end of the set. An identity with the
    /// same name replaces the previous one, keeping its position.
    pub fn add(&mut self, id: Identity) {
        if let Some(existing) = self.identities.iter_mut().find(|i| i.name == id.name) {
            *existing = id;
        } else {
            self.identities.push(id);
        }
    }

    /// Remove the identity with the given name.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.identities.len();
        self.identities.retain(|i| i.name != name);
        self.identities.len() != before
    }

    /// Drop all identities. Key material is freed (and zeroed by the
    /// backing library) once the last `Arc` clone goes away.
    pub fn clear(&mut self) {
        self.identities.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyPair, SignatureHash};

    fn ident(name: &str) -> Identity {
        Identity {
            name: name.to_string(),
            key: Arc::new(KeyPair::generate_rsa(2048, SignatureHash::SHA2_256).unwrap()),
        }
    }

    #[test]
    fn add_replaces_same_name() {
        let mut set = IdentitySet::new();
        set.add(ident("a"));
        set.add(ident("b"));
        set.add(ident("a"));
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next().unwrap().name, "a");
    }

    #[test]
    fn remove_and_clear() {
        let mut set = IdentitySet::new();
        set.add(ident("a"));
        set.add(ident("b"));
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        set.clear();
        assert!(set.is_empty());
    }
}
