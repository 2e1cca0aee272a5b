// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Node cryptographic identity.
//!
//! The peer address used by gossip routing and consensus membership is the
//! account identifier derived from the node Ed25519 public key.

use crate::{Error, ErrorKind, Result};
use ed25519_dalek::{Keypair as KeyPairImpl, PublicKey as PublicKeyImpl};
use rand::rngs::OsRng;
use std::path::Path;

/// Identity provider, queried once at startup to fix the local address.
pub trait Identity {
    fn who_am_i(&self) -> String;
}

pub struct KeyPair(KeyPairImpl);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    imp: PublicKeyImpl,
}

impl KeyPair {
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let internal = KeyPairImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(KeyPair(internal))
    }

    pub fn from_random() -> KeyPair {
        let mut csprng = OsRng {};
        let internal = KeyPairImpl::generate(&mut csprng);
        KeyPair(internal)
    }

    /// Loads the 64 bytes key pair (secret followed by public) from file.
    ///
    /// # Errors
    ///
    /// `ResourceNotFound` if the file cannot be read, `MalformedData` if its
    /// content is not a valid key pair.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<KeyPair> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|err| Error::new_ext(ErrorKind::ResourceNotFound, err))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { imp: self.0.public }
    }
}

impl Identity for KeyPair {
    fn who_am_i(&self) -> String {
        self.public_key().to_account_id()
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let internal = PublicKeyImpl::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        Ok(PublicKey { imp: internal })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.imp.to_bytes().to_vec()
    }

    /// Base58 of the protobuf-tagged public key, wrapped as an identity
    /// multihash.
    pub fn to_account_id(&self) -> String {
        let key = self.to_bytes();
        let mut buf = Vec::with_capacity(key.len() + 6);
        // Identity multihash tag and length.
        buf.push(0x00);
        buf.push((key.len() + 4) as u8);
        // Protobuf header: key type Ed25519, payload length.
        buf.extend_from_slice(&[0x08, 0x01, 0x12, key.len() as u8]);
        buf.extend_from_slice(&key);
        bs58::encode(buf).into_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ED25519_BYTES_HEX: &str = "5fe6fc0f9274651d278798a4d86d9395ffdf4eff7361876f72201a130befb2c9587b8d516e9605a6ee57a19e2734f1ab3bb8b45e6062801dff3e6408d8594063";

    pub fn ed25519_test_keypair() -> KeyPair {
        let bytes = hex::decode(ED25519_BYTES_HEX).unwrap();
        KeyPair::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn ed25519_to_account_id() {
        let keypair = ed25519_test_keypair();

        let account_id = keypair.who_am_i();

        assert_eq!(
            account_id,
            "12D3KooWFmmKJ7jXhTfoYDvKkPqe7s9pHH42iZdf2xRdM5ykma1p"
        );
    }

    #[test]
    fn ed25519_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&hex::decode(ED25519_BYTES_HEX).unwrap())
            .unwrap();

        let keypair = KeyPair::from_file(file.path()).unwrap();

        assert_eq!(keypair.public_key(), ed25519_test_keypair().public_key());
    }

    #[test]
    fn ed25519_missing_file() {
        let err = KeyPair::from_file("/this/key/does/not/exist").err().unwrap();

        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn ed25519_bad_key_material() {
        let err = KeyPair::from_bytes(&[1, 2, 3]).err().unwrap();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn random_identities_differ() {
        let a = KeyPair::from_random();
        let b = KeyPair::from_random();

        assert_ne!(a.who_am_i(), b.who_am_i());
        assert_eq!(PublicKey::from_bytes(&a.public_key().to_bytes()).unwrap(), a.public_key());
    }
}
