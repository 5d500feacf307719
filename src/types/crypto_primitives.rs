/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.
//!
//! The replication core itself never signs or verifies anything directly: it calls
//! [`Stack::sign`](crate::stack::Stack::sign) and [`Stack::verify`](crate::stack::Stack::verify).
//! [`Ed25519Authenticator`] is a ready-made implementation of those two methods that stack
//! implementations can delegate to.

use std::collections::HashMap;

use rand_core::OsRng;

use super::data_types::{CryptoHash, ReplicaID, SignatureBytes};
use crate::stack::StackError;

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// Compute the SHA256 hash of `bytes`.
pub fn hash(bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Generate a fresh `Keypair` using the operating system's random number generator.
    pub fn generate() -> Keypair {
        let mut csprg = OsRng {};
        Keypair(SigningKey::generate(&mut csprg))
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes().to_vec())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Signs with this replica's [`Keypair`] and verifies against the public keys of the replicas in the
/// cluster.
#[derive(Clone)]
pub struct Ed25519Authenticator {
    keypair: Keypair,
    replicas: HashMap<ReplicaID, VerifyingKey>,
}

impl Ed25519Authenticator {
    /// Create an `Ed25519Authenticator` that signs with `keypair`, and knows the public key of every
    /// replica in `replicas`.
    pub fn new(keypair: Keypair, replicas: HashMap<ReplicaID, VerifyingKey>) -> Self {
        Self { keypair, replicas }
    }

    /// Sign `payload` with this replica's keypair.
    pub fn sign(&self, payload: &[u8]) -> SignatureBytes {
        self.keypair.sign(payload)
    }

    /// Check that `signature` is a signature over `payload` created by `replica`.
    pub fn verify(
        &self,
        replica: ReplicaID,
        signature: &SignatureBytes,
        payload: &[u8],
    ) -> Result<(), StackError> {
        let verifying_key = self
            .replicas
            .get(&replica)
            .ok_or(StackError::UnknownReplica(replica))?;
        let signature_bytes: [u8; 64] = signature
            .bytes()
            .try_into()
            .map_err(|_| StackError::Authentication(String::from("malformed signature")))?;
        verifying_key
            .verify(payload, &Signature::from_bytes(&signature_bytes))
            .map_err(|err| StackError::Authentication(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticators(n: u64) -> Vec<Ed25519Authenticator> {
        let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
        let replicas: HashMap<ReplicaID, VerifyingKey> = keypairs
            .iter()
            .enumerate()
            .map(|(i, keypair)| (ReplicaID::new(i as u64), keypair.public()))
            .collect();
        keypairs
            .into_iter()
            .map(|keypair| Ed25519Authenticator::new(keypair, replicas.clone()))
            .collect()
    }

    #[test]
    fn signatures_verify_only_against_the_signer() {
        let auths = authenticators(2);
        let signature = auths[0].sign(b"prepare");

        assert!(auths[1]
            .verify(ReplicaID::new(0), &signature, b"prepare")
            .is_ok());
        assert!(auths[1]
            .verify(ReplicaID::new(1), &signature, b"prepare")
            .is_err());
        assert!(auths[1]
            .verify(ReplicaID::new(0), &signature, b"commit")
            .is_err());
        assert!(matches!(
            auths[1].verify(ReplicaID::new(7), &signature, b"prepare"),
            Err(StackError::UnknownReplica(_))
        ));
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"tx1"), hash(b"tx1"));
        assert_ne!(hash(b"tx1"), hash(b"tx2"));
    }
}
