/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Confidentiality modes for request payloads.
//!
//! A cluster either orders payloads in the clear ([`Confidentiality::Plain`]), or orders payloads that
//! clients have sealed with a key derived from a chain-wide secret ([`Confidentiality::Encrypted`]). The
//! mode is selected in the replica's [configuration](crate::replica::Configuration).
//!
//! Every replica [opens](Confidentiality::open) a request when it first learns about it. The opened
//! payload is what the [`Stack`](crate::stack::Stack) validates and executes. The payload that is
//! ordered, and from which the request digest is computed, is always the payload as submitted.
//!
//! ## Key derivation
//!
//! A sealed payload carries a client-chosen nonce. Keys are derived from the chain key and the nonce
//! with HMAC-SHA256:
//!
//! ```text
//! root        = HMAC(chain_key, nonce)
//! payload_key = HMAC(root, [1])
//! iv          = HMAC(root, [4])[..12]
//! ```
//!
//! The ciphertext is the AES-256-GCM encryption of the payload under `payload_key` and `iv`.

use std::fmt::{self, Debug, Display, Formatter};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use borsh::{BorshDeserialize, BorshSerialize};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::types::signed_messages::encode;

type HmacSha256 = Hmac<Sha256>;

const PAYLOAD_KEY_LABEL: u8 = 1;
const IV_LABEL: u8 = 4;
const IV_LEN: usize = 12;
const FRESH_NONCE_LEN: usize = 24;

/// How request payloads are protected while they are being ordered.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Confidentiality {
    /// Payloads are ordered and executed as submitted.
    #[default]
    Plain,

    /// Payloads are [`SealedPayload`]s, and are decrypted with keys derived from `chain_key` before
    /// being validated and executed.
    Encrypted { chain_key: [u8; 32] },
}

impl Confidentiality {
    /// Get the payload that should be validated and executed for the submitted `payload`.
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, ConfidentialityError> {
        match self {
            Confidentiality::Plain => Ok(payload.to_vec()),
            Confidentiality::Encrypted { chain_key } => {
                let sealed = SealedPayload::try_from_slice(payload)
                    .map_err(|err| ConfidentialityError::Malformed(err.to_string()))?;
                if sealed.nonce.is_empty() {
                    return Err(ConfidentialityError::EmptyNonce);
                }
                let (cipher, iv) = derive_cipher(chain_key, &sealed.nonce)?;
                cipher
                    .decrypt(Nonce::from_slice(&iv), sealed.ciphertext.as_ref())
                    .map_err(|_| ConfidentialityError::Decryption)
            }
        }
    }

    /// Produce the payload that a client should submit for `payload`, sealing it under `nonce` in the
    /// `Encrypted` mode.
    pub fn seal(&self, payload: &[u8], nonce: &[u8]) -> Result<Vec<u8>, ConfidentialityError> {
        match self {
            Confidentiality::Plain => Ok(payload.to_vec()),
            Confidentiality::Encrypted { chain_key } => {
                if nonce.is_empty() {
                    return Err(ConfidentialityError::EmptyNonce);
                }
                let (cipher, iv) = derive_cipher(chain_key, nonce)?;
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&iv), payload)
                    .map_err(|_| ConfidentialityError::Encryption)?;
                Ok(encode(&SealedPayload {
                    nonce: nonce.to_vec(),
                    ciphertext,
                }))
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Confidentiality::Encrypted { .. })
    }
}

impl Debug for Confidentiality {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Confidentiality::Plain => write!(f, "Plain"),
            Confidentiality::Encrypted { .. } => write!(f, "Encrypted"),
        }
    }
}

/// Generate a random nonce for [`Confidentiality::seal`] using the operating system's random number
/// generator.
pub fn fresh_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; FRESH_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Wire form of a payload submitted in the [`Encrypted`](Confidentiality::Encrypted) mode.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SealedPayload {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn derive_cipher(
    chain_key: &[u8; 32],
    nonce: &[u8],
) -> Result<(Aes256Gcm, [u8; IV_LEN]), ConfidentialityError> {
    let root = hmac_sha256(chain_key, nonce)?;
    let payload_key = hmac_sha256(&root, &[PAYLOAD_KEY_LABEL])?;
    let iv_material = hmac_sha256(&root, &[IV_LABEL])?;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&iv_material[..IV_LEN]);
    let cipher =
        Aes256Gcm::new_from_slice(&payload_key).map_err(|_| ConfidentialityError::KeyDerivation)?;
    Ok((cipher, iv))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ConfidentialityError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| ConfidentialityError::KeyDerivation)?;
    mac.update(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

/// Enumerates the ways opening or sealing a payload can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfidentialityError {
    /// The payload is not a borsh-encoded [`SealedPayload`].
    Malformed(String),

    /// The sealed payload carries no nonce, so no key can be derived for it.
    EmptyNonce,

    KeyDerivation,

    /// The ciphertext was not produced under the chain key, or was tampered with.
    Decryption,

    Encryption,
}

impl Display for ConfidentialityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfidentialityError::Malformed(reason) => write!(f, "malformed sealed payload: {}", reason),
            ConfidentialityError::EmptyNonce => write!(f, "sealed payload has an empty nonce"),
            ConfidentialityError::KeyDerivation => write!(f, "could not derive payload key"),
            ConfidentialityError::Decryption => write!(f, "could not decrypt payload"),
            ConfidentialityError::Encryption => write!(f, "could not encrypt payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mode_passes_payloads_through() {
        let plain = Confidentiality::Plain;
        assert_eq!(plain.open(b"tx1").unwrap(), b"tx1".to_vec());
        assert_eq!(plain.seal(b"tx1", b"").unwrap(), b"tx1".to_vec());
    }

    #[test]
    fn sealed_payloads_open_only_under_the_same_chain_key() {
        let encrypted = Confidentiality::Encrypted { chain_key: [7u8; 32] };
        let other = Confidentiality::Encrypted { chain_key: [8u8; 32] };

        let sealed = encrypted.seal(b"transfer 10", &fresh_nonce()).unwrap();
        assert_ne!(sealed, b"transfer 10".to_vec());
        assert_eq!(encrypted.open(&sealed).unwrap(), b"transfer 10".to_vec());
        assert_eq!(other.open(&sealed), Err(ConfidentialityError::Decryption));
    }

    #[test]
    fn malformed_sealed_payloads_are_rejected() {
        let encrypted = Confidentiality::Encrypted { chain_key: [7u8; 32] };
        assert!(matches!(
            encrypted.open(b"not borsh"),
            Err(ConfidentialityError::Malformed(_))
        ));
        assert_eq!(
            encrypted.seal(b"tx1", &[]),
            Err(ConfidentialityError::EmptyNonce)
        );

        let no_nonce = encode(&SealedPayload {
            nonce: Vec::new(),
            ciphertext: vec![1, 2, 3],
        });
        assert_eq!(encrypted.open(&no_nonce), Err(ConfidentialityError::EmptyNonce));

        let mut tampered = SealedPayload::try_from_slice(
            &encrypted.seal(b"tx1", b"nonce").unwrap(),
        )
        .unwrap();
        tampered.ciphertext[0] ^= 1;
        assert_eq!(
            encrypted.open(&encode(&tampered)),
            Err(ConfidentialityError::Decryption)
        );
    }
}
