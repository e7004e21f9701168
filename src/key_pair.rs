//! Throwaway SSH key pairs for test infrastructure.
//!
//! Keys are Ed25519. The public half is rendered in OpenSSH
//! `authorized_keys` format so it can be imported by cloud providers; the
//! private half is kept as a PKCS#8 PEM document so it survives persistence
//! between stages.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SSH algorithm name for Ed25519 keys and signatures.
pub const ED25519_ALGORITHM: &str = "ssh-ed25519";

/// Comment appended to generated OpenSSH public keys.
pub const DEFAULT_KEY_COMMENT: &str = "terrastage";

/// Errors raised while generating or decoding key material.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyPairError {
    /// The private key could not be encoded as PKCS#8.
    #[error("failed to encode private key: {message}")]
    Encode {
        /// Encoder error message.
        message: String,
    },
    /// The stored private key is not a valid Ed25519 PKCS#8 document.
    #[error("invalid private key: {message}")]
    InvalidPrivateKey {
        /// Decoder error message.
        message: String,
    },
}

/// A public/private key pair.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyPair {
    /// Public key in OpenSSH `authorized_keys` format.
    pub public_key: String,
    /// Private key as a PKCS#8 PEM document.
    pub private_key: String,
}

impl KeyPair {
    /// Generates a fresh Ed25519 key pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyPairError::Encode`] when the private key cannot be
    /// encoded.
    pub fn generate() -> Result<Self, KeyPairError> {
        let seed: [u8; 32] = rand::random();
        Self::from_signing_key(&SigningKey::from_bytes(&seed))
    }

    /// Builds a key pair from an existing signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyPairError::Encode`] when the private key cannot be
    /// encoded.
    pub fn from_signing_key(signing_key: &SigningKey) -> Result<Self, KeyPairError> {
        let private_key = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| KeyPairError::Encode {
                message: err.to_string(),
            })?;
        Ok(Self {
            public_key: openssh_public_key(&signing_key.verifying_key(), DEFAULT_KEY_COMMENT),
            private_key: private_key.as_str().to_owned(),
        })
    }

    /// Decodes the private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyPairError::InvalidPrivateKey`] when the stored document
    /// is not an Ed25519 PKCS#8 private key.
    pub fn signing_key(&self) -> Result<SigningKey, KeyPairError> {
        SigningKey::from_pkcs8_pem(&self.private_key).map_err(|err| {
            KeyPairError::InvalidPrivateKey {
                message: err.to_string(),
            }
        })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// A key pair registered with a cloud provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegisteredKeyPair {
    /// Provider-side key pair name.
    pub name: String,
    /// Region the key pair was registered in.
    pub region: String,
    /// Provider-assigned identifier, when the provider reports one.
    #[serde(default)]
    pub key_pair_id: Option<String>,
    /// Local key material.
    pub key_pair: KeyPair,
}

/// Encodes a public key in the SSH wire format (`string algo, string key`).
#[must_use]
pub fn public_key_blob(key: &VerifyingKey) -> Bytes {
    let mut blob = BytesMut::new();
    put_ssh_string(&mut blob, ED25519_ALGORITHM.as_bytes());
    put_ssh_string(&mut blob, key.as_bytes());
    blob.freeze()
}

/// Renders a public key as an OpenSSH `authorized_keys` line.
#[must_use]
pub fn openssh_public_key(key: &VerifyingKey, comment: &str) -> String {
    let encoded = STANDARD.encode(public_key_blob(key));
    if comment.is_empty() {
        format!("{ED25519_ALGORITHM} {encoded}")
    } else {
        format!("{ED25519_ALGORITHM} {encoded} {comment}")
    }
}

/// Appends a length-prefixed SSH `string`.
pub(crate) fn put_ssh_string(buf: &mut BytesMut, value: &[u8]) {
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    buf.put_u32(len);
    buf.put_slice(value);
}
