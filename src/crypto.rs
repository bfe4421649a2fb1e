// Copyright 2023, The RudpComms Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Asymmetric message encryption.
//!
//! Messages are encrypted to a peer's public key using ephemeral X25519 Diffie-Hellman,
//! HKDF-SHA256 key derivation and XChaCha20-Poly1305. Each message gets a fresh ephemeral
//! keypair, so there is nothing to store per peer and compromise of one message key exposes
//! nothing else.
//!
//! Wire layout of an encrypted payload:
//!
//! ```text
//! [ephemeral public key: 32 bytes][nonce: 24 bytes][ciphertext + tag]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key,
    XChaCha20Poly1305,
    XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Size in bytes of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size in bytes of an X25519 secret key.
pub const SECRET_KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 24;
const HKDF_INFO: &[u8] = b"rudp-comms-message-xchacha20poly1305-v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encrypted payload is malformed or truncated")]
    MalformedPayload,
    #[error("Message encryption failed")]
    EncryptionFailed,
    #[error("Message decryption failed")]
    DecryptionFailed,
}

/// A node's long-term X25519 public key. This is the key peers encrypt messages to, and the
/// value a `NodeId` is derived from.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePublicKey([u8; PUBLIC_KEY_SIZE]);

impl NodePublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…)")
    }
}

/// A node's long-term X25519 secret key. Zeroized on drop.
#[derive(Clone)]
pub struct NodeSecretKey([u8; SECRET_KEY_SIZE]);

impl NodeSecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Drop for NodeSecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for NodeSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeSecretKey(…)")
    }
}

/// A long-term identity keypair.
#[derive(Clone, Debug)]
pub struct Keypair {
    public: NodePublicKey,
    secret: NodeSecretKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: NodePublicKey(*public.as_bytes()),
            secret: NodeSecretKey(secret.to_bytes()),
        }
    }

    pub fn public_key(&self) -> &NodePublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &NodeSecretKey {
        &self.secret
    }
}

fn derive_message_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    key
}

/// Encrypt `plaintext` so that only the holder of the secret key matching `recipient` can read
/// it.
pub fn encrypt(plaintext: &[u8], recipient: &NodePublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient.as_bytes()));
    let key = derive_message_key(shared.as_bytes());

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut payload = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(ephemeral_public.as_bytes());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Decrypt a payload produced by [`encrypt`] using this node's secret key.
pub fn decrypt(payload: &[u8], secret: &NodeSecretKey) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::MalformedPayload);
    }
    let mut ephemeral_public = [0u8; PUBLIC_KEY_SIZE];
    ephemeral_public.copy_from_slice(&payload[..PUBLIC_KEY_SIZE]);
    let nonce = &payload[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE];
    let ciphertext = &payload[PUBLIC_KEY_SIZE + NONCE_SIZE..];

    let secret = StaticSecret::from(secret.0);
    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));
    let key = derive_message_key(shared.as_bytes());

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
