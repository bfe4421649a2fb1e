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

use crate::crypto::NodePublicKey;
use blake2::{
    digest::{Update, VariableOutput},
    Blake2bVar,
};
use std::{
    convert::TryFrom,
    fmt,
    hash::{Hash, Hasher},
};
use thiserror::Error;

const NODE_ID_ARRAY_SIZE: usize = 32;
type NodeIdArray = [u8; NODE_ID_ARRAY_SIZE];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Incorrect byte count (expected {} bytes)", NODE_ID_ARRAY_SIZE)]
    IncorrectByteCount,
    #[error("Invalid digest output size")]
    InvalidDigestOutputSize,
}

/// The identifier of a node on the network, derived from its public key. A default-constructed
/// `NodeId` is all zero and is not valid; it is the sentinel used for "no node".
#[derive(Clone, Copy, Default, Eq, PartialOrd, Ord)]
pub struct NodeId(NodeIdArray);

impl NodeId {
    /// Construct an (invalid) zero node id.
    pub fn new() -> Self {
        Self([0; NODE_ID_ARRAY_SIZE])
    }

    /// Derive a node id from a public key by hashing it with Blake2b.
    pub fn from_public_key(public_key: &NodePublicKey) -> Result<Self, NodeIdError> {
        let mut hasher =
            Blake2bVar::new(NODE_ID_ARRAY_SIZE).map_err(|_| NodeIdError::InvalidDigestOutputSize)?;
        hasher.update(public_key.as_bytes());
        let mut id = [0u8; NODE_ID_ARRAY_SIZE];
        hasher
            .finalize_variable(&mut id)
            .map_err(|_| NodeIdError::InvalidDigestOutputSize)?;
        Ok(Self(id))
    }

    /// A node id is valid when it is not the all-zero sentinel.
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First few hex characters, for log lines.
    pub fn short_str(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &NodeId) -> bool {
        self.0 == other.0
    }
}

impl Hash for NodeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = NodeIdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != NODE_ID_ARRAY_SIZE {
            return Err(NodeIdError::IncorrectByteCount);
        }
        let mut id = [0u8; NODE_ID_ARRAY_SIZE];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn default_is_invalid() {
        assert!(!NodeId::new().is_valid());
        assert!(!NodeId::default().is_valid());
    }

    #[test]
    fn derived_id_is_valid_and_stable() {
        let keypair = Keypair::generate();
        let id1 = NodeId::from_public_key(keypair.public_key()).unwrap();
        let id2 = NodeId::from_public_key(keypair.public_key()).unwrap();
        assert!(id1.is_valid());
        assert_eq!(id1, id2);
    }

    #[test]
    fn distinct_keys_produce_distinct_ids() {
        let a = NodeId::from_public_key(Keypair::generate().public_key()).unwrap();
        let b = NodeId::from_public_key(Keypair::generate().public_key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn try_from_rejects_wrong_length() {
        assert_eq!(
            NodeId::try_from(&[1u8; 16][..]).unwrap_err(),
            NodeIdError::IncorrectByteCount
        );
        assert!(NodeId::try_from(&[1u8; 32][..]).unwrap().is_valid());
    }
}
