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

use crate::{crypto::NodePublicKey, endpoint::EndpointPair, node_id::NodeId};
use std::fmt;

/// Everything needed to reach and authenticate a peer: its identity, the endpoint pair it
/// advertises, and the public key its identity is bound to. Stored by value in bootstrap lists
/// and in the chosen-bootstrap slot.
#[derive(Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub endpoint_pair: EndpointPair,
    pub public_key: NodePublicKey,
}

impl Contact {
    pub fn new(id: NodeId, endpoint_pair: EndpointPair, public_key: NodePublicKey) -> Self {
        Self {
            id,
            endpoint_pair,
            public_key,
        }
    }
}

impl Default for Contact {
    /// An empty contact: invalid id, unspecified endpoints. Used to clear the chosen-bootstrap
    /// slot.
    fn default() -> Self {
        Self {
            id: NodeId::default(),
            endpoint_pair: EndpointPair::default(),
            public_key: NodePublicKey::default(),
        }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({}, {})", self.id.short_str(), self.endpoint_pair)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.id.short_str(), self.endpoint_pair)
    }
}
