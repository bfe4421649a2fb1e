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

use crate::{
    node_id::NodeId,
    transport::{Transport, TransportId},
};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

/// One in-flight outbound attempt: the reservation created by `get_available_endpoint`, waiting
/// for the matching `add`. Destroyed on success, failure or timer expiry.
pub(crate) struct PendingConnection {
    pub node_id: NodeId,
    pub transport: Arc<dyn Transport>,
    /// Set once `add` has started a connect, to reject re-entrant adds for the same peer.
    pub connecting: bool,
    /// Distinguishes this reservation from an earlier one for the same peer whose timeout may
    /// already be queued.
    pub token: u64,
    cancel: CancellationToken,
}

impl PendingConnection {
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>, token: u64, cancel: CancellationToken) -> Self {
        Self {
            node_id,
            transport,
            connecting: false,
            token,
            cancel,
        }
    }

    pub fn cancel_timer(&self) {
        self.cancel.cancel();
    }
}

/// The indices the whole manager revolves around: active connections keyed by peer, pending
/// attempts in insertion order, and idle transports by identity. Owned exclusively by the
/// manager actor, so no locking happens here.
#[derive(Default)]
pub(crate) struct TransportDirectory {
    connections: HashMap<NodeId, Arc<dyn Transport>>,
    pendings: Vec<PendingConnection>,
    idle_transports: HashMap<TransportId, Arc<dyn Transport>>,
}

impl TransportDirectory {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn connection(&self, peer_id: &NodeId) -> Option<&Arc<dyn Transport>> {
        self.connections.get(peer_id)
    }

    /// Insert a connection entry. Returns false (and leaves the map untouched) when the peer
    /// already has one.
    pub fn insert_connection(&mut self, peer_id: NodeId, transport: Arc<dyn Transport>) -> bool {
        use std::collections::hash_map::Entry;
        match self.connections.entry(peer_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(transport);
                true
            },
        }
    }

    pub fn remove_connection(&mut self, peer_id: &NodeId) -> Option<Arc<dyn Transport>> {
        self.connections.remove(peer_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = (&NodeId, &Arc<dyn Transport>)> {
        self.connections.iter()
    }

    /// The transports referenced by `connections`, deduplicated by identity.
    pub fn unique_transports(&self) -> Vec<Arc<dyn Transport>> {
        let mut seen = HashMap::new();
        for transport in self.connections.values() {
            seen.entry(transport.id()).or_insert_with(|| transport.clone());
        }
        seen.into_iter().map(|(_, t)| t).collect()
    }

    pub fn pending(&self, peer_id: &NodeId) -> Option<&PendingConnection> {
        self.pendings.iter().find(|p| p.node_id == *peer_id)
    }

    pub fn pending_mut(&mut self, peer_id: &NodeId) -> Option<&mut PendingConnection> {
        self.pendings.iter_mut().find(|p| p.node_id == *peer_id)
    }

    pub fn add_pending(&mut self, pending: PendingConnection) {
        self.pendings.push(pending);
    }

    /// Remove the pending for `peer_id`, cancelling its timer. Returns it for inspection.
    pub fn remove_pending(&mut self, peer_id: &NodeId) -> Option<PendingConnection> {
        let index = self.pendings.iter().position(|p| p.node_id == *peer_id)?;
        let pending = self.pendings.remove(index);
        pending.cancel_timer();
        Some(pending)
    }

    /// Remove the pending for `peer_id` only if it is still the reservation the timeout was
    /// armed for.
    pub fn remove_pending_if_token(&mut self, peer_id: &NodeId, token: u64) -> bool {
        match self.pendings.iter().position(|p| p.node_id == *peer_id && p.token == token) {
            Some(index) => {
                self.pendings.remove(index);
                true
            },
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pendings.len()
    }

    pub fn pendings(&self) -> impl Iterator<Item = &PendingConnection> {
        self.pendings.iter()
    }

    pub fn drain_pendings(&mut self) -> Vec<PendingConnection> {
        self.pendings.drain(..).collect()
    }

    /// Add the transport to the idle set when it reports idle, otherwise drop it from the set.
    pub fn update_idle_transports(&mut self, transport: Arc<dyn Transport>) {
        if transport.is_idle() && transport.is_available() {
            self.idle_transports.insert(transport.id(), transport);
        } else {
            self.idle_transports.remove(&transport.id());
        }
    }

    pub fn remove_idle(&mut self, id: TransportId) {
        self.idle_transports.remove(&id);
    }

    /// An arbitrary transport from the idle set. Binding a pending to an idle transport keeps
    /// it idle, so the entry is not removed here; unavailable entries are dropped by the
    /// caller via [`remove_idle`](Self::remove_idle).
    pub fn first_idle(&self) -> Option<Arc<dyn Transport>> {
        self.idle_transports.values().next().cloned()
    }

    pub fn idle_transports(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.idle_transports.values()
    }

    pub fn idle_count(&self) -> usize {
        self.idle_transports.len()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
        self.pendings.clear();
        self.idle_transports.clear();
    }
}
