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

//! Helpers for standing up whole nodes in tests.

use super::memory_transport::{MemoryNetwork, MemoryTransportFactory};
use crate::{
    connection_manager::{
        ConnectionListener,
        ConnectionManager,
        ConnectionManagerConfig,
        ConnectionManagerRequester,
    },
    contact::Contact,
    crypto::Keypair,
    endpoint::{Endpoint, EndpointPair},
    node_id::NodeId,
};
use bytes::Bytes;
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex, Weak},
};
use tokio::task;
use tokio_util::sync::CancellationToken;

/// Collects listener callbacks for assertions.
#[derive(Default)]
pub struct TestListener {
    messages: Mutex<Vec<(NodeId, Bytes)>>,
    lost: Mutex<Vec<NodeId>>,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(NodeId, Bytes)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<NodeId> {
        self.lost.lock().unwrap().clone()
    }
}

impl ConnectionListener for TestListener {
    fn message_received(&self, peer_id: NodeId, message: Bytes) {
        self.messages.lock().unwrap().push((peer_id, message));
    }

    fn connection_lost(&self, peer_id: NodeId) {
        self.lost.lock().unwrap().push(peer_id);
    }
}

pub fn build_identity() -> (NodeId, Keypair) {
    let keypair = Keypair::generate();
    let node_id = NodeId::from_public_key(keypair.public_key()).unwrap();
    (node_id, keypair)
}

/// A node under test: a spawned connection manager actor plus everything needed to drive and
/// inspect it.
pub struct TestNode {
    pub node_id: NodeId,
    pub keypair: Keypair,
    pub requester: ConnectionManagerRequester,
    pub listener: Arc<TestListener>,
    pub factory: Arc<MemoryTransportFactory>,
    pub shutdown: CancellationToken,
    pub join_handle: task::JoinHandle<()>,
}

impl TestNode {
    /// The contact other nodes use to bootstrap off this node, bound to `port` on localhost.
    pub fn seed_contact(&self, port: u16) -> Contact {
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Contact::new(
            self.node_id,
            EndpointPair::new(endpoint, endpoint),
            *self.keypair.public_key(),
        )
    }
}

/// Spawn a connection manager actor wired to the given in-memory network.
pub fn build_node(network: Arc<MemoryNetwork>, config: ConnectionManagerConfig) -> TestNode {
    let (node_id, keypair) = build_identity();
    let listener = TestListener::new();
    let factory = MemoryTransportFactory::new(network);
    let shutdown = CancellationToken::new();

    let weak_listener: Weak<dyn ConnectionListener> = {
        let arc: Arc<dyn ConnectionListener> = listener.clone();
        Arc::downgrade(&arc)
    };

    let (requester, manager) = ConnectionManager::channel(
        config,
        node_id,
        keypair.clone(),
        weak_listener,
        factory.clone(),
        shutdown.clone(),
    );
    let join_handle = manager.spawn();

    TestNode {
        node_id,
        keypair,
        requester,
        listener,
        factory,
        shutdown,
        join_handle,
    }
}
