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

//! A transport stub with scriptable state for unit tests that only exercise directory and
//! selection logic.

use crate::{
    connection_manager::ConnectionManagerError,
    contact::Contact,
    crypto::NodePublicKey,
    endpoint::Endpoint,
    node_id::NodeId,
    transport::{BootstrapRequest, ConnectionInfo, Transport, TransportId},
};
use bytes::Bytes;
use futures::{channel::oneshot, future, future::BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

pub fn stub_transport(id: u64) -> Arc<StubTransport> {
    Arc::new(StubTransport::new(id))
}

/// Hands out [`StubTransport`]s with sequential ids and remembers them for inspection.
pub struct StubTransportFactory {
    next_id: AtomicU64,
    created: Mutex<Vec<Arc<StubTransport>>>,
}

impl StubTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1000),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn transports(&self) -> Vec<Arc<StubTransport>> {
        self.created.lock().unwrap().clone()
    }
}

impl crate::transport::TransportFactory for StubTransportFactory {
    fn create(&self, _nat_type: crate::nat::SharedNatType) -> Arc<dyn Transport> {
        let transport = stub_transport(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(transport.clone());
        transport
    }
}

pub struct StubTransport {
    id: TransportId,
    local_endpoint: Mutex<Endpoint>,
    external_endpoint: Mutex<Endpoint>,
    idle: AtomicBool,
    available: AtomicBool,
    closed: AtomicBool,
    normal_connections: AtomicUsize,
    connection_infos: Mutex<HashMap<NodeId, ConnectionInfo>>,
    pings: Mutex<Vec<(NodeId, Endpoint)>>,
    closed_connections: Mutex<Vec<NodeId>>,
    connect_requests: Mutex<Vec<Contact>>,
}

impl StubTransport {
    pub fn new(id: u64) -> Self {
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000 + id as u16);
        Self {
            id: TransportId(id),
            local_endpoint: Mutex::new(endpoint),
            external_endpoint: Mutex::new(endpoint),
            idle: AtomicBool::new(true),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            normal_connections: AtomicUsize::new(0),
            connection_infos: Mutex::new(HashMap::new()),
            pings: Mutex::new(Vec::new()),
            closed_connections: Mutex::new(Vec::new()),
            connect_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_normal_connections(&self, count: usize) {
        self.normal_connections.store(count, Ordering::SeqCst);
    }

    pub fn set_local_endpoint(&self, endpoint: Endpoint) {
        *self.local_endpoint.lock().unwrap() = endpoint;
    }

    pub fn set_external_endpoint(&self, endpoint: Endpoint) {
        *self.external_endpoint.lock().unwrap() = endpoint;
    }

    pub fn insert_connection_info(&self, peer_id: NodeId, info: ConnectionInfo) {
        self.connection_infos.lock().unwrap().insert(peer_id, info);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> Vec<(NodeId, Endpoint)> {
        self.pings.lock().unwrap().clone()
    }

    pub fn closed_connections(&self) -> Vec<NodeId> {
        self.closed_connections.lock().unwrap().clone()
    }

    pub fn connect_requests(&self) -> Vec<Contact> {
        self.connect_requests.lock().unwrap().clone()
    }
}

impl Transport for StubTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn local_endpoint(&self) -> Endpoint {
        *self.local_endpoint.lock().unwrap()
    }

    fn external_endpoint(&self) -> Endpoint {
        *self.external_endpoint.lock().unwrap()
    }

    fn set_best_guess_external_endpoint(&self, endpoint: Endpoint) {
        *self.external_endpoint.lock().unwrap() = endpoint;
    }

    fn this_endpoint_as_seen_by_peer(&self, peer_id: &NodeId) -> Option<Endpoint> {
        self.connection_infos
            .lock()
            .unwrap()
            .get(peer_id)
            .map(|info| info.this_endpoint_as_seen_by_peer)
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn normal_connections_count(&self) -> usize {
        self.normal_connections.load(Ordering::SeqCst)
    }

    fn connection_info(&self, peer_id: &NodeId) -> Option<ConnectionInfo> {
        self.connection_infos.lock().unwrap().get(peer_id).cloned()
    }

    fn bootstrap(
        &self,
        _request: BootstrapRequest,
    ) -> BoxFuture<'static, Result<Contact, ConnectionManagerError>>
    {
        future::ready(Err(ConnectionManagerError::FailedToBootstrap)).boxed()
    }

    fn connect(&self, peer: Contact, reply: oneshot::Sender<Result<(), ConnectionManagerError>>) {
        self.connect_requests.lock().unwrap().push(peer);
        let _ = reply.send(Ok(()));
    }

    fn close_connection(&self, peer_id: NodeId) -> BoxFuture<'static, ()> {
        self.closed_connections.lock().unwrap().push(peer_id);
        future::ready(()).boxed()
    }

    fn send(
        &self,
        peer_id: &NodeId,
        _message: Bytes,
    ) -> Option<BoxFuture<'static, Result<(), ConnectionManagerError>>>
    {
        if self.connection_infos.lock().unwrap().contains_key(peer_id) {
            Some(future::ready(Ok(())).boxed())
        } else {
            None
        }
    }

    fn ping(&self, peer_id: NodeId, endpoint: Endpoint, _public_key: NodePublicKey) {
        self.pings.lock().unwrap().push((peer_id, endpoint));
    }

    fn set_debug_packet_loss_rate(&self, _constant: f64, _bursty: f64) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
