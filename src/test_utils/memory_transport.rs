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

//! An in-process transport over a shared registry instead of UDP sockets. Bootstrap, rendezvous
//! connects, sends and closes behave like the real thing from the connection manager's point of
//! view, without touching the network.

use crate::{
    connection_manager::ConnectionManagerError,
    contact::Contact,
    crypto::NodePublicKey,
    endpoint::{Endpoint, EndpointPair},
    nat::{NatType, SharedNatType},
    node_id::NodeId,
    transport::{
        BootstrapRequest,
        ConnectionInfo,
        ConnectionState,
        Transport,
        TransportEvent,
        TransportEventTx,
        TransportFactory,
        TransportId,
    },
};
use bytes::Bytes;
use futures::{channel::oneshot, future::BoxFuture, FutureExt};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};
use tokio::time;

/// Shared registry binding memory transports together, in place of a real network.
pub struct MemoryNetwork {
    inner: Mutex<NetworkInner>,
    /// Serializes rendezvous matching so two sides connecting at once cannot both miss the
    /// other's intent.
    rendezvous: Mutex<()>,
    /// Artificial latency for rendezvous connects. Keeps "attempt in progress" windows open
    /// long enough for tests to observe them.
    connect_delay: Duration,
    /// How long a one-sided rendezvous waits for the peer before failing.
    rendezvous_timeout: Duration,
    /// How long bootstrap polls for a candidate to appear in the registry.
    bootstrap_wait: Duration,
}

struct NetworkInner {
    transports: HashMap<Endpoint, Weak<MemoryTransport>>,
    next_port: u16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetworkInner {
                transports: HashMap::new(),
                next_port: 20000,
            }),
            rendezvous: Mutex::new(()),
            connect_delay: Duration::from_millis(10),
            rendezvous_timeout: Duration::from_secs(5),
            bootstrap_wait: Duration::from_secs(1),
        })
    }

    fn register(&self, transport: &Arc<MemoryTransport>, requested: Endpoint) -> Endpoint {
        let mut inner = self.inner.lock().unwrap();
        let ip = if requested.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            requested.ip()
        };
        let port = if requested.port() != 0
            && !inner.transports.contains_key(&Endpoint::new(ip, requested.port()))
        {
            requested.port()
        } else {
            let port = inner.next_port;
            inner.next_port += 1;
            port
        };
        let endpoint = Endpoint::new(ip, port);
        inner.transports.insert(endpoint, Arc::downgrade(transport));
        endpoint
    }

    fn deregister(&self, endpoint: Endpoint) {
        self.inner.lock().unwrap().transports.remove(&endpoint);
    }

    fn find(&self, endpoint: &Endpoint) -> Option<Arc<MemoryTransport>> {
        self.inner
            .lock()
            .unwrap()
            .transports
            .get(endpoint)
            .and_then(Weak::upgrade)
    }

    /// Find a registered transport for the contact, waiting up to `bootstrap_wait` for it to
    /// appear and identify itself. Both sides of a zero-state pair bootstrap off each other
    /// concurrently, so one of them always arrives first.
    async fn find_ready(&self, contact: &Contact) -> Option<Arc<MemoryTransport>> {
        let deadline = time::Instant::now() + self.bootstrap_wait;
        loop {
            let found = self
                .find(&contact.endpoint_pair.local)
                .or_else(|| self.find(&contact.endpoint_pair.external));
            if let Some(transport) = found {
                if transport.identity().is_some() {
                    return Some(transport);
                }
            }
            if time::Instant::now() >= deadline {
                return None;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Creates [`MemoryTransport`]s bound to one [`MemoryNetwork`]. Keeps every transport it made
/// so tests can inspect them afterwards.
pub struct MemoryTransportFactory {
    network: Arc<MemoryNetwork>,
    next_id: AtomicU64,
    created: Mutex<Vec<Arc<MemoryTransport>>>,
    max_connections: usize,
}

impl MemoryTransportFactory {
    pub fn new(network: Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            next_id: AtomicU64::new(1),
            created: Mutex::new(Vec::new()),
            max_connections: 50,
        })
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.created.lock().unwrap().clone()
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, nat_type: SharedNatType) -> Arc<dyn Transport> {
        let id = TransportId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let transport = MemoryTransport::new(id, self.network.clone(), nat_type, self.max_connections);
        self.created.lock().unwrap().push(transport.clone());
        transport
    }
}

struct MemConnection {
    state: ConnectionState,
    peer: Contact,
    seen_by_peer: Endpoint,
}

struct ConnectIntent {
    seq: u64,
    peer_contact: Contact,
    reply: oneshot::Sender<Result<(), ConnectionManagerError>>,
}

#[derive(Default)]
struct MemState {
    local_endpoint: Option<Endpoint>,
    external_endpoint: Option<Endpoint>,
    identity: Option<(NodeId, NodePublicKey)>,
    event_tx: Option<TransportEventTx>,
    connections: HashMap<NodeId, MemConnection>,
    connect_intents: HashMap<NodeId, ConnectIntent>,
    packet_loss: Option<(f64, f64)>,
    pings: Vec<(NodeId, Endpoint, NodePublicKey)>,
    closed: bool,
}

pub struct MemoryTransport {
    id: TransportId,
    network: Arc<MemoryNetwork>,
    nat_type: SharedNatType,
    max_connections: usize,
    state: Mutex<MemState>,
    self_ref: Weak<MemoryTransport>,
    next_intent_seq: AtomicU64,
}

impl MemoryTransport {
    fn new(
        id: TransportId,
        network: Arc<MemoryNetwork>,
        nat_type: SharedNatType,
        max_connections: usize,
    ) -> Arc<Self>
    {
        Arc::new_cyclic(|self_ref| Self {
            id,
            network,
            nat_type,
            max_connections,
            state: Mutex::new(MemState::default()),
            self_ref: self_ref.clone(),
            next_intent_seq: AtomicU64::new(1),
        })
    }

    fn self_arc(&self) -> Arc<MemoryTransport> {
        self.self_ref.upgrade().expect("transport still referenced")
    }

    fn identity(&self) -> Option<(NodeId, NodePublicKey)> {
        self.state.lock().unwrap().identity
    }

    fn own_contact(&self) -> Option<Contact> {
        let state = self.state.lock().unwrap();
        let (id, public_key) = state.identity?;
        Some(Contact::new(
            id,
            EndpointPair::new(state.local_endpoint?, state.external_endpoint?),
            public_key,
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn packet_loss(&self) -> Option<(f64, f64)> {
        self.state.lock().unwrap().packet_loss
    }

    pub fn pings(&self) -> Vec<(NodeId, Endpoint, NodePublicKey)> {
        self.state.lock().unwrap().pings.clone()
    }

    pub fn connection_state(&self, peer_id: &NodeId) -> Option<ConnectionState> {
        self.state.lock().unwrap().connections.get(peer_id).map(|c| c.state)
    }

    /// Test hook: report a connection event as if the multiplexer raised it, returning the
    /// manager's duplicate verdict.
    pub fn raise_connection_added(&self, peer: Contact, temporary: bool) -> oneshot::Receiver<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event_tx = {
            let mut state = self.state.lock().unwrap();
            let seen_by_peer = state.local_endpoint.unwrap_or_else(crate::endpoint::unspecified_endpoint);
            let connection_state = if temporary {
                ConnectionState::Temporary
            } else {
                ConnectionState::Permanent
            };
            state.connections.entry(peer.id).or_insert(MemConnection {
                state: connection_state,
                peer: peer.clone(),
                seen_by_peer,
            });
            state.event_tx.clone()
        };
        if let Some(tx) = event_tx {
            let _ = tx.unbounded_send(TransportEvent::ConnectionAdded {
                peer_id: peer.id,
                transport: self.self_arc(),
                temporary,
                is_duplicate_reply: reply_tx,
            });
        }
        reply_rx
    }

    /// Install a connection to `peer` if none exists, raising the added event. The manager's
    /// duplicate verdict is handled in the background: a refused connection is dropped again
    /// and reported lost as temporary so the idle set stays accurate.
    fn install_connection(self: &Arc<Self>, peer: Contact, connection_state: ConnectionState) -> bool {
        let event_tx = {
            let mut state = self.state.lock().unwrap();
            if state.closed || state.connections.contains_key(&peer.id) {
                return false;
            }
            let seen_by_peer = state.local_endpoint.unwrap_or_else(crate::endpoint::unspecified_endpoint);
            state.connections.insert(peer.id, MemConnection {
                state: connection_state,
                peer: peer.clone(),
                seen_by_peer,
            });
            state.event_tx.clone()
        };

        let event_tx = match event_tx {
            Some(tx) => tx,
            None => return true,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = event_tx.unbounded_send(TransportEvent::ConnectionAdded {
            peer_id: peer.id,
            transport: self.self_arc(),
            temporary: false,
            is_duplicate_reply: reply_tx,
        });
        if sent.is_ok() {
            let this = self.self_arc();
            let peer_id = peer.id;
            tokio::spawn(async move {
                if let Ok(true) = reply_rx.await {
                    this.state.lock().unwrap().connections.remove(&peer_id);
                    this.emit_connection_lost(peer_id, true);
                }
            });
        }
        true
    }

    fn emit_connection_lost(&self, peer_id: NodeId, temporary: bool) {
        let event_tx = self.state.lock().unwrap().event_tx.clone();
        if let Some(tx) = event_tx {
            let _ = tx.unbounded_send(TransportEvent::ConnectionLost {
                peer_id,
                transport: self.self_arc(),
                temporary,
            });
        }
    }

    fn remove_connection_to(&self, peer_id: &NodeId) -> Option<MemConnection> {
        self.state.lock().unwrap().connections.remove(peer_id)
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn local_endpoint(&self) -> Endpoint {
        self.state
            .lock()
            .unwrap()
            .local_endpoint
            .unwrap_or_else(crate::endpoint::unspecified_endpoint)
    }

    fn external_endpoint(&self) -> Endpoint {
        self.state
            .lock()
            .unwrap()
            .external_endpoint
            .unwrap_or_else(crate::endpoint::unspecified_endpoint)
    }

    fn set_best_guess_external_endpoint(&self, endpoint: Endpoint) {
        self.state.lock().unwrap().external_endpoint = Some(endpoint);
    }

    fn this_endpoint_as_seen_by_peer(&self, peer_id: &NodeId) -> Option<Endpoint> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(peer_id)
            .map(|c| c.seen_by_peer)
    }

    fn is_idle(&self) -> bool {
        self.normal_connections_count() == 0
    }

    fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.closed && state.identity.is_some() && {
            let normal = state
                .connections
                .values()
                .filter(|c| c.state != ConnectionState::Temporary)
                .count();
            normal < self.max_connections
        }
    }

    fn normal_connections_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| c.state != ConnectionState::Temporary)
            .count()
    }

    fn connection_info(&self, peer_id: &NodeId) -> Option<ConnectionInfo> {
        self.state.lock().unwrap().connections.get(peer_id).map(|c| ConnectionInfo {
            state: c.state,
            peer_contact: c.peer.clone(),
            this_endpoint_as_seen_by_peer: c.seen_by_peer,
        })
    }

    fn bootstrap(
        &self,
        request: BootstrapRequest,
    ) -> BoxFuture<'static, Result<Contact, ConnectionManagerError>>
    {
        let this = self.self_arc();
        async move {
            let local = this.network.register(&this, request.local_endpoint);
            {
                let mut state = this.state.lock().unwrap();
                state.local_endpoint = Some(local);
                // The memory network has no NAT, so the socket's own endpoint is external too.
                state.external_endpoint = Some(local);
                state.identity = Some((request.this_node_id, request.public_key));
                state.event_tx = Some(request.event_tx.clone());
            }

            for candidate in &request.bootstrap_list {
                if candidate.id == request.this_node_id {
                    continue;
                }
                let peer = match this.network.find_ready(candidate).await {
                    Some(peer) => peer,
                    None => continue,
                };
                let peer_contact = match peer.own_contact() {
                    Some(contact) => contact,
                    None => continue,
                };
                if peer_contact.id == request.this_node_id {
                    continue;
                }
                if !peer.is_available() {
                    continue;
                }

                let our_contact = match this.own_contact() {
                    Some(contact) => contact,
                    None => break,
                };
                this.install_connection(peer_contact.clone(), ConnectionState::Bootstrapping);
                peer.install_connection(our_contact, ConnectionState::Bootstrapping);
                this.nat_type.set(NatType::Cone);
                return Ok(peer_contact);
            }

            Err(ConnectionManagerError::FailedToBootstrap)
        }
        .boxed()
    }

    fn connect(&self, peer: Contact, reply: oneshot::Sender<Result<(), ConnectionManagerError>>) {
        let this = self.self_arc();
        let seq = self.next_intent_seq.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            time::sleep(this.network.connect_delay).await;

            // An existing connection here is a bootstrap one; the rendezvous is already done
            // and the peer's add validated us, so just promote it.
            {
                let mut state = this.state.lock().unwrap();
                if let Some(connection) = state.connections.get_mut(&peer.id) {
                    connection.state = ConnectionState::Permanent;
                    drop(state);
                    let _ = reply.send(Ok(()));
                    return;
                }
            }

            let peer_transport = match this
                .network
                .find(&peer.endpoint_pair.local)
                .or_else(|| this.network.find(&peer.endpoint_pair.external))
            {
                Some(transport) => transport,
                None => {
                    let _ = reply.send(Err(ConnectionManagerError::TransportError(
                        "peer endpoint is not reachable".to_string(),
                    )));
                    return;
                },
            };

            let our_id = match this.identity() {
                Some((id, _)) => id,
                None => {
                    let _ = reply.send(Err(ConnectionManagerError::TransportError(
                        "transport has not bootstrapped".to_string(),
                    )));
                    return;
                },
            };

            // Rendezvous: if the peer is already waiting on its matching connect, complete both
            // sides now; otherwise leave our intent for the peer to find. The network-wide lock
            // makes check-and-store atomic across both sides.
            let _rendezvous_guard = this.network.rendezvous.lock().unwrap();
            let matched = peer_transport.state.lock().unwrap().connect_intents.remove(&our_id);
            match matched {
                Some(intent) => {
                    this.install_connection(peer.clone(), ConnectionState::Permanent);
                    peer_transport.install_connection(intent.peer_contact, ConnectionState::Permanent);
                    let _ = intent.reply.send(Ok(()));
                    let _ = reply.send(Ok(()));
                },
                None => {
                    this.state.lock().unwrap().connect_intents.insert(peer.id, ConnectIntent {
                        seq,
                        peer_contact: peer.clone(),
                        reply,
                    });
                    let watchdog = this.clone();
                    let peer_id = peer.id;
                    tokio::spawn(async move {
                        time::sleep(watchdog.network.rendezvous_timeout).await;
                        let mut state = watchdog.state.lock().unwrap();
                        let expired = state
                            .connect_intents
                            .get(&peer_id)
                            .map(|intent| intent.seq == seq)
                            .unwrap_or(false);
                        if expired {
                            let intent = state.connect_intents.remove(&peer_id).expect("checked above");
                            drop(state);
                            let _ = intent.reply.send(Err(ConnectionManagerError::TransportError(
                                "rendezvous timed out".to_string(),
                            )));
                        }
                    });
                },
            }
        });
    }

    fn close_connection(&self, peer_id: NodeId) -> BoxFuture<'static, ()> {
        let this = self.self_arc();
        async move {
            let removed = this.remove_connection_to(&peer_id);
            let connection = match removed {
                Some(connection) => connection,
                None => return,
            };
            this.emit_connection_lost(peer_id, false);

            let our_id = match this.identity() {
                Some((id, _)) => id,
                None => return,
            };
            let peer_transport = this
                .network
                .find(&connection.peer.endpoint_pair.local)
                .or_else(|| this.network.find(&connection.peer.endpoint_pair.external));
            if let Some(peer_transport) = peer_transport {
                if peer_transport.remove_connection_to(&our_id).is_some() {
                    peer_transport.emit_connection_lost(our_id, false);
                }
            }
        }
        .boxed()
    }

    fn send(
        &self,
        peer_id: &NodeId,
        message: Bytes,
    ) -> Option<BoxFuture<'static, Result<(), ConnectionManagerError>>>
    {
        let (peer_endpoint, our_id) = {
            let state = self.state.lock().unwrap();
            if state.closed {
                return None;
            }
            let connection = state.connections.get(peer_id)?;
            (connection.peer.endpoint_pair.local, state.identity?.0)
        };
        let network = self.network.clone();
        let peer_id = *peer_id;
        Some(
            async move {
                let peer_transport = network
                    .find(&peer_endpoint)
                    .ok_or(ConnectionManagerError::NotConnected)?;
                let event_tx = {
                    let state = peer_transport.state.lock().unwrap();
                    if !state.connections.contains_key(&our_id) {
                        return Err(ConnectionManagerError::NotConnected);
                    }
                    state.event_tx.clone()
                };
                event_tx
                    .and_then(|tx| {
                        tx.unbounded_send(TransportEvent::MessageReceived {
                            peer_id: our_id,
                            message,
                        })
                        .ok()
                    })
                    .ok_or(ConnectionManagerError::NotConnected)?;
                Ok(())
            }
            .boxed(),
        )
    }

    fn ping(&self, peer_id: NodeId, endpoint: Endpoint, public_key: NodePublicKey) {
        self.state.lock().unwrap().pings.push((peer_id, endpoint, public_key));
    }

    fn set_debug_packet_loss_rate(&self, constant: f64, bursty: f64) {
        self.state.lock().unwrap().packet_loss = Some((constant, bursty));
    }

    fn close(&self) {
        let (connections, local, our_id) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let connections: Vec<(NodeId, MemConnection)> = state.connections.drain().collect();
            (connections, state.local_endpoint, state.identity.map(|(id, _)| id))
        };

        if let Some(local) = local {
            self.network.deregister(local);
        }

        for (peer_id, connection) in connections {
            self.emit_connection_lost(peer_id, false);
            if let Some(our_id) = our_id {
                let peer_transport = self
                    .network
                    .find(&connection.peer.endpoint_pair.local)
                    .or_else(|| self.network.find(&connection.peer.endpoint_pair.external));
                if let Some(peer_transport) = peer_transport {
                    if peer_transport.remove_connection_to(&our_id).is_some() {
                        peer_transport.emit_connection_lost(our_id, false);
                    }
                }
            }
        }
    }
}
