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

use super::{
    config::ConnectionManagerConfig,
    directory::{PendingConnection, TransportDirectory},
    error::ConnectionManagerError,
    requester::{ConnectionManagerRequest, ConnectionManagerRequester},
};
use crate::{
    contact::Contact,
    crypto::{self, Keypair, NodePublicKey},
    endpoint::{is_valid_endpoint, on_private_network, Endpoint, EndpointPair},
    nat::{NatType, SharedNatType},
    node_id::NodeId,
    transport::{
        BootstrapRequest,
        ConnectionState,
        Transport,
        TransportEvent,
        TransportEventTx,
        TransportFactory,
    },
    utils,
};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use log::*;
use rand::seq::SliceRandom;
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Weak},
};
use tokio::{task, time};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "rudp::connection_manager::manager";

/// The application's view of connection events. The manager holds this as a weak reference and
/// never extends the listener's lifetime; events arriving after the listener is dropped are
/// discarded.
pub trait ConnectionListener: Send + Sync {
    fn message_received(&self, peer_id: NodeId, message: Bytes);
    fn connection_lost(&self, peer_id: NodeId);
}

/// The connection manager actor. Owns the transport directory and processes API requests and
/// transport callbacks strictly one at a time, which is what upholds the directory invariants.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    node_id: NodeId,
    keypair: Keypair,
    listener: Weak<dyn ConnectionListener>,
    factory: Arc<dyn TransportFactory>,
    nat_type: SharedNatType,
    request_rx: mpsc::Receiver<ConnectionManagerRequest>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    event_tx: TransportEventTx,
    directory: TransportDirectory,
    chosen_bootstrap_contact: Contact,
    local_ip: Option<IpAddr>,
    packet_loss_rate: Option<(f64, f64)>,
    next_pending_token: u64,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a connection manager actor together with the requester paired to it. The request
    /// channel is sized from `config.request_channel_size`; transport events ride an unbounded
    /// channel so callbacks raised from synchronous transport contexts never block or drop.
    pub fn channel(
        config: ConnectionManagerConfig,
        node_id: NodeId,
        keypair: Keypair,
        listener: Weak<dyn ConnectionListener>,
        factory: Arc<dyn TransportFactory>,
        shutdown: CancellationToken,
    ) -> (ConnectionManagerRequester, Self)
    {
        let (request_tx, request_rx) = mpsc::channel(config.request_channel_size);
        let requester = ConnectionManagerRequester::new(request_tx);
        let manager = Self::new(config, node_id, keypair, listener, factory, request_rx, shutdown);
        (requester, manager)
    }

    pub fn new(
        config: ConnectionManagerConfig,
        node_id: NodeId,
        keypair: Keypair,
        listener: Weak<dyn ConnectionListener>,
        factory: Arc<dyn TransportFactory>,
        request_rx: mpsc::Receiver<ConnectionManagerRequest>,
        shutdown: CancellationToken,
    ) -> Self
    {
        let (event_tx, event_rx) = mpsc::unbounded();
        Self {
            config,
            node_id,
            keypair,
            listener,
            factory,
            nat_type: SharedNatType::default(),
            request_rx,
            event_rx,
            event_tx,
            directory: TransportDirectory::new(),
            chosen_bootstrap_contact: Contact::default(),
            local_ip: None,
            packet_loss_rate: None,
            next_pending_token: 0,
            shutdown,
        }
    }

    pub fn spawn(self) -> task::JoinHandle<()> {
        task::spawn(self.run())
    }

    pub async fn run(mut self) {
        let shutdown = self.shutdown.clone();
        debug!(target: LOG_TARGET, "Connection manager started");
        loop {
            tokio::select! {
                Some(request) = self.request_rx.next() => self.handle_request(request),
                Some(event) = self.event_rx.next() => self.handle_transport_event(event),
                _ = shutdown.cancelled() => {
                    info!(
                        target: LOG_TARGET,
                        "Connection manager is shutting down because it received the shutdown signal"
                    );
                    break;
                },
                else => break,
            }
        }
        self.shutdown_all();
    }

    fn handle_request(&mut self, request: ConnectionManagerRequest) {
        use ConnectionManagerRequest::*;
        trace!(target: LOG_TARGET, "Connection manager got request: {:?}", request);
        match request {
            Bootstrap {
                bootstrap_list,
                local_endpoint_hint,
                reply,
            } => self.handle_bootstrap(bootstrap_list, local_endpoint_hint, reply),
            GetAvailableEndpoint {
                peer_id,
                peer_hint,
                reply,
            } => {
                let _ = reply.send(self.get_available_endpoint(peer_id, peer_hint));
            },
            AddPeer { peer, reply } => self.add_peer(peer, reply),
            RemovePeer { peer_id } => self.remove_peer(peer_id),
            SendMessage {
                peer_id,
                message,
                reply,
            } => self.send_to_peer(peer_id, message, reply),
            SetDebugPacketLossRate { constant, bursty } => {
                self.packet_loss_rate = Some((constant, bursty));
                for transport in self.all_transports() {
                    transport.set_debug_packet_loss_rate(constant, bursty);
                }
            },
        }
    }

    pub(crate) fn handle_transport_event(&mut self, event: TransportEvent) {
        trace!(target: LOG_TARGET, "Transport event: {}", event);
        match event {
            TransportEvent::MessageReceived { peer_id, message } => self.on_message(peer_id, message),
            TransportEvent::ConnectionAdded {
                peer_id,
                transport,
                temporary,
                is_duplicate_reply,
            } => {
                let is_duplicate = self.on_connection_added(peer_id, transport, temporary);
                let _ = is_duplicate_reply.send(is_duplicate);
            },
            TransportEvent::ConnectionLost {
                peer_id,
                transport,
                temporary,
            } => self.on_connection_lost(peer_id, transport, temporary),
            TransportEvent::NatDetectionRequested {
                this_local_endpoint,
                peer_id,
                peer_endpoint,
                peer_public_key,
                external_port_reply,
            } => {
                let port =
                    self.on_nat_detection_requested(this_local_endpoint, peer_id, peer_endpoint, peer_public_key);
                let _ = external_port_reply.send(port);
            },
            TransportEvent::PendingTimeout { peer_id, token } => {
                if self.directory.remove_pending_if_token(&peer_id, token) {
                    debug!(
                        target: LOG_TARGET,
                        "Connection attempt to {} timed out waiting for add", peer_id.short_str()
                    );
                }
            },
            TransportEvent::Bootstrapped {
                transport,
                result,
                inferred_external,
                reply,
            } => self.on_transport_bootstrapped(transport, result, inferred_external, reply),
        }
    }

    //---------------------------------- Bootstrapper ------------------------------------------//

    fn handle_bootstrap(
        &mut self,
        bootstrap_list: Vec<Contact>,
        local_endpoint_hint: Option<Endpoint>,
        reply: oneshot::Sender<Result<(Contact, Contact), ConnectionManagerError>>,
    )
    {
        if self.listener.upgrade().is_none() {
            error!(target: LOG_TARGET, "A live listener must be provided before bootstrapping");
            let _ = reply.send(Err(ConnectionManagerError::InvalidParameter));
            return;
        }
        if !self.node_id.is_valid() {
            error!(target: LOG_TARGET, "This node's id is not valid");
            let _ = reply.send(Err(ConnectionManagerError::InvalidParameter));
            return;
        }
        if bootstrap_list.is_empty() {
            error!(target: LOG_TARGET, "At least one bootstrap contact must be provided");
            let _ = reply.send(Err(ConnectionManagerError::NoBootstrapEndpoints));
            return;
        }

        let local_endpoint = match local_endpoint_hint.filter(is_valid_endpoint) {
            Some(endpoint) => {
                self.local_ip = Some(endpoint.ip());
                endpoint
            },
            None => match utils::discover_local_ip() {
                Some(ip) => {
                    self.local_ip = Some(ip);
                    Endpoint::new(ip, 0)
                },
                None => {
                    error!(target: LOG_TARGET, "Failed to retrieve local IP");
                    let _ = reply.send(Err(ConnectionManagerError::FailedToGetLocalAddress));
                    return;
                },
            },
        };

        self.start_new_transport(bootstrap_list, local_endpoint, Some(reply));
    }

    pub(crate) fn start_new_transport(
        &mut self,
        mut bootstrap_list: Vec<Contact>,
        local_endpoint: Endpoint,
        reply: Option<oneshot::Sender<Result<(Contact, Contact), ConnectionManagerError>>>,
    )
    {
        let transport = self.factory.create(self.nat_type.clone());
        if let Some((constant, bursty)) = self.packet_loss_rate {
            transport.set_debug_packet_loss_rate(constant, bursty);
        }

        let bootstrap_off_existing = bootstrap_list.is_empty();
        let mut inferred_external = None;
        if bootstrap_off_existing {
            let (list, external) = self.get_bootstrap_endpoints();
            bootstrap_list = list;
            inferred_external = external;
        }

        // A node must never bootstrap off one of its own transports.
        let own_locals: Vec<Endpoint> = self
            .directory
            .idle_transports()
            .map(|t| t.local_endpoint())
            .collect();
        bootstrap_list.retain(|contact| !own_locals.contains(&contact.endpoint_pair.local));

        debug!(
            target: LOG_TARGET,
            "Starting transport {} with {} bootstrap candidate(s)",
            transport.id(),
            bootstrap_list.len()
        );

        let request = BootstrapRequest {
            bootstrap_list,
            this_node_id: self.node_id,
            public_key: *self.keypair.public_key(),
            local_endpoint,
            bootstrap_off_existing,
            event_tx: self.event_tx.clone(),
        };

        let bootstrap_fut = transport.bootstrap(request);
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        task::spawn(async move {
            tokio::select! {
                result = bootstrap_fut => {
                    let on_send_failure = transport.clone();
                    let event = TransportEvent::Bootstrapped {
                        transport,
                        result,
                        inferred_external,
                        reply,
                    };
                    if event_tx.unbounded_send(event).is_err() {
                        on_send_failure.close();
                    }
                },
                _ = shutdown.cancelled() => {
                    transport.close();
                },
            }
        });
    }

    fn on_transport_bootstrapped(
        &mut self,
        transport: Arc<dyn Transport>,
        result: Result<Contact, ConnectionManagerError>,
        inferred_external: Option<IpAddr>,
        reply: Option<oneshot::Sender<Result<(Contact, Contact), ConnectionManagerError>>>,
    )
    {
        match result {
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    "Transport {} failed to bootstrap: {}",
                    transport.id(),
                    err
                );
                transport.close();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ConnectionManagerError::FailedToBootstrap));
                }
            },
            Ok(chosen_contact) => {
                debug!(
                    target: LOG_TARGET,
                    "Transport {} bootstrapped off {}",
                    transport.id(),
                    chosen_contact
                );
                // An established choice survives later transports; only fill an empty slot.
                if !self.chosen_bootstrap_contact.id.is_valid() {
                    self.chosen_bootstrap_contact = chosen_contact.clone();
                }

                if !is_valid_endpoint(&transport.external_endpoint()) {
                    if let Some(address) = inferred_external {
                        // NAT is symmetric or unknown. Guess that this transport maps to the
                        // already-observed external address on its own local port.
                        transport.set_best_guess_external_endpoint(Endpoint::new(
                            address,
                            transport.local_endpoint().port(),
                        ));
                    }
                }

                if let Some(reply) = reply {
                    let own_contact = Contact::new(
                        self.node_id,
                        EndpointPair::new(transport.local_endpoint(), transport.external_endpoint()),
                        *self.keypair.public_key(),
                    );
                    let _ = reply.send(Ok((own_contact, chosen_contact)));
                }
            },
        }
    }

    /// Candidates for bootstrapping a new transport off the connections we already have.
    /// Connections to peers on public networks come first since they allow inferring the new
    /// transport's external address; the inferred address is returned only when every such
    /// peer agrees on it.
    pub(crate) fn get_bootstrap_endpoints(&self) -> (Vec<Contact>, Option<IpAddr>) {
        let mut primary = Vec::new();
        let mut secondary = Vec::new();
        let mut seen_endpoints = HashSet::new();
        let mut external: Option<IpAddr> = None;
        let mut external_consistent = true;

        for (peer_id, transport) in self.directory.connections() {
            let info = match transport.connection_info(peer_id) {
                Some(info) => info,
                None => continue,
            };
            let peer_endpoint = info.peer_contact.endpoint_pair.external;
            if !seen_endpoints.insert(peer_endpoint) {
                continue;
            }
            if on_private_network(&peer_endpoint) {
                secondary.push(info.peer_contact);
            } else {
                let seen_by_peer = info.this_endpoint_as_seen_by_peer.ip();
                match external {
                    None => external = Some(seen_by_peer),
                    Some(address) if address != seen_by_peer => external_consistent = false,
                    _ => {},
                }
                primary.push(info.peer_contact);
            }
        }

        let mut rng = rand::thread_rng();
        primary.shuffle(&mut rng);
        secondary.shuffle(&mut rng);
        primary.extend(secondary);

        (primary, if external_consistent { external } else { None })
    }

    //---------------------------------- Endpoint selection ------------------------------------//

    pub(crate) fn get_available_endpoint(
        &mut self,
        peer_id: NodeId,
        peer_hint: EndpointPair,
    ) -> Result<EndpointPair, ConnectionManagerError>
    {
        if peer_id == self.node_id {
            error!(target: LOG_TARGET, "Can't use this node's own id as the peer id");
            return Err(ConnectionManagerError::OperationNotSupported);
        }
        if !peer_id.is_valid() {
            return Err(ConnectionManagerError::InvalidParameter);
        }

        // Re-reserving for the same peer is idempotent.
        if let Some(pending) = self.directory.pending(&peer_id) {
            return Ok(EndpointPair::new(
                pending.transport.local_endpoint(),
                pending.transport.external_endpoint(),
            ));
        }

        if let Some(transport) = self.directory.connection(&peer_id).cloned() {
            match transport.connection_info(&peer_id) {
                Some(info) if info.state.is_bootstrapping() || info.state.is_unvalidated() => {
                    let pair = EndpointPair::new(transport.local_endpoint(), transport.external_endpoint());
                    // Shadow the early connection with a pending so a subsequent add can
                    // complete against the same transport.
                    self.add_pending(peer_id, transport);
                    return Ok(pair);
                },
                Some(_) => return Err(ConnectionManagerError::AlreadyConnected),
                None => {
                    error!(
                        target: LOG_TARGET,
                        "Directory out of sync: no connection to {} on transport {}",
                        peer_id.short_str(),
                        transport.id()
                    );
                    self.directory.remove_connection(&peer_id);
                },
            }
        }

        if self.should_start_new_transport(&peer_hint) {
            let local_endpoint = Endpoint::new(
                self.local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                0,
            );
            // Started asynchronously; the caller is served from an existing transport in the
            // meantime.
            self.start_new_transport(Vec::new(), local_endpoint, None);
        }

        if let Some(pair) = self.select_idle_transport(peer_id) {
            return Ok(pair);
        }
        self.select_any_transport(peer_id)
            .ok_or(ConnectionManagerError::NoAvailableTransports)
    }

    pub(crate) fn should_start_new_transport(&self, peer_hint: &EndpointPair) -> bool {
        let connection_count = self.directory.connection_count();
        if self.nat_type.get() == NatType::Symmetric {
            // Symmetric NATs burn a fresh local port per peer. Only expand while the total
            // connection budget allows it, and only when the peer's external endpoint is
            // reachable or the peer gave no directly usable local address.
            if connection_count >= self.config.max_transports * self.config.max_connections_per_transport {
                return false;
            }
            if is_valid_endpoint(&peer_hint.external) {
                true
            } else {
                !is_valid_endpoint(&peer_hint.local)
            }
        } else {
            connection_count < self.config.max_transports
        }
    }

    fn select_idle_transport(&mut self, peer_id: NodeId) -> Option<EndpointPair> {
        while let Some(transport) = self.directory.first_idle() {
            if transport.is_available() {
                let pair = EndpointPair::new(transport.local_endpoint(), transport.external_endpoint());
                self.add_pending(peer_id, transport);
                return Some(pair);
            }
            self.directory.remove_idle(transport.id());
        }
        None
    }

    fn select_any_transport(&mut self, peer_id: NodeId) -> Option<EndpointPair> {
        let transport = self.get_available_transport()?;
        let pair = EndpointPair::new(transport.local_endpoint(), transport.external_endpoint());
        self.add_pending(peer_id, transport);
        Some(pair)
    }

    /// The transport with the fewest normal connections, strictly below the per-transport cap.
    /// First encountered wins ties.
    fn get_available_transport(&self) -> Option<Arc<dyn Transport>> {
        let mut least_connections = self.config.max_connections_per_transport;
        let mut selected = None;
        for transport in self.directory.unique_transports() {
            if !transport.is_available() {
                continue;
            }
            let count = transport.normal_connections_count();
            if count < least_connections {
                least_connections = count;
                selected = Some(transport);
            }
        }
        selected
    }

    fn add_pending(&mut self, peer_id: NodeId, transport: Arc<dyn Transport>) {
        let token = self.next_pending_token;
        self.next_pending_token += 1;
        let cancel = CancellationToken::new();
        let timer_cancel = cancel.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.config.rendezvous_connect_timeout;
        task::spawn(async move {
            tokio::select! {
                _ = time::sleep(timeout) => {
                    let _ = event_tx.unbounded_send(TransportEvent::PendingTimeout { peer_id, token });
                },
                _ = timer_cancel.cancelled() => {},
            }
        });
        self.directory
            .add_pending(PendingConnection::new(peer_id, transport, token, cancel));
    }

    //---------------------------------- Public API gates --------------------------------------//

    fn add_peer(&mut self, peer: Contact, reply: oneshot::Sender<Result<(), ConnectionManagerError>>) {
        if peer.id == self.node_id {
            error!(target: LOG_TARGET, "Can't use this node's own id as the peer id");
            let _ = reply.send(Err(ConnectionManagerError::OperationNotSupported));
            return;
        }
        if peer.id == self.chosen_bootstrap_contact.id && peer.public_key != self.chosen_bootstrap_contact.public_key
        {
            warn!(
                target: LOG_TARGET,
                "Contact claims the chosen bootstrap id {} with a different public key",
                peer.id.short_str()
            );
            let _ = reply.send(Err(ConnectionManagerError::InvalidParameter));
            return;
        }

        match self.directory.pending(&peer.id) {
            None => {
                let result = if self.directory.connection(&peer.id).is_some() {
                    warn!(
                        target: LOG_TARGET,
                        "A managed connection to {} already exists", peer.id.short_str()
                    );
                    Err(ConnectionManagerError::AlreadyConnected)
                } else {
                    error!(
                        target: LOG_TARGET,
                        "No connection attempt to {} - ensure get_available_endpoint has been called first",
                        peer.id.short_str()
                    );
                    Err(ConnectionManagerError::OperationNotSupported)
                };
                let _ = reply.send(result);
                return;
            },
            Some(pending) if pending.connecting => {
                warn!(
                    target: LOG_TARGET,
                    "A connection attempt to {} is already happening",
                    peer.id.short_str()
                );
                let _ = reply.send(Err(ConnectionManagerError::ConnectionAlreadyInProgress));
                return;
            },
            Some(_) => {},
        }

        let transport = match self.directory.pending_mut(&peer.id) {
            Some(pending) => {
                pending.connecting = true;
                pending.transport.clone()
            },
            None => return,
        };

        if let Some(info) = transport.connection_info(&peer.id) {
            // A connection already on the pending transport should be a bootstrap one. If this
            // node bootstrapped off the peer, the peer's validation data may already have
            // promoted it to permanent; only in that case is a permanent connection acceptable
            // here.
            let usable = info.state.is_bootstrapping()
                || (info.state == ConnectionState::Permanent && peer.id == self.chosen_bootstrap_contact.id);
            if usable {
                let _ = reply.send(Ok(()));
            } else {
                warn!(
                    target: LOG_TARGET,
                    "A managed connection to {} already exists on transport {}",
                    peer.id.short_str(),
                    transport.id()
                );
                self.directory.remove_pending(&peer.id);
                let _ = reply.send(Err(ConnectionManagerError::AlreadyConnected));
            }
            return;
        }

        transport.connect(peer, reply);
    }

    fn remove_peer(&mut self, peer_id: NodeId) {
        if peer_id == self.node_id {
            error!(target: LOG_TARGET, "Can't use this node's own id as the peer id");
            return;
        }
        match self.directory.connection(&peer_id) {
            Some(transport) => {
                // The close is performed off the actor; removal from the directory happens when
                // the transport reports the loss.
                let transport = transport.clone();
                task::spawn(async move {
                    transport.close_connection(peer_id).await;
                });
            },
            None => {
                debug!(
                    target: LOG_TARGET,
                    "Can't remove connection to {} - not in the directory",
                    peer_id.short_str()
                );
            },
        }
    }

    fn send_to_peer(
        &mut self,
        peer_id: NodeId,
        message: Bytes,
        reply: oneshot::Sender<Result<(), ConnectionManagerError>>,
    )
    {
        if peer_id == self.node_id {
            error!(target: LOG_TARGET, "Can't use this node's own id as the peer id");
            let _ = reply.send(Err(ConnectionManagerError::OperationNotSupported));
            return;
        }

        let transport = match self.directory.connection(&peer_id) {
            Some(transport) => transport.clone(),
            None => {
                debug!(
                    target: LOG_TARGET,
                    "Can't send to {} - not in the directory",
                    peer_id.short_str()
                );
                let _ = reply.send(Err(ConnectionManagerError::NotConnected));
                return;
            },
        };

        let payload = if self.config.encrypt_messages {
            let public_key = match transport.connection_info(&peer_id) {
                Some(info) => info.peer_contact.public_key,
                None => {
                    error!(
                        target: LOG_TARGET,
                        "Directory out of sync: no connection to {} on transport {}",
                        peer_id.short_str(),
                        transport.id()
                    );
                    let _ = reply.send(Err(ConnectionManagerError::NotConnected));
                    return;
                },
            };
            match crypto::encrypt(&message, &public_key) {
                Ok(ciphertext) => Bytes::from(ciphertext),
                Err(err) => {
                    error!(
                        target: LOG_TARGET,
                        "Failed to encrypt message for {}: {}",
                        peer_id.short_str(),
                        err
                    );
                    let _ = reply.send(Err(ConnectionManagerError::MessageEncryptionFailed));
                    return;
                },
            }
        } else {
            message
        };

        match transport.send(&peer_id, payload) {
            Some(delivery) => {
                task::spawn(async move {
                    let _ = reply.send(delivery.await);
                });
            },
            None => {
                let _ = reply.send(Err(ConnectionManagerError::NotConnected));
            },
        }
    }

    //---------------------------------- Event sink --------------------------------------------//

    fn on_message(&self, peer_id: NodeId, message: Bytes) {
        let plaintext = if self.config.encrypt_messages {
            match crypto::decrypt(&message, self.keypair.secret_key()) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    error!(
                        target: LOG_TARGET,
                        "Failed to decrypt message from {}: {}",
                        peer_id.short_str(),
                        err
                    );
                    return;
                },
            }
        } else {
            message
        };
        if let Some(listener) = self.listener.upgrade() {
            listener.message_received(peer_id, plaintext);
        }
    }

    pub(crate) fn on_connection_added(
        &mut self,
        peer_id: NodeId,
        transport: Arc<dyn Transport>,
        temporary: bool,
    ) -> bool
    {
        if temporary {
            self.directory.update_idle_transports(transport);
            return false;
        }

        if peer_id == self.node_id {
            error!(
                target: LOG_TARGET,
                "Transport {} reported a connection to this node itself; refusing it",
                transport.id()
            );
            return true;
        }

        self.directory.remove_pending(&peer_id);

        if self.directory.insert_connection(peer_id, transport.clone()) {
            self.directory.remove_idle(transport.id());
            false
        } else {
            // An earlier transport already holds this peer; the reporting one should drop its
            // redundant connection.
            error!(
                target: LOG_TARGET,
                "Already connected to {}; won't keep a duplicate normal connection on transport {}",
                peer_id.short_str(),
                transport.id()
            );
            self.directory.update_idle_transports(transport);
            true
        }
    }

    pub(crate) fn on_connection_lost(&mut self, peer_id: NodeId, transport: Arc<dyn Transport>, temporary: bool) {
        self.directory.update_idle_transports(transport.clone());

        if temporary {
            return;
        }

        // A bootstrap connection may have had get_available_endpoint called on it but not yet
        // add, leaving a pending behind. In every other case this is a no-op.
        self.directory.remove_pending(&peer_id);

        let held_by = match self.directory.connection(&peer_id) {
            Some(current) => current.id(),
            None => return,
        };
        if held_by != transport.id() {
            error!(
                target: LOG_TARGET,
                "{} is connected via transport {} not {}",
                peer_id.short_str(),
                held_by,
                transport.id()
            );
            debug_assert!(false, "connection directory out of sync with transport callbacks");
        }

        self.directory.remove_connection(&peer_id);

        if peer_id == self.chosen_bootstrap_contact.id {
            self.chosen_bootstrap_contact = Contact::default();
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.connection_lost(peer_id);
        }
    }

    fn on_nat_detection_requested(
        &mut self,
        this_local_endpoint: Endpoint,
        peer_id: NodeId,
        peer_endpoint: Endpoint,
        peer_public_key: NodePublicKey,
    ) -> u16
    {
        match self.nat_type.get() {
            NatType::Unknown | NatType::Symmetric => return 0,
            NatType::Cone => {},
        }

        for transport in self.directory.unique_transports() {
            if transport.local_endpoint() != this_local_endpoint {
                let port = transport.external_endpoint().port();
                // The requesting peer watches for this probe arriving from a different port.
                transport.ping(peer_id, peer_endpoint, peer_public_key);
                return port;
            }
        }
        0
    }

    //---------------------------------- Shutdown ----------------------------------------------//

    fn all_transports(&self) -> Vec<Arc<dyn Transport>> {
        let mut transports: HashMap<_, _> = self
            .directory
            .unique_transports()
            .into_iter()
            .map(|t| (t.id(), t))
            .collect();
        for pending in self.directory.pendings() {
            transports
                .entry(pending.transport.id())
                .or_insert_with(|| pending.transport.clone());
        }
        for transport in self.directory.idle_transports() {
            transports.entry(transport.id()).or_insert_with(|| transport.clone());
        }
        transports.into_iter().map(|(_, t)| t).collect()
    }

    fn shutdown_all(&mut self) {
        let transports = self.all_transports();
        debug!(
            target: LOG_TARGET,
            "Closing {} transport(s) on shutdown",
            transports.len()
        );
        for pending in self.directory.drain_pendings() {
            pending.cancel_timer();
        }
        for transport in transports {
            transport.close();
        }
        self.directory.clear();
    }

    #[cfg(test)]
    pub(crate) fn chosen_bootstrap_contact(&self) -> &Contact {
        &self.chosen_bootstrap_contact
    }

    #[cfg(test)]
    pub(crate) fn directory(&self) -> &TransportDirectory {
        &self.directory
    }

    #[cfg(test)]
    pub(crate) fn directory_mut(&mut self) -> &mut TransportDirectory {
        &mut self.directory
    }

    #[cfg(test)]
    pub(crate) fn nat_type(&self) -> &SharedNatType {
        &self.nat_type
    }

    #[cfg(test)]
    pub(crate) fn set_chosen_bootstrap_contact(&mut self, contact: Contact) {
        self.chosen_bootstrap_contact = contact;
    }

    /// Drain and handle every queued transport event synchronously. Only meaningful for tests
    /// that drive the actor without spawning it.
    #[cfg(test)]
    pub(crate) fn process_queued_events(&mut self) {
        while let Ok(Some(event)) = self.event_rx.try_next() {
            self.handle_transport_event(event);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        endpoint::unspecified_endpoint,
        test_utils::{build_identity, stub_transport, StubTransportFactory, TestListener},
        transport::ConnectionInfo,
    };
    use std::convert::TryFrom;

    fn node_id(n: u16) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = (n >> 8) as u8;
        bytes[1] = n as u8;
        bytes[31] = 1;
        NodeId::try_from(&bytes[..]).unwrap()
    }

    fn test_manager(config: ConnectionManagerConfig) -> (ConnectionManager, Arc<TestListener>) {
        let (this_node_id, keypair) = build_identity();
        let listener = TestListener::new();
        let weak_listener: Weak<dyn ConnectionListener> = {
            let arc: Arc<dyn ConnectionListener> = listener.clone();
            Arc::downgrade(&arc)
        };
        let (_requester, manager) = ConnectionManager::channel(
            config,
            this_node_id,
            keypair,
            weak_listener,
            StubTransportFactory::new(),
            CancellationToken::new(),
        );
        (manager, listener)
    }

    fn contact_for(id: NodeId, endpoint: Endpoint) -> Contact {
        Contact::new(id, EndpointPair::new(endpoint, endpoint), Default::default())
    }

    fn info(state: ConnectionState, peer: Contact, seen_by_peer: Endpoint) -> ConnectionInfo {
        ConnectionInfo {
            state,
            peer_contact: peer,
            this_endpoint_as_seen_by_peer: seen_by_peer,
        }
    }

    #[test]
    fn starts_new_transports_up_to_the_cap_under_cone_nat() {
        let config = ConnectionManagerConfig {
            max_transports: 2,
            ..Default::default()
        };
        let (mut manager, _listener) = test_manager(config);
        manager.nat_type().set(NatType::Cone);

        let hint = EndpointPair::default();
        assert!(manager.should_start_new_transport(&hint));

        manager.directory_mut().insert_connection(node_id(1), stub_transport(1));
        assert!(manager.should_start_new_transport(&hint));
        manager.directory_mut().insert_connection(node_id(2), stub_transport(2));
        assert!(!manager.should_start_new_transport(&hint));
    }

    #[test]
    fn symmetric_nat_expands_to_the_connection_budget() {
        let config = ConnectionManagerConfig {
            max_transports: 2,
            max_connections_per_transport: 3,
            ..Default::default()
        };
        let (mut manager, _listener) = test_manager(config);
        manager.nat_type().set(NatType::Symmetric);

        let reachable = EndpointPair::new(unspecified_endpoint(), "1.2.3.4:5000".parse().unwrap());
        let budget = 2 * 3;
        for n in 0..budget {
            assert!(
                manager.should_start_new_transport(&reachable),
                "expected expansion at {} connections",
                n
            );
            manager
                .directory_mut()
                .insert_connection(node_id(n as u16 + 1), stub_transport(n as u64 + 1));
        }
        assert!(!manager.should_start_new_transport(&reachable));
    }

    #[test]
    fn symmetric_nat_does_not_expand_for_directly_reachable_local_hint() {
        let (manager, _listener) = test_manager(Default::default());
        manager.nat_type().set(NatType::Symmetric);

        // Peer gave a usable local address but no external one: rendezvous directly.
        let local_only = EndpointPair::new("192.168.1.9:4000".parse().unwrap(), unspecified_endpoint());
        assert!(!manager.should_start_new_transport(&local_only));

        // No usable address at all: a fresh transport is the only option.
        assert!(manager.should_start_new_transport(&EndpointPair::default()));
    }

    #[tokio::test]
    async fn endpoint_reservation_is_idempotent() {
        let (mut manager, _listener) = test_manager(Default::default());
        let transport = stub_transport(1);
        manager.directory_mut().update_idle_transports(transport.clone());

        let peer = node_id(9);
        let first = manager.get_available_endpoint(peer, Default::default()).unwrap();
        let second = manager.get_available_endpoint(peer, Default::default()).unwrap();
        assert_eq!(first.local, second.local);
        assert_eq!(manager.directory().pending_count(), 1);
    }

    #[tokio::test]
    async fn reserving_for_self_is_not_supported() {
        let (mut manager, _listener) = test_manager(Default::default());
        let own_id = manager.node_id;
        assert_eq!(
            manager.get_available_endpoint(own_id, Default::default()).unwrap_err(),
            ConnectionManagerError::OperationNotSupported
        );
    }

    #[tokio::test]
    async fn reserving_against_permanent_connection_reports_already_connected() {
        let (mut manager, _listener) = test_manager(Default::default());
        let peer = node_id(3);
        let transport = stub_transport(1);
        let peer_contact = contact_for(peer, "8.8.4.4:600".parse().unwrap());
        transport.insert_connection_info(peer, info(ConnectionState::Permanent, peer_contact, transport.local_endpoint()));
        manager.directory_mut().insert_connection(peer, transport);

        assert_eq!(
            manager.get_available_endpoint(peer, Default::default()).unwrap_err(),
            ConnectionManagerError::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn bootstrap_connection_is_shadowed_by_a_pending() {
        let (mut manager, _listener) = test_manager(Default::default());
        let peer = node_id(4);
        let transport = stub_transport(1);
        let peer_contact = contact_for(peer, "8.8.4.4:600".parse().unwrap());
        transport.insert_connection_info(
            peer,
            info(ConnectionState::Bootstrapping, peer_contact, transport.local_endpoint()),
        );
        manager.directory_mut().insert_connection(peer, transport.clone());

        let pair = manager.get_available_endpoint(peer, Default::default()).unwrap();
        assert_eq!(pair.local, transport.local_endpoint());
        // The bootstrap entry remains and is shadowed by the reservation.
        assert_eq!(manager.directory().connection_count(), 1);
        assert_eq!(manager.directory().pending_count(), 1);
    }

    #[test]
    fn duplicate_normal_connection_is_refused() {
        let (mut manager, _listener) = test_manager(Default::default());
        let peer = node_id(5);
        let winner = stub_transport(1);
        let loser = stub_transport(2);

        assert!(!manager.on_connection_added(peer, winner.clone(), false));
        assert!(manager.on_connection_added(peer, loser, false));
        assert_eq!(manager.directory().connection(&peer).unwrap().id(), winner.id());
        assert_eq!(manager.directory().connection_count(), 1);
    }

    #[test]
    fn temporary_connection_only_refreshes_the_idle_set() {
        let (mut manager, _listener) = test_manager(Default::default());
        let peer = node_id(6);
        let transport = stub_transport(1);
        assert!(!manager.on_connection_added(peer, transport, true));
        assert_eq!(manager.directory().connection_count(), 0);
        assert_eq!(manager.directory().idle_count(), 1);
    }

    #[test]
    fn losing_the_bootstrap_peer_clears_the_chosen_contact_and_notifies_once() {
        let (mut manager, listener) = test_manager(Default::default());
        let peer = node_id(7);
        let transport = stub_transport(1);
        manager.directory_mut().insert_connection(peer, transport.clone());
        manager.set_chosen_bootstrap_contact(contact_for(peer, "8.8.4.4:600".parse().unwrap()));

        manager.on_connection_lost(peer, transport.clone(), false);
        assert!(!manager.chosen_bootstrap_contact().id.is_valid());
        assert_eq!(listener.lost(), vec![peer]);

        // A repeat for the same peer finds nothing and stays silent.
        manager.on_connection_lost(peer, transport, false);
        assert_eq!(listener.lost(), vec![peer]);
    }

    #[test]
    fn temporary_loss_is_not_reported_to_the_listener() {
        let (mut manager, listener) = test_manager(Default::default());
        let peer = node_id(8);
        let transport = stub_transport(1);
        manager.directory_mut().insert_connection(peer, transport.clone());
        manager.on_connection_lost(peer, transport, true);
        assert!(listener.lost().is_empty());
        assert_eq!(manager.directory().connection_count(), 1);
    }

    #[test]
    fn nat_detection_uses_a_transport_on_a_different_endpoint() {
        let (mut manager, _listener) = test_manager(Default::default());
        manager.nat_type().set(NatType::Cone);

        let requesting_peer = node_id(9);
        let first = stub_transport(1);
        let second = stub_transport(2);
        second.set_external_endpoint("9.9.9.9:4100".parse().unwrap());
        manager.directory_mut().insert_connection(node_id(10), first.clone());
        manager.directory_mut().insert_connection(node_id(11), second.clone());

        let peer_endpoint: Endpoint = "7.7.7.7:7000".parse().unwrap();
        let port = manager.on_nat_detection_requested(
            first.local_endpoint(),
            requesting_peer,
            peer_endpoint,
            Default::default(),
        );
        assert_eq!(port, 4100);
        assert_eq!(second.pings(), vec![(requesting_peer, peer_endpoint)]);
        assert!(first.pings().is_empty());
    }

    #[test]
    fn nat_detection_is_declined_under_unknown_or_symmetric_nat() {
        let (mut manager, _listener) = test_manager(Default::default());
        let transport = stub_transport(1);
        manager.directory_mut().insert_connection(node_id(1), transport);

        for nat in [NatType::Unknown, NatType::Symmetric] {
            manager.nat_type().set(nat);
            let port = manager.on_nat_detection_requested(
                "127.0.0.1:1".parse().unwrap(),
                node_id(2),
                "7.7.7.7:7000".parse().unwrap(),
                Default::default(),
            );
            assert_eq!(port, 0);
        }
    }

    #[test]
    fn bootstrap_candidates_favor_public_peers_and_infer_the_external_address() {
        let (mut manager, _listener) = test_manager(Default::default());
        let seen: Endpoint = "100.70.50.40:9000".parse().unwrap();

        let public1 = stub_transport(1);
        let peer1 = node_id(1);
        public1.insert_connection_info(
            peer1,
            info(
                ConnectionState::Permanent,
                contact_for(peer1, "8.8.8.8:1111".parse().unwrap()),
                seen,
            ),
        );
        let public2 = stub_transport(2);
        let peer2 = node_id(2);
        public2.insert_connection_info(
            peer2,
            info(
                ConnectionState::Permanent,
                contact_for(peer2, "9.9.9.9:2222".parse().unwrap()),
                seen,
            ),
        );
        let private = stub_transport(3);
        let peer3 = node_id(3);
        private.insert_connection_info(
            peer3,
            info(
                ConnectionState::Permanent,
                contact_for(peer3, "192.168.0.20:3333".parse().unwrap()),
                seen,
            ),
        );

        manager.directory_mut().insert_connection(peer1, public1);
        manager.directory_mut().insert_connection(peer2, public2);
        manager.directory_mut().insert_connection(peer3, private);

        let (candidates, external) = manager.get_bootstrap_endpoints();
        assert_eq!(candidates.len(), 3);
        // Public peers come first regardless of shuffle order; the private one is always last.
        assert_eq!(candidates[2].id, peer3);
        assert_eq!(external, Some(seen.ip()));
    }

    #[test]
    fn inconsistent_external_observations_yield_no_inferred_address() {
        let (mut manager, _listener) = test_manager(Default::default());

        let first = stub_transport(1);
        let peer1 = node_id(1);
        first.insert_connection_info(
            peer1,
            info(
                ConnectionState::Permanent,
                contact_for(peer1, "8.8.8.8:1111".parse().unwrap()),
                "100.70.50.40:9000".parse().unwrap(),
            ),
        );
        let second = stub_transport(2);
        let peer2 = node_id(2);
        second.insert_connection_info(
            peer2,
            info(
                ConnectionState::Permanent,
                contact_for(peer2, "9.9.9.9:2222".parse().unwrap()),
                "100.70.50.41:9000".parse().unwrap(),
            ),
        );

        manager.directory_mut().insert_connection(peer1, first);
        manager.directory_mut().insert_connection(peer2, second);

        let (candidates, external) = manager.get_bootstrap_endpoints();
        assert_eq!(candidates.len(), 2);
        assert_eq!(external, None);
    }
}
