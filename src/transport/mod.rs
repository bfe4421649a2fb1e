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

//! The seam between the connection manager and the per-socket reliable-UDP transport.
//!
//! A [`Transport`] owns one UDP multiplexer and a bounded set of connections. The connection
//! manager never touches sockets; it drives transports through this trait and receives their
//! callbacks as [`TransportEvent`] values on a channel. Events that the transport needs an
//! answer to (duplicate detection, NAT port queries) carry a oneshot sender for the reply.

use crate::{
    connection_manager::ConnectionManagerError,
    contact::Contact,
    crypto::NodePublicKey,
    endpoint::Endpoint,
    node_id::NodeId,
};
use bytes::Bytes;
use futures::{channel::{mpsc, oneshot}, future::BoxFuture};
use std::{fmt, sync::Arc};

/// Identity of a transport instance. Transports are compared and indexed by this id, never by
/// address or endpoint, since endpoints can be rebound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// State of a single connection owned by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Established during bootstrap; not yet requested by the application.
    Bootstrapping,
    /// Established but the peer has not yet been validated.
    Unvalidated,
    /// A fully managed connection.
    Permanent,
    /// A short-lived probe connection that never enters the managed directory.
    Temporary,
}

impl ConnectionState {
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self, ConnectionState::Bootstrapping)
    }

    pub fn is_unvalidated(&self) -> bool {
        matches!(self, ConnectionState::Unvalidated)
    }
}

/// A snapshot of one connection: its state, the peer it reaches, and the endpoint this node
/// appears as from the peer's side of the socket.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub peer_contact: Contact,
    pub this_endpoint_as_seen_by_peer: Endpoint,
}

/// Everything a transport needs to run its bootstrap handshake: the candidate list, this node's
/// identity, where to bind, and the channel its callbacks are delivered on for the rest of its
/// life.
pub struct BootstrapRequest {
    pub bootstrap_list: Vec<Contact>,
    pub this_node_id: NodeId,
    pub public_key: NodePublicKey,
    pub local_endpoint: Endpoint,
    pub bootstrap_off_existing: bool,
    pub event_tx: TransportEventTx,
}

pub type TransportEventTx = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventRx = mpsc::UnboundedReceiver<TransportEvent>;

/// Callbacks from transports (and from the manager's own timers and bootstrap tasks),
/// serialized into the connection manager's event loop.
pub enum TransportEvent {
    /// A connection reached a usable state on `transport`. For non-temporary connections the
    /// transport must learn whether it lost a duplicate race; the answer arrives on
    /// `is_duplicate_reply` and a `true` means the reporting transport should drop the
    /// redundant connection.
    ConnectionAdded {
        peer_id: NodeId,
        transport: Arc<dyn Transport>,
        temporary: bool,
        is_duplicate_reply: oneshot::Sender<bool>,
    },
    /// A connection on `transport` closed or failed.
    ConnectionLost {
        peer_id: NodeId,
        transport: Arc<dyn Transport>,
        temporary: bool,
    },
    /// An inbound message from an established connection. The payload is still encrypted.
    MessageReceived { peer_id: NodeId, message: Bytes },
    /// A peer is probing our NAT behavior and wants to see a different external port of ours.
    NatDetectionRequested {
        this_local_endpoint: Endpoint,
        peer_id: NodeId,
        peer_endpoint: Endpoint,
        peer_public_key: NodePublicKey,
        external_port_reply: oneshot::Sender<u16>,
    },
    /// A pending connection's reservation timer expired. The token identifies the exact
    /// reservation so a newer one for the same peer is left alone.
    PendingTimeout { peer_id: NodeId, token: u64 },
    /// A transport finished (or failed) its bootstrap handshake.
    Bootstrapped {
        transport: Arc<dyn Transport>,
        result: Result<Contact, ConnectionManagerError>,
        inferred_external: Option<std::net::IpAddr>,
        reply: Option<oneshot::Sender<Result<(Contact, Contact), ConnectionManagerError>>>,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TransportEvent::*;
        match self {
            ConnectionAdded {
                peer_id,
                transport,
                temporary,
                ..
            } => write!(
                f,
                "ConnectionAdded({}, {}, temporary={})",
                peer_id.short_str(),
                transport.id(),
                temporary
            ),
            ConnectionLost {
                peer_id,
                transport,
                temporary,
            } => write!(
                f,
                "ConnectionLost({}, {}, temporary={})",
                peer_id.short_str(),
                transport.id(),
                temporary
            ),
            MessageReceived { peer_id, message } => {
                write!(f, "MessageReceived({}, {} bytes)", peer_id.short_str(), message.len())
            },
            NatDetectionRequested { peer_id, .. } => {
                write!(f, "NatDetectionRequested({})", peer_id.short_str())
            },
            PendingTimeout { peer_id, token } => {
                write!(f, "PendingTimeout({}, token={})", peer_id.short_str(), token)
            },
            Bootstrapped { transport, result, .. } => {
                write!(f, "Bootstrapped({}, ok={})", transport.id(), result.is_ok())
            },
        }
    }
}

/// One reliable-UDP socket and the connections multiplexed over it. Implementations are the
/// per-socket transport of the stack; tests use the in-memory one in `test_utils`.
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn local_endpoint(&self) -> Endpoint;

    /// The externally visible endpoint, or an unspecified endpoint while it is unknown.
    fn external_endpoint(&self) -> Endpoint;

    /// Install a guessed external endpoint when NAT detection could not produce one.
    fn set_best_guess_external_endpoint(&self, endpoint: Endpoint);

    /// The endpoint of ours that `peer_id` observes on its side of the socket.
    fn this_endpoint_as_seen_by_peer(&self, peer_id: &NodeId) -> Option<Endpoint>;

    /// True when the transport hosts no normal connections.
    fn is_idle(&self) -> bool;

    /// True when the transport is open and can host another connection.
    fn is_available(&self) -> bool;

    fn normal_connections_count(&self) -> usize;

    fn connection_info(&self, peer_id: &NodeId) -> Option<ConnectionInfo>;

    /// Run the bootstrap handshake against the request's candidate list. Resolves with the
    /// contact of the first candidate that accepted us. All of this transport's future
    /// callbacks are delivered on the request's event channel.
    fn bootstrap(&self, request: BootstrapRequest)
        -> BoxFuture<'static, Result<Contact, ConnectionManagerError>>;

    /// Start a rendezvous connect to the peer. The outcome is delivered on `reply`.
    fn connect(&self, peer: Contact, reply: oneshot::Sender<Result<(), ConnectionManagerError>>);

    /// Close the connection to `peer_id`, if any. Completion of the returned future only means
    /// the close was processed; the `ConnectionLost` callback carries the actual removal.
    fn close_connection(&self, peer_id: NodeId) -> BoxFuture<'static, ()>;

    /// Queue `message` for the connection to `peer_id`. Returns `None` when the transport has
    /// no such connection (the send was not accepted), otherwise a future resolving with the
    /// delivery result.
    fn send(
        &self,
        peer_id: &NodeId,
        message: Bytes,
    ) -> Option<BoxFuture<'static, Result<(), ConnectionManagerError>>>;

    /// Fire-and-forget reachability probe used during NAT detection.
    fn ping(&self, peer_id: NodeId, endpoint: Endpoint, public_key: NodePublicKey);

    /// Test hook: simulated packet loss, forwarded to the multiplexer.
    fn set_debug_packet_loss_rate(&self, constant: f64, bursty: f64);

    /// Close the transport and release its socket. Idempotent.
    fn close(&self);
}

/// Creates transports on demand. The application implements this over the real reliable-UDP
/// socket; tests plug in the in-memory factory.
pub trait TransportFactory: Send + Sync {
    fn create(&self, nat_type: crate::nat::SharedNatType) -> Arc<dyn Transport>;
}
