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

use super::error::ConnectionManagerError;
use crate::{contact::Contact, endpoint::{Endpoint, EndpointPair}, node_id::NodeId};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::fmt;

/// Requests accepted by the connection manager actor.
pub enum ConnectionManagerRequest {
    Bootstrap {
        bootstrap_list: Vec<Contact>,
        local_endpoint_hint: Option<Endpoint>,
        reply: oneshot::Sender<Result<(Contact, Contact), ConnectionManagerError>>,
    },
    GetAvailableEndpoint {
        peer_id: NodeId,
        peer_hint: EndpointPair,
        reply: oneshot::Sender<Result<EndpointPair, ConnectionManagerError>>,
    },
    AddPeer {
        peer: Contact,
        reply: oneshot::Sender<Result<(), ConnectionManagerError>>,
    },
    RemovePeer {
        peer_id: NodeId,
    },
    SendMessage {
        peer_id: NodeId,
        message: Bytes,
        reply: oneshot::Sender<Result<(), ConnectionManagerError>>,
    },
    SetDebugPacketLossRate {
        constant: f64,
        bursty: f64,
    },
}

impl fmt::Debug for ConnectionManagerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ConnectionManagerRequest::*;
        match self {
            Bootstrap { bootstrap_list, .. } => {
                write!(f, "Bootstrap({} candidate(s))", bootstrap_list.len())
            },
            GetAvailableEndpoint { peer_id, .. } => {
                write!(f, "GetAvailableEndpoint({})", peer_id.short_str())
            },
            AddPeer { peer, .. } => write!(f, "AddPeer({})", peer.id.short_str()),
            RemovePeer { peer_id } => write!(f, "RemovePeer({})", peer_id.short_str()),
            SendMessage { peer_id, message, .. } => {
                write!(f, "SendMessage({}, {} bytes)", peer_id.short_str(), message.len())
            },
            SetDebugPacketLossRate { constant, bursty } => {
                write!(f, "SetDebugPacketLossRate({}, {})", constant, bursty)
            },
        }
    }
}

/// Cloneable handle for talking to the connection manager actor. All methods send a request
/// over the actor's channel and await the reply.
#[derive(Clone)]
pub struct ConnectionManagerRequester {
    sender: mpsc::Sender<ConnectionManagerRequest>,
}

impl ConnectionManagerRequester {
    pub fn new(sender: mpsc::Sender<ConnectionManagerRequest>) -> Self {
        Self { sender }
    }

    /// Discover a first working peer from `bootstrap_list` on a fresh transport. Returns this
    /// node's own contact (with the new transport's endpoints) and the contact that accepted
    /// us.
    pub async fn bootstrap(
        &mut self,
        bootstrap_list: Vec<Contact>,
        local_endpoint_hint: Option<Endpoint>,
    ) -> Result<(Contact, Contact), ConnectionManagerError>
    {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(ConnectionManagerRequest::Bootstrap {
                bootstrap_list,
                local_endpoint_hint,
                reply,
            })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ResponseCancelled)?
    }

    /// Reserve an endpoint pair on one of our transports for an outbound attempt to `peer_id`.
    /// Share the returned pair with the peer out-of-band, then call [`add`](Self::add).
    /// Calling this again for the same peer returns the same reservation.
    pub async fn get_available_endpoint(
        &mut self,
        peer_id: NodeId,
        peer_hint: EndpointPair,
    ) -> Result<EndpointPair, ConnectionManagerError>
    {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(ConnectionManagerRequest::GetAvailableEndpoint {
                peer_id,
                peer_hint,
                reply,
            })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ResponseCancelled)?
    }

    /// Complete the rendezvous for a peer previously reserved with
    /// [`get_available_endpoint`](Self::get_available_endpoint). Resolves when the connection
    /// is established or the attempt fails.
    pub async fn add(&mut self, peer: Contact) -> Result<(), ConnectionManagerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(ConnectionManagerRequest::AddPeer { peer, reply })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ResponseCancelled)?
    }

    /// Close the managed connection to `peer_id`, if any. The listener observes the loss via
    /// `connection_lost`.
    pub async fn remove(&mut self, peer_id: NodeId) -> Result<(), ConnectionManagerError> {
        self.sender
            .send(ConnectionManagerRequest::RemovePeer { peer_id })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        Ok(())
    }

    /// Send `message` to a connected peer. The payload is encrypted to the peer's public key
    /// unless encryption is disabled in the config.
    pub async fn send(&mut self, peer_id: NodeId, message: Bytes) -> Result<(), ConnectionManagerError> {
        let (reply, reply_rx) = oneshot::channel();
        self.sender
            .send(ConnectionManagerRequest::SendMessage {
                peer_id,
                message,
                reply,
            })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        reply_rx.await.map_err(|_| ConnectionManagerError::ResponseCancelled)?
    }

    /// Test hook: simulated packet loss, forwarded to every live transport and applied to
    /// future ones.
    pub async fn set_debug_packet_loss_rate(
        &mut self,
        constant: f64,
        bursty: f64,
    ) -> Result<(), ConnectionManagerError>
    {
        self.sender
            .send(ConnectionManagerRequest::SetDebugPacketLossRate { constant, bursty })
            .await
            .map_err(|_| ConnectionManagerError::ActorDisconnected)?;
        Ok(())
    }
}
