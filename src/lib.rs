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

//! Connection management for a reliable-UDP peer-to-peer stack.
//!
//! The connection manager sits above per-socket reliable-UDP transports and below an
//! application that exchanges encrypted messages with peers identified by node ids. It
//! bootstraps transports off candidate lists, tracks live and in-progress connections,
//! chooses which local transport hosts each outbound attempt, enforces NAT-aware limits on
//! how many transports exist, and delivers message and connection-loss events to a single
//! application listener.

pub mod connection_manager;
pub mod contact;
pub mod crypto;
pub mod endpoint;
pub mod nat;
pub mod node_id;
pub mod test_utils;
pub mod transport;
mod utils;

pub use self::{
    connection_manager::{
        ConnectionListener,
        ConnectionManager,
        ConnectionManagerConfig,
        ConnectionManagerError,
        ConnectionManagerRequester,
    },
    contact::Contact,
    endpoint::{Endpoint, EndpointPair},
    nat::{NatType, SharedNatType},
    node_id::NodeId,
};
