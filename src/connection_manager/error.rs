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

use thiserror::Error;

/// Errors surfaced by the connection manager. These are structured values returned through
/// replies, never panics; callbacks that arrive for unknown peers or stale transports are
/// logged and dropped instead of producing one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionManagerError {
    #[error("An invalid parameter was supplied")]
    InvalidParameter,
    #[error("At least one bootstrap contact must be provided")]
    NoBootstrapEndpoints,
    #[error("Failed to determine a local address")]
    FailedToGetLocalAddress,
    #[error("No bootstrap candidate accepted the connection")]
    FailedToBootstrap,
    #[error("A managed connection to this peer already exists")]
    AlreadyConnected,
    #[error("A connection attempt to this peer is already in progress")]
    ConnectionAlreadyInProgress,
    #[error("Not connected to this peer")]
    NotConnected,
    #[error("The operation is not supported for this peer")]
    OperationNotSupported,
    #[error("No transport is available to host the connection attempt")]
    NoAvailableTransports,
    #[error("Message encryption failed")]
    MessageEncryptionFailed,
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("The connection manager is no longer running")]
    ActorDisconnected,
    #[error("The connection manager dropped the reply to this request")]
    ResponseCancelled,
}
