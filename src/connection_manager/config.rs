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

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionManagerConfig {
    /// Soft cap on the number of transports under non-symmetric NAT. Under symmetric NAT the
    /// effective cap becomes `max_transports * max_connections_per_transport` total
    /// connections, since each peer can require its own local port. Default: 8
    pub max_transports: usize,
    /// Maximum number of connections a single transport will host. Default: 50
    pub max_connections_per_transport: usize,
    /// How long an endpoint reservation made by `get_available_endpoint` stays alive waiting
    /// for the matching `add`. Default: 10s
    pub rendezvous_connect_timeout: Duration,
    /// Encrypt outbound messages to the peer's public key and decrypt inbound ones. Turning
    /// this off is a test hook only. Default: true
    pub encrypt_messages: bool,
    /// Buffer size of the request channel between `ConnectionManagerRequester` and the actor.
    /// Senders back-pressure once this many requests are queued. Default: 64
    pub request_channel_size: usize,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_transports: 8,
            max_connections_per_transport: 50,
            rendezvous_connect_timeout: Duration::from_secs(10),
            encrypt_messages: true,
            request_channel_size: 64,
        }
    }
}
