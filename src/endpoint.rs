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

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

/// A UDP endpoint: IP address plus port.
pub type Endpoint = SocketAddr;

/// Returns an endpoint that is guaranteed invalid (unspecified address, port 0). Used as the
/// placeholder value wherever an endpoint is not yet known.
pub fn unspecified_endpoint() -> Endpoint {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// An endpoint is usable when both its address and port are specified.
pub fn is_valid_endpoint(endpoint: &Endpoint) -> bool {
    !endpoint.ip().is_unspecified() && endpoint.port() != 0
}

/// True if the address belongs to a network that is not directly reachable from the public
/// internet (RFC1918 ranges, loopback and link-local for IPv4; unique-local and loopback for
/// IPv6). Peers on such addresses are poor bootstrap candidates for inferring our external
/// address.
pub fn on_private_network(endpoint: &Endpoint) -> bool {
    match endpoint.ip() {
        IpAddr::V4(ip) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// The pair of endpoints a node advertises for a single transport: the locally bound endpoint
/// and, when known, the externally visible (NAT-mapped) one. The external endpoint stays
/// unspecified while the NAT type is unknown or symmetric.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub local: Endpoint,
    pub external: Endpoint,
}

impl EndpointPair {
    pub fn new(local: Endpoint, external: Endpoint) -> Self {
        Self { local, external }
    }

    /// A pair with both endpoints unspecified.
    pub fn unspecified() -> Self {
        Self {
            local: unspecified_endpoint(),
            external: unspecified_endpoint(),
        }
    }

    pub fn has_external(&self) -> bool {
        is_valid_endpoint(&self.external)
    }
}

impl Default for EndpointPair {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Debug for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointPair(local={}, external={})", self.local, self.external)
    }
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.local, self.external)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validity() {
        assert!(!is_valid_endpoint(&unspecified_endpoint()));
        assert!(!is_valid_endpoint(&"0.0.0.0:5000".parse().unwrap()));
        assert!(!is_valid_endpoint(&"192.168.0.1:0".parse().unwrap()));
        assert!(is_valid_endpoint(&"192.168.0.1:5000".parse().unwrap()));
    }

    #[test]
    fn private_network_detection() {
        assert!(on_private_network(&"10.0.0.1:1234".parse().unwrap()));
        assert!(on_private_network(&"172.16.5.5:1234".parse().unwrap()));
        assert!(on_private_network(&"192.168.1.1:1234".parse().unwrap()));
        assert!(on_private_network(&"127.0.0.1:1234".parse().unwrap()));
        assert!(on_private_network(&"[fc00::1]:1234".parse().unwrap()));
        assert!(!on_private_network(&"8.8.8.8:53".parse().unwrap()));
        assert!(!on_private_network(&"[2001:4860:4860::8888]:53".parse().unwrap()));
    }

    #[test]
    fn default_pair_is_unspecified() {
        let pair = EndpointPair::default();
        assert!(!is_valid_endpoint(&pair.local));
        assert!(!pair.has_external());
    }
}
