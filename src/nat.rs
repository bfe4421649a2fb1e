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
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Classification of the local network's address translation. Symmetric NATs allocate a fresh
/// external mapping per remote peer, which changes how many local transports this node needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NatType {
    Unknown = 0,
    Symmetric = 1,
    Cone = 2,
}

impl NatType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => NatType::Symmetric,
            2 => NatType::Cone,
            _ => NatType::Unknown,
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The process-wide NAT classification, shared between the connection manager and every
/// transport. Transports store it during bootstrap; the manager only loads it.
#[derive(Clone, Debug)]
pub struct SharedNatType(Arc<AtomicU8>);

impl SharedNatType {
    pub fn new(nat_type: NatType) -> Self {
        Self(Arc::new(AtomicU8::new(nat_type as u8)))
    }

    pub fn get(&self) -> NatType {
        NatType::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, nat_type: NatType) {
        self.0.store(nat_type as u8, Ordering::Relaxed);
    }
}

impl Default for SharedNatType {
    fn default() -> Self {
        Self::new(NatType::Unknown)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_updates_are_visible_through_clones() {
        let nat = SharedNatType::default();
        let clone = nat.clone();
        assert_eq!(clone.get(), NatType::Unknown);
        nat.set(NatType::Symmetric);
        assert_eq!(clone.get(), NatType::Symmetric);
        clone.set(NatType::Cone);
        assert_eq!(nat.get(), NatType::Cone);
    }
}
