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

use crate::{
    connection_manager::{
        ConnectionListener,
        ConnectionManager,
        ConnectionManagerConfig,
        ConnectionManagerError,
    },
    contact::Contact,
    endpoint::{Endpoint, EndpointPair},
    node_id::NodeId,
    test_utils::{build_identity, build_node, stub_transport, MemoryNetwork, StubTransportFactory, TestListener, TestNode},
};
use bytes::Bytes;
use std::{
    convert::TryFrom,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time;
use tokio_util::sync::CancellationToken;

async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where F: Fn() -> bool {
    let deadline = time::Instant::now() + timeout;
    while time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn peer_node_id(n: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    bytes[31] = 0xaa;
    NodeId::try_from(&bytes[..]).unwrap()
}

fn localhost(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1".parse().unwrap(), port)
}

fn direct_manager(config: ConnectionManagerConfig) -> (ConnectionManager, Arc<TestListener>) {
    let (node_id, keypair) = build_identity();
    let listener = TestListener::new();
    let weak_listener: Weak<dyn ConnectionListener> = {
        let arc: Arc<dyn ConnectionListener> = listener.clone();
        Arc::downgrade(&arc)
    };
    let (_requester, manager) = ConnectionManager::channel(
        config,
        node_id,
        keypair,
        weak_listener,
        StubTransportFactory::new(),
        CancellationToken::new(),
    );
    (manager, listener)
}

/// Bootstrap two fresh nodes off each other (the zero-state pair).
async fn bootstrap_pair(network: Arc<MemoryNetwork>, port_a: u16, port_b: u16) -> (TestNode, TestNode) {
    let a = build_node(network.clone(), Default::default());
    let b = build_node(network, Default::default());
    let (result_a, result_b) = {
        let mut requester_a = a.requester.clone();
        let mut requester_b = b.requester.clone();
        tokio::join!(
            requester_a.bootstrap(vec![b.seed_contact(port_b)], Some(localhost(port_a))),
            requester_b.bootstrap(vec![a.seed_contact(port_a)], Some(localhost(port_b))),
        )
    };
    result_a.expect("node A failed to bootstrap");
    result_b.expect("node B failed to bootstrap");
    (a, b)
}

fn contact_of(node: &TestNode, endpoint_pair: EndpointPair) -> Contact {
    Contact::new(node.node_id, endpoint_pair, *node.keypair.public_key())
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_bootstrap_exchanges_messages() {
    let network = MemoryNetwork::new();
    let a = build_node(network.clone(), Default::default());
    let b = build_node(network, Default::default());

    let (result_a, result_b) = {
        let mut requester_a = a.requester.clone();
        let mut requester_b = b.requester.clone();
        tokio::join!(
            requester_a.bootstrap(vec![b.seed_contact(27002)], Some(localhost(27001))),
            requester_b.bootstrap(vec![a.seed_contact(27001)], Some(localhost(27002))),
        )
    };

    let (own_a, chosen_a) = result_a.unwrap();
    let (_own_b, chosen_b) = result_b.unwrap();
    assert_eq!(own_a.id, a.node_id);
    assert_eq!(chosen_a.id, b.node_id);
    assert_eq!(chosen_b.id, a.node_id);

    let payload = Bytes::from_static(b"ping over rudp");
    a.requester.clone().send(b.node_id, payload.clone()).await.unwrap();

    let expected_sender = a.node_id;
    let expected = payload.clone();
    let received = wait_until(
        move || {
            b.listener
                .messages()
                .iter()
                .any(|(id, message)| *id == expected_sender && *message == expected)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(received, "node B never received the message");

    assert!(a.listener.messages().is_empty());
    assert!(a.listener.lost().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_with_empty_list_is_rejected() {
    let network = MemoryNetwork::new();
    let node = build_node(network, Default::default());
    let result = node.requester.clone().bootstrap(Vec::new(), Some(localhost(27010))).await;
    assert_eq!(result.unwrap_err(), ConnectionManagerError::NoBootstrapEndpoints);
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_with_unreachable_candidates_fails() {
    let network = MemoryNetwork::new();
    let node = build_node(network, Default::default());
    let (ghost_id, ghost_keys) = build_identity();
    let ghost = Contact::new(
        ghost_id,
        EndpointPair::new(localhost(27999), localhost(27999)),
        *ghost_keys.public_key(),
    );
    let result = node.requester.clone().bootstrap(vec![ghost], Some(localhost(27011))).await;
    assert_eq!(result.unwrap_err(), ConnectionManagerError::FailedToBootstrap);
}

#[tokio::test(flavor = "multi_thread")]
async fn self_targeted_operations_are_rejected() {
    let network = MemoryNetwork::new();
    let node = build_node(network, Default::default());
    let mut requester = node.requester.clone();

    let self_contact = contact_of(&node, EndpointPair::new(localhost(1000), localhost(1000)));
    assert_eq!(
        requester.add(self_contact).await.unwrap_err(),
        ConnectionManagerError::OperationNotSupported
    );
    assert_eq!(
        requester.send(node.node_id, Bytes::from_static(b"loop")).await.unwrap_err(),
        ConnectionManagerError::OperationNotSupported
    );
    assert_eq!(
        requester
            .get_available_endpoint(node.node_id, Default::default())
            .await
            .unwrap_err(),
        ConnectionManagerError::OperationNotSupported
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn add_without_reservation_is_not_supported() {
    let network = MemoryNetwork::new();
    let (a, _b) = bootstrap_pair(network, 27021, 27022).await;
    let (stranger_id, stranger_keys) = build_identity();
    let stranger = Contact::new(
        stranger_id,
        EndpointPair::new(localhost(28000), localhost(28000)),
        *stranger_keys.public_key(),
    );
    assert_eq!(
        a.requester.clone().add(stranger).await.unwrap_err(),
        ConnectionManagerError::OperationNotSupported
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn add_after_bootstrap_completes_immediately() {
    let network = MemoryNetwork::new();
    let (a, b) = bootstrap_pair(network, 27031, 27032).await;

    // The bootstrap connection is shadowed by a fresh reservation, then add succeeds against
    // the same transport without another rendezvous.
    let pair = a
        .requester
        .clone()
        .get_available_endpoint(b.node_id, Default::default())
        .await
        .unwrap();
    assert!(crate::endpoint::is_valid_endpoint(&pair.local));

    let b_pair = b
        .requester
        .clone()
        .get_available_endpoint(a.node_id, Default::default())
        .await
        .unwrap();
    a.requester
        .clone()
        .add(contact_of(&b, b_pair))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rendezvous_connect_between_indirect_peers() {
    let network = MemoryNetwork::new();
    // B and C know only the seed node S.
    let (s, b) = bootstrap_pair(network.clone(), 27041, 27042).await;
    let c = build_node(network, Default::default());
    c.requester
        .clone()
        .bootstrap(vec![s.seed_contact(27041)], Some(localhost(27043)))
        .await
        .unwrap();

    let b_pair = b
        .requester
        .clone()
        .get_available_endpoint(c.node_id, Default::default())
        .await
        .unwrap();
    let c_pair = c
        .requester
        .clone()
        .get_available_endpoint(b.node_id, Default::default())
        .await
        .unwrap();

    let (add_b, add_c) = tokio::join!(
        a_clone_add(&b, contact_of(&c, c_pair)),
        a_clone_add(&c, contact_of(&b, b_pair)),
    );
    add_b.unwrap();
    add_c.unwrap();

    let payload = Bytes::from_static(b"across the rendezvous");
    b.requester.clone().send(c.node_id, payload.clone()).await.unwrap();
    let from = b.node_id;
    let expected = payload;
    assert!(
        wait_until(
            move || c.listener.messages().iter().any(|(id, m)| *id == from && *m == expected),
            Duration::from_secs(5)
        )
        .await
    );
}

async fn a_clone_add(node: &TestNode, contact: Contact) -> Result<(), ConnectionManagerError> {
    node.requester.clone().add(contact).await
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_add_reports_connection_in_progress() {
    let network = MemoryNetwork::new();
    let (s, b) = bootstrap_pair(network.clone(), 27051, 27052).await;
    let c = build_node(network, Default::default());
    c.requester
        .clone()
        .bootstrap(vec![s.seed_contact(27051)], Some(localhost(27053)))
        .await
        .unwrap();

    let b_pair = b
        .requester
        .clone()
        .get_available_endpoint(c.node_id, Default::default())
        .await
        .unwrap();
    let c_pair = c
        .requester
        .clone()
        .get_available_endpoint(b.node_id, Default::default())
        .await
        .unwrap();

    let c_contact = contact_of(&c, c_pair);
    let first = tokio::spawn({
        let b = b.requester.clone();
        let contact = c_contact.clone();
        async move {
            let mut requester = b;
            requester.add(contact).await
        }
    });
    // Give the first add a moment to mark the attempt as connecting. The rendezvous itself
    // cannot complete until the peer adds too, so the window stays open.
    time::sleep(Duration::from_millis(20)).await;
    let second = b.requester.clone().add(c_contact).await;
    assert_eq!(second.unwrap_err(), ConnectionManagerError::ConnectionAlreadyInProgress);

    // The first attempt completes normally once the peer adds too.
    c.requester.clone().add(contact_of(&b, b_pair)).await.unwrap();
    first.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn losing_the_bootstrap_peer_notifies_the_listener_once() {
    let network = MemoryNetwork::new();
    let (a, b) = bootstrap_pair(network, 27061, 27062).await;

    b.requester.clone().remove(a.node_id).await.unwrap();

    let lost_peer = b.node_id;
    let a_listener = a.listener.clone();
    assert!(
        wait_until(
            move || a_listener.lost() == vec![lost_peer],
            Duration::from_secs(5)
        )
        .await
    );
    // No duplicate notification shows up afterwards.
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.listener.lost(), vec![b.node_id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_of_an_absent_peer_is_a_noop() {
    let network = MemoryNetwork::new();
    let (a, b) = bootstrap_pair(network, 27071, 27072).await;

    let absent = peer_node_id(42);
    a.requester.clone().remove(absent).await.unwrap();
    a.requester.clone().remove(absent).await.unwrap();

    // The node still works.
    a.requester
        .clone()
        .send(b.node_id, Bytes::from_static(b"still alive"))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn send_to_unknown_peer_reports_not_connected() {
    let network = MemoryNetwork::new();
    let (a, _b) = bootstrap_pair(network, 27081, 27082).await;
    let result = a
        .requester
        .clone()
        .send(peer_node_id(77), Bytes::from_static(b"into the void"))
        .await;
    assert_eq!(result.unwrap_err(), ConnectionManagerError::NotConnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_every_transport() {
    let network = MemoryNetwork::new();
    let (a, b) = bootstrap_pair(network, 27091, 27092).await;

    a.shutdown.cancel();
    b.shutdown.cancel();
    a.join_handle.await.unwrap();
    b.join_handle.await.unwrap();

    for transport in a.factory.transports() {
        assert!(transport.is_closed());
    }
    for transport in b.factory.transports() {
        assert!(transport.is_closed());
    }

    // The actor is gone; requests fail instead of hanging.
    let result = a
        .requester
        .clone()
        .send(b.node_id, Bytes::from_static(b"too late"))
        .await;
    assert!(matches!(
        result,
        Err(ConnectionManagerError::ActorDisconnected) | Err(ConnectionManagerError::ResponseCancelled)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn packet_loss_setting_reaches_all_transports() {
    let network = MemoryNetwork::new();
    let (a, _b) = bootstrap_pair(network, 27101, 27102).await;

    a.requester
        .clone()
        .set_debug_packet_loss_rate(0.1, 0.25)
        .await
        .unwrap();

    let factory = a.factory.clone();
    assert!(
        wait_until(
            move || {
                let transports = factory.transports();
                !transports.is_empty() && transports.iter().all(|t| t.packet_loss() == Some((0.1, 0.25)))
            },
            Duration::from_secs(5)
        )
        .await
    );
}

#[tokio::test]
async fn pending_reservation_expires_without_add() {
    let config = ConnectionManagerConfig {
        rendezvous_connect_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (mut manager, _listener) = direct_manager(config);
    manager.directory_mut().update_idle_transports(stub_transport(1));

    let unreachable = peer_node_id(9);
    manager.get_available_endpoint(unreachable, Default::default()).unwrap();
    assert_eq!(manager.directory().pending_count(), 1);

    time::sleep(Duration::from_millis(150)).await;
    manager.process_queued_events();
    assert_eq!(manager.directory().pending_count(), 0);

    // A later reservation starts fresh.
    manager.get_available_endpoint(unreachable, Default::default()).unwrap();
    assert_eq!(manager.directory().pending_count(), 1);
}

#[tokio::test]
async fn stale_timeout_leaves_a_newer_reservation_alone() {
    let config = ConnectionManagerConfig {
        rendezvous_connect_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (mut manager, _listener) = direct_manager(config);
    manager.directory_mut().update_idle_transports(stub_transport(1));

    let peer = peer_node_id(9);
    manager.get_available_endpoint(peer, Default::default()).unwrap();

    // The timeout fires while its event sits in the queue; the reservation is replaced before
    // the event is handled.
    time::sleep(Duration::from_millis(150)).await;
    manager.directory_mut().remove_pending(&peer);
    manager.get_available_endpoint(peer, Default::default()).unwrap();
    assert_eq!(manager.directory().pending_count(), 1);

    manager.process_queued_events();
    assert_eq!(manager.directory().pending_count(), 1);
}
