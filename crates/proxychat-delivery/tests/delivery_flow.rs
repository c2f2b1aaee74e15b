//! End-to-end delivery tests across sessions and processes.

mod common;

use std::time::Duration;

use common::{assert_silent, recv_message, shared_store, TestNode};
use proxychat_delivery::{ChatMessage, DeliveryConfig, GroupId, RecipientOutcome, UserId};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CAROL: UserId = UserId(3);

fn direct(from: UserId, to: UserId, content: &str) -> String {
    ChatMessage::direct(from, "tester", to, content)
        .to_json()
        .unwrap()
}

#[tokio::test]
async fn offline_recipient_gets_message_exactly_once_on_connect() {
    let (store, _shutdown) = shared_store();
    let node = TestNode::new(&store, "node-a");

    let (mut bob, _bob_out) = node.delivery.sessions.connect(BOB).await.unwrap();
    node.delivery
        .sessions
        .handle_frame(&mut bob, &direct(BOB, ALICE, "hi"))
        .await
        .unwrap();
    assert_eq!(node.delivery.offline.pending(ALICE).await.unwrap(), 1);

    let (_alice, mut alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    let received = recv_message(&mut alice_out).await;
    assert_eq!(received.content(), "hi");
    assert_eq!(received.sender_id(), BOB);

    assert_silent(&mut alice_out).await;
    assert_eq!(node.delivery.offline.pending(ALICE).await.unwrap(), 0);
}

#[tokio::test]
async fn group_message_reaches_members_but_not_sender() {
    let (store, _shutdown) = shared_store();
    let node = TestNode::new(&store, "node-a");
    let group = GroupId(10);
    node.delivery.groups.join(group, ALICE).await.unwrap();
    node.delivery.groups.join(group, BOB).await.unwrap();

    let (mut alice, mut alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    let (_bob, mut bob_out) = node.delivery.sessions.connect(BOB).await.unwrap();

    let frame = ChatMessage::group(ALICE, "alice", group, "hello group")
        .to_json()
        .unwrap();
    let report = node
        .delivery
        .sessions
        .handle_frame(&mut alice, &frame)
        .await
        .unwrap();
    assert_eq!(report.attempts(), 1);

    let received = recv_message(&mut bob_out).await;
    assert_eq!(received.content(), "hello group");
    assert_eq!(received.group_id(), Some(group));
    assert_silent(&mut alice_out).await;
}

#[tokio::test]
async fn backlog_is_delivered_in_enqueue_order() {
    let (store, _shutdown) = shared_store();
    let node = TestNode::new(&store, "node-a");

    let (mut alice, _alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    for n in 0..5 {
        node.delivery
            .sessions
            .handle_frame(&mut alice, &direct(ALICE, BOB, &format!("msg-{}", n)))
            .await
            .unwrap();
    }

    let (_bob, mut bob_out) = node.delivery.sessions.connect(BOB).await.unwrap();
    for n in 0..5 {
        assert_eq!(recv_message(&mut bob_out).await.content(), format!("msg-{}", n));
    }
}

#[tokio::test]
async fn recipient_on_other_process_receives_via_relay() {
    let (store, shutdown) = shared_store();
    let mut node_a = TestNode::new(&store, "node-a");
    let mut node_b = TestNode::new(&store, "node-b");
    node_a.start_relay(&shutdown).await;
    node_b.start_relay(&shutdown).await;

    let (mut alice, _alice_out) = node_a.delivery.sessions.connect(ALICE).await.unwrap();
    let (_bob, mut bob_out) = node_b.delivery.sessions.connect(BOB).await.unwrap();

    let report = node_a
        .delivery
        .sessions
        .handle_frame(&mut alice, &direct(ALICE, BOB, "across"))
        .await
        .unwrap();
    assert_eq!(
        report.outcome_for(BOB),
        Some(&RecipientOutcome::Queued { published: true })
    );

    assert_eq!(recv_message(&mut bob_out).await.content(), "across");
    // The offline copy stays for the next reconnect
    assert_eq!(node_b.delivery.offline.pending(BOB).await.unwrap(), 1);

    shutdown.cancel();
    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn group_fanout_across_processes() {
    let (store, shutdown) = shared_store();
    let mut node_a = TestNode::new(&store, "node-a");
    let mut node_b = TestNode::new(&store, "node-b");
    node_a.start_relay(&shutdown).await;
    node_b.start_relay(&shutdown).await;

    let group = GroupId(20);
    for user in [ALICE, BOB, CAROL] {
        node_a.delivery.groups.join(group, user).await.unwrap();
    }

    let (mut alice, _alice_out) = node_a.delivery.sessions.connect(ALICE).await.unwrap();
    let (_bob, mut bob_out) = node_a.delivery.sessions.connect(BOB).await.unwrap();
    let (_carol, mut carol_out) = node_b.delivery.sessions.connect(CAROL).await.unwrap();

    let frame = ChatMessage::group(ALICE, "alice", group, "everyone")
        .to_json()
        .unwrap();
    let report = node_a
        .delivery
        .sessions
        .handle_frame(&mut alice, &frame)
        .await
        .unwrap();

    assert_eq!(report.outcome_for(BOB), Some(&RecipientOutcome::DeliveredLocal));
    assert!(matches!(
        report.outcome_for(CAROL),
        Some(RecipientOutcome::Queued { .. })
    ));
    assert_eq!(recv_message(&mut bob_out).await.content(), "everyone");
    assert_eq!(recv_message(&mut carol_out).await.content(), "everyone");

    // Bob is local to node A, so node B's relay must not duplicate to him
    assert_silent(&mut bob_out).await;

    shutdown.cancel();
    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn reconnect_replaces_lookup_and_old_teardown_is_harmless() {
    let (store, _shutdown) = shared_store();
    let node = TestNode::new(&store, "node-a");

    let (mut first, _first_out) = node.delivery.sessions.connect(BOB).await.unwrap();
    let (second, mut second_out) = node.delivery.sessions.connect(BOB).await.unwrap();

    let handle = node.delivery.registry.lookup(BOB).unwrap();
    assert_eq!(handle.connection_id, second.connection_id());

    node.delivery.sessions.disconnect(&mut first).await;
    assert!(node.delivery.registry.is_connected(BOB));
    assert_eq!(node.presence.is_online(BOB), Some(true));

    let (mut alice, _alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    node.delivery
        .sessions
        .handle_frame(&mut alice, &direct(ALICE, BOB, "to the new stream"))
        .await
        .unwrap();
    assert_eq!(recv_message(&mut second_out).await.content(), "to the new stream");
}

#[tokio::test(start_paused = true)]
async fn untouched_backlog_expires() {
    let (store, _shutdown) = shared_store();
    let config = DeliveryConfig::default().with_offline_ttl(Duration::from_secs(60));
    let node = TestNode::with_config(&store, "node-a", config);

    let (mut alice, _alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    node.delivery
        .sessions
        .handle_frame(&mut alice, &direct(ALICE, BOB, "too late"))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;

    let (_bob, bob_out) = node.delivery.sessions.connect(BOB).await.unwrap();
    assert_eq!(bob_out.backlog_len(), 0);
}

#[tokio::test]
async fn disconnect_flips_presence_offline() {
    let (store, _shutdown) = shared_store();
    let node = TestNode::new(&store, "node-a");

    let (mut alice, _alice_out) = node.delivery.sessions.connect(ALICE).await.unwrap();
    assert_eq!(node.presence.is_online(ALICE), Some(true));

    node.delivery.sessions.disconnect(&mut alice).await;
    assert_eq!(node.presence.is_online(ALICE), Some(false));
    assert_eq!(node.delivery.registry.connection_count(), 0);
}
