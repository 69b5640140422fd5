//! End-to-end send scenarios against a real sled store.

mod common;

use common::{draft, sorted, Harness};
use roomcast::fanout::SendState;
use roomcast::storage::{MailboxDirectory, ReadLedger};

#[test]
fn first_message_reaches_every_member() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob", "carol"]);

    let m1 = orchestrator
        .send_message(&draft("M1"), &room, "alice")
        .unwrap();

    assert_eq!(m1.sender_id.as_deref(), Some("alice"));
    assert_eq!(m1.room_id, room.id);
    assert_eq!(h.store.stats().messages, 1);
    assert_eq!(h.store.stats().mailboxes, 3);
    for user in ["alice", "bob", "carol"] {
        assert!(!h.mailbox(user, &room.id).empty);
        assert_eq!(h.linked(user, &room.id), vec![m1.id.clone()]);
    }
    assert_eq!(h.unread("alice", &room.id), 0);
    assert_eq!(h.unread("bob", &room.id), 1);
    assert_eq!(h.unread("carol", &room.id), 1);

    let alice = h.store.read_tracking().get(&room.id, "alice").unwrap().unwrap();
    assert_eq!(alice.last_read_message_id.as_deref(), Some(m1.id.as_str()));

    assert_eq!(
        sorted(h.sink.push_targets(&m1.id)),
        vec!["alice", "bob", "carol"]
    );
    assert_eq!(h.sink.states_for(&m1.id).last(), Some(&SendState::Complete));
    assert!(h.sink.degraded_steps().is_empty());
}

#[test]
fn reply_moves_counters_for_everyone_but_the_sender() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob", "carol"]);

    orchestrator.send_message(&draft("M1"), &room, "alice").unwrap();
    orchestrator.send_message(&draft("M2"), &room, "bob").unwrap();

    assert_eq!(h.unread("bob", &room.id), 0);
    assert_eq!(h.unread("alice", &room.id), 1);
    assert_eq!(h.unread("carol", &room.id), 2);
    // Mailboxes were reused, not duplicated.
    assert_eq!(h.store.stats().mailboxes, 3);
    assert_eq!(h.store.stats().messages, 2);
}

#[test]
fn cleared_mailbox_comes_back_with_only_new_messages() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob", "carol"]);

    let m1 = orchestrator.send_message(&draft("M1"), &room, "alice").unwrap();
    let m2 = orchestrator.send_message(&draft("M2"), &room, "bob").unwrap();
    let alice_box = h.mailbox("alice", &room.id);
    assert_eq!(h.linked("alice", &room.id), vec![m2.id.clone(), m1.id.clone()]);

    orchestrator.clear_mailbox(&alice_box.id, "alice").unwrap();
    assert!(h.mailbox("alice", &room.id).empty);
    assert_eq!(h.unread("alice", &room.id), 0);
    assert!(orchestrator
        .mailboxes_for_user("alice", 0, 10)
        .unwrap()
        .is_empty());

    let m3 = orchestrator.send_message(&draft("M3"), &room, "carol").unwrap();

    let resurrected = h.mailbox("alice", &room.id);
    assert_eq!(resurrected.id, alice_box.id);
    assert!(!resurrected.empty);
    assert_eq!(h.unread("alice", &room.id), 1);
    assert_eq!(h.linked("alice", &room.id), vec![m3.id.clone()]);
    // Other members keep their full history.
    assert_eq!(h.linked("bob", &room.id).len(), 3);
    assert_eq!(h.store.stats().mailboxes, 3);
}

#[test]
fn ensure_mailbox_twice_returns_the_same_id() {
    let h = Harness::new();
    let mailboxes = h.store.mailboxes();
    let first = mailboxes.ensure_mailbox("alice", "room-1").unwrap();
    let second = mailboxes.ensure_mailbox("alice", "room-1").unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.store.stats().mailboxes, 1);
}

#[test]
fn system_message_has_no_sender_and_exempts_nobody() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob"]);
    orchestrator.send_message(&draft("hello"), &room, "alice").unwrap();

    let notice = orchestrator
        .send_system_message(&draft("bob joined"), &room)
        .unwrap();

    assert!(notice.sender_id.is_none());
    assert_eq!(h.unread("alice", &room.id), 1);
    assert_eq!(h.unread("bob", &room.id), 2);
    assert_eq!(sorted(h.sink.push_targets(&notice.id)), vec!["alice", "bob"]);
}

#[tokio::test]
async fn connected_members_receive_the_push() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob"]);
    let mut bob = h.hub.connect("bob");

    let message = orchestrator.send_message(&draft("ping"), &room, "alice").unwrap();

    let push = bob.recv().await.expect("push for bob");
    assert_eq!(push.topic, roomcast::fanout::MESSAGES_TOPIC);
    assert_eq!(push.payload["id"], message.id.as_str());
    assert_eq!(push.payload["body"], "ping");
    // Offline alice was attempted too.
    assert_eq!(sorted(h.sink.push_targets(&message.id)), vec!["alice", "bob"]);
}

#[test]
fn membership_snapshot_is_fixed_for_the_send() {
    let h = Harness::new();
    let orchestrator = h.orchestrator();
    let room = h.room(&["alice", "bob"]);

    h.store
        .rooms()
        .add_members(&room.id, "alice", &["dave".to_string()])
        .unwrap();

    // The stale snapshot does not include dave.
    let m1 = orchestrator.send_message(&draft("before"), &room, "alice").unwrap();
    assert!(h.store.mailboxes().find("dave", &room.id).unwrap().is_none());
    assert_eq!(sorted(h.sink.push_targets(&m1.id)), vec!["alice", "bob"]);

    // A fresh snapshot does.
    let m2 = orchestrator.send_to_room(&draft("after"), &room.id, "alice").unwrap();
    assert_eq!(h.linked("dave", &room.id), vec![m2.id.clone()]);
    assert_eq!(h.unread("dave", &room.id), 1);
}
