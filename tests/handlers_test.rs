//! Handler-level tests for login, ping/retry, ack, private routing, and
//! group operations, run against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use tokio::sync::mpsc;

use lumen_server::cluster::ClusterCoordinator;
use lumen_server::delivery::MessageSender;
use lumen_server::handlers;
use lumen_server::message::{looks_like_json, now_millis, Message, SessionRecord};
use lumen_server::registry::{Connection, ConnectionRegistry};
use lumen_server::state::AppState;
use lumen_server::store::memory::MemoryStore;
use lumen_server::store::{keys, SharedStore};
use lumen_server::{crypto, router};

/// Build an application context over a fresh in-memory store. The
/// coordinator's background loops stay un-spawned; tests drive its methods
/// directly where needed.
fn build_state() -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn SharedStore> = store.clone();
    let registry = Arc::new(ConnectionRegistry::new());
    let delivery = MessageSender::new(shared.clone(), registry.clone());
    let cluster = ClusterCoordinator::new(shared.clone(), registry.clone(), delivery.clone());
    let state = AppState {
        store: shared,
        registry,
        delivery,
        cluster,
        idle_timeout: Duration::from_secs(60),
    };
    (state, store)
}

fn new_conn() -> (Connection, mpsc::UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection::new(tx), rx)
}

/// Wait for the next frame on a connection's channel.
async fn next_frame(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Option<WsMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Decode an outbound frame addressed to `uid` (decrypting if needed).
fn decode_frame(uid: &str, frame: WsMessage) -> Message {
    let WsMessage::Text(text) = frame else {
        panic!("expected text frame, got {frame:?}");
    };
    let text = text.as_str();
    let json = if looks_like_json(text) {
        text.to_string()
    } else {
        crypto::decrypt(uid, text).expect("frame should decrypt with the user's key")
    };
    serde_json::from_str(&json).expect("frame should parse as a Message")
}

async fn next_message(uid: &str, rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Message {
    decode_frame(uid, next_frame(rx).await.expect("expected a frame"))
}

fn login_request(uid: &str, device: &str) -> Message {
    Message {
        event_id: "1000000".into(),
        from_uid: uid.into(),
        token: format!("token-{uid}"),
        device_id: device.into(),
        s_timest: now_millis().to_string(),
        ..Default::default()
    }
}

fn private_message(from: &str, to: &str, body: &str) -> Message {
    Message {
        event_id: "1000001".into(),
        from_uid: from.into(),
        to_uid: to.into(),
        data_body: body.into(),
        s_timest: now_millis().to_string(),
        ..Default::default()
    }
}

/// Store the user's token and run the login handler; expects Success.
async fn login(
    state: &AppState,
    uid: &str,
    device: &str,
) -> (Connection, mpsc::UnboundedReceiver<WsMessage>) {
    state
        .store
        .set_with_ttl(&keys::token(uid), &format!("token-{uid}"), 3600)
        .await
        .unwrap();
    let (conn, mut rx) = new_conn();
    handlers::login::handle(state, &conn, login_request(uid, device))
        .await
        .unwrap();
    let resp = next_message(uid, &mut rx).await;
    assert_eq!(resp.data_body, "Success", "login should succeed for {uid}");
    (conn, rx)
}

// --- login ---

#[tokio::test]
async fn test_login_success_establishes_session() {
    let (state, store) = build_state();
    let (conn, _rx) = login(&state, "alice", "phone").await;

    assert_eq!(state.registry.get_connections("alice").len(), 1);
    assert_eq!(state.registry.user_by_conn(conn.id).as_deref(), Some("alice"));

    let record_json = store
        .hash_get(&keys::session("alice"), "phone")
        .await
        .unwrap()
        .expect("session record");
    let record: SessionRecord = serde_json::from_str(&record_json).unwrap();
    assert_eq!(record.user_id, "alice");
    assert_eq!(record.instance_id, state.cluster.instance_id());

    let index = store
        .set_members(&keys::instance_sessions(state.cluster.instance_id()))
        .await
        .unwrap();
    assert_eq!(index, vec!["alice:phone"]);
}

#[tokio::test]
async fn test_login_invalid_token_fails_and_closes() {
    let (state, _store) = build_state();
    let (conn, mut rx) = new_conn();

    handlers::login::handle(&state, &conn, login_request("alice", "phone"))
        .await
        .unwrap();

    // Pre-bind, so the Fail response goes out in the clear.
    let resp = decode_frame("alice", next_frame(&mut rx).await.unwrap());
    assert_eq!(resp.data_body, "Fail");
    assert!(matches!(
        next_frame(&mut rx).await,
        Some(WsMessage::Close(_))
    ));
    assert!(state.registry.get_connections("alice").is_empty());
}

#[tokio::test]
async fn test_login_missing_device_falls_back_to_default() {
    let (state, store) = build_state();
    store
        .set_with_ttl(&keys::token("alice"), "token-alice", 3600)
        .await
        .unwrap();
    let (conn, mut rx) = new_conn();
    handlers::login::handle(&state, &conn, login_request("alice", ""))
        .await
        .unwrap();
    let resp = next_message("alice", &mut rx).await;
    assert_eq!(resp.data_body, "Success");
    assert!(state.registry.get_connection("alice", "default").is_some());
}

#[tokio::test]
async fn test_login_drains_offline_queue_in_order() {
    let (state, store) = build_state();
    for i in 0..3 {
        let msg = private_message("alice", "bob", &format!("offline-{i}"));
        store
            .list_push_back(&keys::offline("bob"), &serde_json::to_string(&msg).unwrap())
            .await
            .unwrap();
    }

    let (_conn, mut rx) = login(&state, "bob", "phone").await;

    for i in 0..3 {
        let msg = next_message("bob", &mut rx).await;
        assert_eq!(msg.data_body, format!("offline-{i}"));
        // Re-delivered offline messages become newly-pending acks.
        assert!(store
            .hash_get(&keys::ack("bob"), &msg.s_timest)
            .await
            .unwrap()
            .is_some());
    }
    assert_eq!(store.list_len(&keys::offline("bob")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_login_resends_all_unacked() {
    let (state, store) = build_state();
    for ts in ["1000", "2000"] {
        let mut msg = private_message("alice", "bob", &format!("unacked-{ts}"));
        msg.s_timest = ts.to_string();
        store
            .hash_put(&keys::ack("bob"), ts, &serde_json::to_string(&msg).unwrap())
            .await
            .unwrap();
    }

    let (_conn, mut rx) = login(&state, "bob", "phone").await;

    let mut bodies = vec![
        next_message("bob", &mut rx).await.data_body,
        next_message("bob", &mut rx).await.data_body,
    ];
    bodies.sort();
    assert_eq!(bodies, vec!["unacked-1000", "unacked-2000"]);
}

// --- ping / retry ---

#[tokio::test]
async fn test_ping_answers_pong() {
    let (state, _store) = build_state();
    let (conn, mut rx) = new_conn();
    let ping = Message {
        event_id: "9000000".into(),
        from_uid: "alice".into(),
        ..Default::default()
    };
    handlers::ping::handle(&state, &conn, ping).await.unwrap();

    let pong = decode_frame("alice", next_frame(&mut rx).await.unwrap());
    assert_eq!(pong.event_id, "9000000");
    assert_eq!(pong.data_body, "PONG");
}

#[tokio::test]
async fn test_ping_retransmits_only_timed_out_entries() {
    let (state, store) = build_state();
    // Bind directly: no login catch-up task competing over the ack cache.
    let (conn, mut rx) = new_conn();
    state.registry.bind("bob", "phone", conn.clone());

    let now = now_millis();
    let stale_ts = (now - 6000).to_string();
    let fresh_ts = now.to_string();
    for (ts, body) in [(&stale_ts, "stale"), (&fresh_ts, "fresh")] {
        let mut msg = private_message("alice", "bob", body);
        msg.s_timest = ts.to_string();
        store
            .hash_put(&keys::ack("bob"), ts, &serde_json::to_string(&msg).unwrap())
            .await
            .unwrap();
    }

    handlers::ping::resend_timed_out(&state, &conn, "bob")
        .await
        .unwrap();

    let resent = next_message("bob", &mut rx).await;
    assert_eq!(resent.data_body, "stale");
    // The fresh entry stays put until its own window expires.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "fresh entry must not be retransmitted"
    );

    // Still unacked at the next qualifying ping: retransmitted again,
    // exactly once per scan.
    handlers::ping::resend_timed_out(&state, &conn, "bob")
        .await
        .unwrap();
    let resent_again = next_message("bob", &mut rx).await;
    assert_eq!(resent_again.data_body, "stale");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}

// --- ack ---

#[tokio::test]
async fn test_ack_removes_named_entries() {
    let (state, store) = build_state();
    for ts in ["111", "222"] {
        store
            .hash_put(&keys::ack("bob"), ts, "{}")
            .await
            .unwrap();
    }

    let (conn, _rx) = new_conn();
    let ack = Message {
        event_id: "1000002".into(),
        from_uid: "bob".into(),
        data_body: r#"["111"]"#.into(),
        ..Default::default()
    };
    handlers::ack::handle(&state, &conn, ack).await.unwrap();

    assert!(store.hash_get(&keys::ack("bob"), "111").await.unwrap().is_none());
    assert!(store.hash_get(&keys::ack("bob"), "222").await.unwrap().is_some());
}

// --- private message routing ---

#[tokio::test]
async fn test_private_message_delivers_locally_and_caches() {
    let (state, store) = build_state();
    let (_conn, mut rx) = login(&state, "bob", "phone").await;

    let msg = private_message("alice", "bob", "hello bob");
    handlers::private_message::route(&state, msg).await.unwrap();

    let delivered = next_message("bob", &mut rx).await;
    assert_eq!(delivered.data_body, "hello bob");
    assert!(store
        .hash_get(&keys::ack("bob"), &delivered.s_timest)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_private_message_queues_offline_when_reliable() {
    let (state, store) = build_state();

    handlers::private_message::route(&state, private_message("alice", "bob", "later"))
        .await
        .unwrap();

    let queued = store.list_range(&keys::offline("bob"), 0, -1).await.unwrap();
    assert_eq!(queued.len(), 1);
    let msg: Message = serde_json::from_str(&queued[0]).unwrap();
    assert_eq!(msg.data_body, "later");
}

#[tokio::test]
async fn test_private_message_drops_unreliable_when_offline() {
    let (state, store) = build_state();

    let mut msg = private_message("alice", "bob", "ephemeral");
    msg.is_cache = "0".into();
    handlers::private_message::route(&state, msg).await.unwrap();

    assert_eq!(store.list_len(&keys::offline("bob")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_private_message_forwards_once_per_instance() {
    let (state, store) = build_state();

    // Bob holds two device sessions on the same remote instance and none
    // here: exactly one forward must land on that instance's stream.
    for device in ["phone", "laptop"] {
        let record = SessionRecord {
            user_id: "bob".into(),
            conn_id: "0".into(),
            device_id: device.into(),
            login_time: now_millis(),
            instance_id: "remote-1".into(),
        };
        store
            .hash_put(
                &keys::session("bob"),
                device,
                &serde_json::to_string(&record).unwrap(),
            )
            .await
            .unwrap();
    }

    handlers::private_message::route(&state, private_message("alice", "bob", "via stream"))
        .await
        .unwrap();

    let entries = store
        .stream_read(&keys::instance_stream("remote-1"), "0-0", 10, 50)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1, "dedup by target instance");
    let forwarded: Message = serde_json::from_str(entries[0].field("body").unwrap()).unwrap();
    assert_eq!(forwarded.data_body, "via stream");

    // A session exists, so nothing goes to the offline queue.
    assert_eq!(store.list_len(&keys::offline("bob")).await.unwrap(), 0);
}

// --- groups ---

async fn create_group(state: &AppState, conn: &Connection, creator: &str, gid: &str) {
    let create = Message {
        event_id: "5000001".into(),
        from_uid: creator.into(),
        group_id: gid.into(),
        data_body: serde_json::json!([
            { "userId": "alice", "isAdmin": "1" },
            { "userId": "bob", "isAdmin": "0" },
            { "userId": "carol", "isAdmin": "0" },
        ])
        .to_string(),
        s_timest: now_millis().to_string(),
        ..Default::default()
    };
    handlers::group::handle_create(state, conn, create).await.unwrap();
}

#[tokio::test]
async fn test_create_group_writes_membership() {
    let (state, store) = build_state();
    let (conn, mut rx) = login(&state, "alice", "phone").await;
    create_group(&state, &conn, "alice", "g1").await;

    let resp = next_message("alice", &mut rx).await;
    assert!(resp.data_body.contains("\"groupId\":\"g1\""));

    assert_eq!(
        store.hash_get(&keys::group_info("g1"), "alice").await.unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(
        store.hash_get(&keys::group_info("g1"), "bob").await.unwrap().as_deref(),
        Some("0")
    );
    for member in ["alice", "bob", "carol"] {
        assert_eq!(
            store.set_members(&keys::user_groups(member)).await.unwrap(),
            vec!["g1"]
        );
    }
}

#[tokio::test]
async fn test_group_message_reaches_every_member_once() {
    let (state, store) = build_state();
    let (alice_conn, mut alice_rx) = login(&state, "alice", "phone").await;
    let (_bob_conn, mut bob_rx) = login(&state, "bob", "phone").await;
    create_group(&state, &alice_conn, "alice", "g1").await;

    // Drain the create response + GROUP_CREATED notifications.
    let _ = next_frame(&mut alice_rx).await;
    let _ = next_frame(&mut alice_rx).await;
    let _ = next_frame(&mut bob_rx).await;

    let group_msg = Message {
        event_id: "5000004".into(),
        from_uid: "alice".into(),
        group_id: "g1".into(),
        is_group: "1".into(),
        data_body: "hello group".into(),
        s_timest: now_millis().to_string(),
        ..Default::default()
    };
    handlers::group::handle_group_message(&state, &alice_conn, group_msg)
        .await
        .unwrap();

    // Every member receives it re-wrapped as a private message carrying the
    // original payload; carol is offline so her copy lands in the queue.
    let to_alice = next_message("alice", &mut alice_rx).await;
    assert_eq!(to_alice.event_id, "1000001");
    assert_eq!(to_alice.data_body, "hello group");
    assert_eq!(to_alice.group_id, "g1");

    let to_bob = next_message("bob", &mut bob_rx).await;
    assert_eq!(to_bob.data_body, "hello group");

    let mut carol_queued = Vec::new();
    for _ in 0..20 {
        carol_queued = store.list_range(&keys::offline("carol"), 0, -1).await.unwrap();
        if !carol_queued.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(carol_queued.len(), 1, "offline member's copy is queued");

    assert!(
        tokio::time::timeout(Duration::from_millis(200), alice_rx.recv())
            .await
            .is_err(),
        "each member receives the fan-out exactly once"
    );
}

#[tokio::test]
async fn test_group_fanout_survives_dead_member_connection() {
    let (state, _store) = build_state();
    let (alice_conn, mut alice_rx) = login(&state, "alice", "phone").await;
    let (_bob_conn, bob_rx) = login(&state, "bob", "phone").await;
    let (_carol_conn, mut carol_rx) = login(&state, "carol", "phone").await;
    create_group(&state, &alice_conn, "alice", "g1").await;
    let _ = next_frame(&mut alice_rx).await; // create response
    let _ = next_frame(&mut alice_rx).await; // GROUP_CREATED
    let _ = next_frame(&mut carol_rx).await;

    // Bob's connection dies before the fan-out.
    drop(bob_rx);

    let group_msg = Message {
        event_id: "5000004".into(),
        from_uid: "alice".into(),
        group_id: "g1".into(),
        is_group: "1".into(),
        data_body: "still delivered".into(),
        s_timest: now_millis().to_string(),
        ..Default::default()
    };
    handlers::group::handle_group_message(&state, &alice_conn, group_msg)
        .await
        .unwrap();

    assert_eq!(next_message("alice", &mut alice_rx).await.data_body, "still delivered");
    assert_eq!(next_message("carol", &mut carol_rx).await.data_body, "still delivered");
}

#[tokio::test]
async fn test_join_group_requires_existing_group() {
    let (state, _store) = build_state();
    let (conn, mut rx) = login(&state, "dave", "phone").await;

    let join = Message {
        event_id: "5000002".into(),
        from_uid: "dave".into(),
        group_id: "nope".into(),
        data_body: r#"[{"userId":"dave","isAdmin":"0"}]"#.into(),
        ..Default::default()
    };
    handlers::group::handle_join(&state, &conn, join).await.unwrap();
    assert_eq!(next_message("dave", &mut rx).await.data_body, "Fail: Group Not Found");
}

#[tokio::test]
async fn test_join_group_adds_members() {
    let (state, store) = build_state();
    let (conn, mut rx) = login(&state, "alice", "phone").await;
    create_group(&state, &conn, "alice", "g1").await;
    let _ = next_frame(&mut rx).await; // create response
    let _ = next_frame(&mut rx).await; // GROUP_CREATED

    let join = Message {
        event_id: "5000002".into(),
        from_uid: "alice".into(),
        group_id: "g1".into(),
        data_body: r#"[{"userId":"dave","isAdmin":"0"}]"#.into(),
        ..Default::default()
    };
    handlers::group::handle_join(&state, &conn, join).await.unwrap();

    assert_eq!(next_message("alice", &mut rx).await.data_body, "Success");
    assert_eq!(
        store.hash_get(&keys::group_info("g1"), "dave").await.unwrap().as_deref(),
        Some("0")
    );
    assert_eq!(store.set_members(&keys::user_groups("dave")).await.unwrap(), vec!["g1"]);
}

#[tokio::test]
async fn test_leave_group_removes_members() {
    let (state, store) = build_state();
    let (conn, mut rx) = login(&state, "alice", "phone").await;
    create_group(&state, &conn, "alice", "g1").await;
    let _ = next_frame(&mut rx).await;
    let _ = next_frame(&mut rx).await;

    let leave = Message {
        event_id: "5000005".into(),
        from_uid: "bob".into(),
        group_id: "g1".into(),
        data_body: r#"[{"userId":"bob","isAdmin":"0"}]"#.into(),
        ..Default::default()
    };
    handlers::group::handle_leave(&state, &conn, leave).await.unwrap();

    assert!(store.hash_get(&keys::group_info("g1"), "bob").await.unwrap().is_none());
    assert!(store.set_members(&keys::user_groups("bob")).await.unwrap().is_empty());
    // Remaining members keep their entries.
    assert!(store.hash_get(&keys::group_info("g1"), "carol").await.unwrap().is_some());
}

#[tokio::test]
async fn test_dismiss_group_requires_admin() {
    let (state, store) = build_state();
    let (alice_conn, _alice_rx) = login(&state, "alice", "phone").await;
    let (bob_conn, mut bob_rx) = login(&state, "bob", "phone").await;
    create_group(&state, &alice_conn, "alice", "g1").await;

    let dismiss = Message {
        event_id: "5000003".into(),
        from_uid: "bob".into(),
        group_id: "g1".into(),
        ..Default::default()
    };
    handlers::group::handle_dismiss(&state, &bob_conn, dismiss).await.unwrap();

    // Bob may also receive the GROUP_CREATED notification; scan for the
    // dismissal refusal.
    let mut denied = false;
    for _ in 0..3 {
        let Some(frame) = next_frame(&mut bob_rx).await else {
            break;
        };
        if decode_frame("bob", frame).data_body == "Fail: Permission Denied" {
            denied = true;
            break;
        }
    }
    assert!(denied, "non-admin dismissal must be refused");
    assert!(store.exists(&keys::group_info("g1")).await.unwrap());
}

#[tokio::test]
async fn test_dismiss_group_deletes_structure_after_notify() {
    let (state, store) = build_state();
    let (alice_conn, mut alice_rx) = login(&state, "alice", "phone").await;
    create_group(&state, &alice_conn, "alice", "g1").await;
    let _ = next_frame(&mut alice_rx).await;
    let _ = next_frame(&mut alice_rx).await;

    let dismiss = Message {
        event_id: "5000003".into(),
        from_uid: "alice".into(),
        group_id: "g1".into(),
        ..Default::default()
    };
    handlers::group::handle_dismiss(&state, &alice_conn, dismiss).await.unwrap();

    // The member list was snapshotted before deletion, so the dismissal
    // notification still reaches the admin's connection.
    let mut got_notice = false;
    let mut got_success = false;
    for _ in 0..3 {
        let Some(frame) = next_frame(&mut alice_rx).await else {
            break;
        };
        let msg = decode_frame("alice", frame);
        if msg.data_body.contains("dismissed") {
            got_notice = true;
        }
        if msg.data_body == "Success" {
            got_success = true;
        }
        if got_notice && got_success {
            break;
        }
    }
    assert!(got_notice, "dismissal notification delivered");
    assert!(got_success, "dismiss answered Success");

    assert!(!store.exists(&keys::group_info("g1")).await.unwrap());
    for member in ["alice", "bob", "carol"] {
        assert!(store.set_members(&keys::user_groups(member)).await.unwrap().is_empty());
    }
}

// --- router ---

#[tokio::test]
async fn test_router_drops_unknown_event() {
    let (state, _store) = build_state();
    let (conn, mut rx) = new_conn();
    let msg = Message {
        event_id: "4242424".into(),
        ..Default::default()
    };
    router::dispatch(&state, &conn, msg);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "unknown events produce no response"
    );
}

#[tokio::test]
async fn test_router_dispatches_ping() {
    let (state, _store) = build_state();
    let (conn, mut rx) = new_conn();
    let msg = Message {
        event_id: "9000000".into(),
        ..Default::default()
    };
    router::dispatch(&state, &conn, msg);
    let frame = next_frame(&mut rx).await.expect("pong");
    let pong = decode_frame("", frame);
    assert_eq!(pong.data_body, "PONG");
}
