#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Director flows against the in-memory lobby service.
//!
//! Covers the directory cache, the guarded create/join/leave/delete actions,
//! and convergence to "no session" on remote kicks and deletions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use lobby_sync::services::{MemoryLobbyServer, Operation};
use lobby_sync::{DirectorEvent, ErrorCode, LobbyConfig, LobbyError, Platform, SessionDirector};

use common::{count, player, record_director, record_session, seed_room, settle};

const COOLDOWN_ELAPSED: Duration = Duration::from_millis(5_200);

// ════════════════════════════════════════════════════════════════════
// Directory queries
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn query_lists_rooms_and_gates_joins() {
    let server = MemoryLobbyServer::new();
    server.insert_room(seed_room("room-a", "A", 4, 2), None);
    server.insert_room(seed_room("room-b", "B", 4, 0), None);
    let alice = player(&server, "alice").await;
    let events = record_director(&alice.director);

    let rooms = alice.director.query().await.unwrap().unwrap();

    assert_eq!(rooms.len(), 2);
    assert_eq!(rooms[0].name, "A");
    assert_eq!(rooms[1].name, "B");
    assert_eq!(alice.director.queried_rooms(), rooms);
    assert!(alice.director.last_refresh_time().is_some());
    assert!(alice.director.can_join(&rooms[0], None));
    assert!(!alice.director.can_join(&rooms[1], None));
    assert_eq!(*events.lock().unwrap(), vec!["queried_list_changed"]);
}

#[tokio::test(start_paused = true)]
async fn failed_query_publishes_empty_list() {
    let server = MemoryLobbyServer::new();
    server.insert_room(seed_room("room-a", "A", 4, 2), None);
    let alice = player(&server, "alice").await;
    let events = record_director(&alice.director);

    alice.director.query().await.unwrap();
    assert_eq!(alice.director.queried_rooms().len(), 1);

    tokio::time::sleep(COOLDOWN_ELAPSED).await;
    server.fail_next(Operation::Query, ErrorCode::ServiceUnavailable);
    assert!(alice.director.query().await.unwrap().is_none());
    assert!(alice.director.queried_rooms().is_empty());

    tokio::time::sleep(COOLDOWN_ELAPSED).await;
    alice.director.query().await.unwrap();
    assert_eq!(alice.director.queried_rooms().len(), 1);

    tokio::time::sleep(COOLDOWN_ELAPSED).await;
    server.break_next(Operation::Query);
    let err = alice.director.query().await.unwrap_err();
    assert!(matches!(err, LobbyError::Transport(_)));
    assert!(alice.director.queried_rooms().is_empty());
    assert!(!alice.director.is_refreshing());

    assert_eq!(count(&events, "queried_list_changed"), 4);
}

#[tokio::test(start_paused = true)]
async fn query_respects_cooldown() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let events = record_director(&alice.director);

    assert!(alice.director.query().await.unwrap().is_some());
    assert!(!alice.director.can_query());
    assert!(alice.director.query().await.unwrap().is_none());
    assert_eq!(count(&events, "queried_list_changed"), 1);

    tokio::time::sleep(COOLDOWN_ELAPSED).await;
    assert!(alice.director.can_query());
}

#[tokio::test(start_paused = true)]
async fn closed_platform_disables_every_action() {
    let server = MemoryLobbyServer::new();
    let client = server.client_as("alice");
    let platform = Arc::new(Platform::new(client.clone(), client));
    let director = SessionDirector::new(platform, LobbyConfig::new("alice"));

    assert!(!director.is_enabled());
    assert!(!director.can_query());
    assert!(!director.can_create());
    assert!(!director.can_join_by_code("ABCDEF"));
    assert!(director.query().await.unwrap().is_none());
    assert!(director.create("Test", false, None).await.unwrap().is_none());
    assert!(director.queried_rooms().is_empty());
    assert!(director.last_refresh_time().is_none());
    assert!(server.rooms().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Create and join
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn create_makes_caller_host_and_creator() {
    common::init_tracing();
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let events = record_director(&alice.director);

    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .expect("room should be created");
    settle().await;

    let fields = session.fields();
    assert!(fields.is_member.get());
    assert!(fields.is_host.get());
    assert!(fields.is_creator.get());
    assert_eq!(fields.host_id.get(), "alice");
    assert_eq!(fields.creator_id.get().as_deref(), Some("alice"));
    assert!(!fields.is_private.get());
    assert!(!fields.is_locked.get());
    assert_eq!(fields.max_players.get(), 4);
    assert_eq!(fields.available_slots.get(), 3);

    assert_eq!(
        *events.lock().unwrap(),
        vec!["current_session_changed", "created"]
    );
    assert!(alice.director.current_session().unwrap().ptr_eq(&session));
    assert!(alice.director.is_in_room());
    assert!(!alice.director.can_create());
}

#[tokio::test(start_paused = true)]
async fn failed_create_leaves_no_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;

    server.fail_next(Operation::Create, ErrorCode::RateLimitExceeded);
    assert!(alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .is_none());
    assert!(!alice.director.is_in_room());

    tokio::time::sleep(COOLDOWN_ELAPSED).await;
    server.break_next(Operation::Create);
    assert!(alice.director.create("Test", false, None).await.is_err());
    assert!(!alice.director.is_in_room());
    assert!(!alice.director.create_governor().is_running());
}

#[tokio::test(start_paused = true)]
async fn join_by_code_reaches_existing_members() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;
    let alice_events = record_session(&hosted);
    let bob_events = record_director(&bob.director);

    let code = hosted.room().code.unwrap().to_lowercase();
    assert!(!bob.director.can_join_by_code("  "));
    let joined = bob
        .director
        .join_by_code(&code, None)
        .await
        .unwrap()
        .expect("join should succeed");
    settle().await;

    assert!(joined.fields().is_member.get());
    assert!(!joined.fields().is_host.get());
    assert!(!joined.fields().is_creator.get());
    assert_eq!(joined.fields().creator_id.get().as_deref(), Some("alice"));
    assert_eq!(joined.room().participant("bob").unwrap().name(), Some("bob"));
    assert_eq!(
        *bob_events.lock().unwrap(),
        vec!["current_session_changed", "joined"]
    );

    assert_eq!(hosted.room().participants.len(), 2);
    assert_eq!(hosted.fields().available_slots.get(), 2);
    assert!(alice_events
        .lock()
        .unwrap()
        .contains(&lobby_sync::SessionEvent::PlayersJoined {
            participants: vec!["bob".into()]
        }));
}

#[tokio::test(start_paused = true)]
async fn join_by_code_ignores_surrounding_whitespace() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();

    let code = format!("  {} \n", hosted.room().code.unwrap());
    assert!(bob.director.can_join_by_code(&code));
    let joined = bob
        .director
        .join_by_code(&code, None)
        .await
        .unwrap()
        .expect("padded code should still join");

    assert_eq!(joined.id(), hosted.id());
    assert!(bob.director.is_in_room());
}

#[tokio::test(start_paused = true)]
async fn password_presence_is_checked_locally_and_value_remotely() {
    let server = MemoryLobbyServer::new();
    let mut room = seed_room("room-p", "Private", 4, 3);
    room.has_password = true;
    server.insert_room(room, Some("secret".into()));
    let alice = player(&server, "alice").await;

    let rooms = alice.director.query().await.unwrap().unwrap();
    let room = &rooms[0];
    assert!(!alice.director.can_join(room, None));
    assert!(alice.director.can_join(room, Some("guess")));

    assert!(alice
        .director
        .join(room, Some("guess"))
        .await
        .unwrap()
        .is_none());
    assert!(!alice.director.is_in_room());

    let session = alice
        .director
        .join(room, Some("secret"))
        .await
        .unwrap()
        .expect("correct password should join");
    assert!(session.fields().has_password.get());
    assert!(alice.director.is_in_room());
}

#[tokio::test(start_paused = true)]
async fn concurrent_create_and_join_keep_one_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Alice's", false, None)
        .await
        .unwrap()
        .unwrap();
    let code = hosted.room().code.unwrap();

    server.set_latency(Duration::from_secs(1));
    let (created, joined) = tokio::join!(
        bob.director.create("Bob's", false, None),
        bob.director.join_by_code(&code, None)
    );
    let created = created.unwrap();
    let joined = joined.unwrap();
    settle().await;

    let winner = match (&created, &joined) {
        (Some(session), None) | (None, Some(session)) => session.clone(),
        other => panic!("exactly one session should win, got {other:?}"),
    };
    assert!(bob.director.current_session().unwrap().ptr_eq(&winner));

    let rooms_with_bob = server
        .rooms()
        .iter()
        .filter(|room| room.has_participant("bob"))
        .count();
    assert_eq!(rooms_with_bob, 1);
}

// ════════════════════════════════════════════════════════════════════
// Leave, delete, close
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn leave_clears_session_once_and_stale_leave_is_noop() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    let code = hosted.room().code.unwrap();
    let session = bob
        .director
        .join_by_code(&code, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;
    let events = record_director(&bob.director);
    let alice_events = record_session(&hosted);

    assert!(bob.director.can_leave(&session));
    assert!(bob.director.leave(&session).await.unwrap());
    settle().await;

    assert!(bob.director.current_session().is_none());
    assert_eq!(
        *events.lock().unwrap(),
        vec!["current_session_changed", "left"]
    );
    assert!(!session.fields().is_member.get());
    assert!(!session.is_active());

    assert!(!bob.director.can_leave(&session));
    assert!(!bob.director.leave(&session).await.unwrap());
    assert_eq!(count(&events, "current_session_changed"), 1);

    assert_eq!(hosted.room().participants.len(), 1);
    assert!(alice_events
        .lock()
        .unwrap()
        .contains(&lobby_sync::SessionEvent::PlayersLeft {
            participants: vec!["bob".into()]
        }));
}

#[tokio::test(start_paused = true)]
async fn leaving_a_room_already_gone_still_discards_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;

    server.fail_next(Operation::RemoveParticipant, ErrorCode::RoomNotFound);
    assert!(alice.director.leave(&session).await.unwrap());
    assert!(!alice.director.is_in_room());
}

#[tokio::test(start_paused = true)]
async fn refused_leave_keeps_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;

    server.fail_next(Operation::RemoveParticipant, ErrorCode::RateLimitExceeded);
    assert!(!alice.director.leave(&session).await.unwrap());
    assert!(alice.director.is_in_room());
    assert!(session.is_active());

    server.break_next(Operation::RemoveParticipant);
    assert!(alice.director.leave(&session).await.is_err());
    assert!(alice.director.is_in_room());
}

#[tokio::test(start_paused = true)]
async fn delete_requires_host_and_reaches_members() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    let code = hosted.room().code.unwrap();
    let joined = bob
        .director
        .join_by_code(&code, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;
    let alice_director_events = record_director(&alice.director);
    let bob_director_events = record_director(&bob.director);
    let bob_session_events = record_session(&joined);

    assert!(!bob.director.can_delete(&joined));
    assert!(!bob.director.delete(&joined).await.unwrap());

    assert!(alice.director.can_delete(&hosted));
    assert!(alice.director.delete(&hosted).await.unwrap());
    settle().await;

    assert!(server.room(hosted.id()).is_none());
    assert!(!alice.director.is_in_room());
    assert_eq!(
        *alice_director_events.lock().unwrap(),
        vec!["current_session_changed", "deleted"]
    );

    assert!(!bob.director.is_in_room());
    assert_eq!(count(&bob_director_events, "current_session_changed"), 1);
    assert_eq!(
        *bob_session_events.lock().unwrap(),
        vec![lobby_sync::SessionEvent::Deleted]
    );
    assert!(!joined.fields().is_member.get());
}

#[tokio::test(start_paused = true)]
async fn close_drops_session_without_remote_call() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;
    let events = record_director(&alice.director);

    alice.director.close().await;

    assert!(!alice.director.is_in_room());
    assert!(session.is_closed());
    assert!(!session.is_active());
    assert!(server.room(session.id()).unwrap().has_participant("alice"));
    assert_eq!(*events.lock().unwrap(), vec!["current_session_changed"]);
}

// ════════════════════════════════════════════════════════════════════
// Remote teardown
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn kicked_sole_member_returns_to_no_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    settle().await;
    let events = record_director(&alice.director);
    let room_id = session.id().to_string();

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(server.heartbeat_count(&room_id), 1);

    assert!(server.kick(&room_id, "alice"));
    settle().await;

    assert!(!session.fields().is_member.get());
    assert!(alice.director.current_session().is_none());
    assert_eq!(*events.lock().unwrap(), vec!["current_session_changed"]);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(server.heartbeat_count(&room_id), 1);
    assert!(!session.is_active());
}

#[tokio::test(start_paused = true)]
async fn remote_delete_returns_every_member_to_no_session() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let bob = player(&server, "bob").await;
    let hosted = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();
    let code = hosted.room().code.unwrap();
    bob.director.join_by_code(&code, None).await.unwrap().unwrap();
    settle().await;

    assert!(server.delete(hosted.id()));
    settle().await;

    assert!(!alice.director.is_in_room());
    assert!(!bob.director.is_in_room());
    assert!(hosted.room().participants.is_empty());
}

#[tokio::test(start_paused = true)]
async fn director_events_reach_async_receivers() {
    let server = MemoryLobbyServer::new();
    let alice = player(&server, "alice").await;
    let mut rx = alice.director.events().subscribe();

    let session = alice
        .director
        .create("Test", false, None)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        rx.recv().await.unwrap(),
        DirectorEvent::CurrentSessionChanged
    ));
    match rx.recv().await.unwrap() {
        DirectorEvent::Created(created) => assert!(created.ptr_eq(&session)),
        other => panic!("expected Created, got {other:?}"),
    }
}
