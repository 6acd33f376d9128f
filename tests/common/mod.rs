#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for lobby-sync integration tests.
//!
//! Every test runs against a [`MemoryLobbyServer`]; each [`Player`] is one
//! signed-in client with its own platform and director.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lobby_sync::services::{MemoryLobbyClient, MemoryLobbyServer};
use lobby_sync::{
    DataEntry, DataMap, DirectorEvent, LobbyConfig, Participant, Platform, Room, RoomSession,
    SessionDirector, SessionEvent,
};

// ── Players ─────────────────────────────────────────────────────────

/// One signed-in participant.
pub struct Player {
    pub id: String,
    pub client: Arc<MemoryLobbyClient>,
    pub platform: Arc<Platform>,
    pub director: SessionDirector,
}

/// Signs in `id` on `server` with the default configuration.
pub async fn player(server: &MemoryLobbyServer, id: &str) -> Player {
    player_with(server, id, LobbyConfig::new(id)).await
}

/// Signs in `id` on `server` with a custom configuration.
pub async fn player_with(server: &MemoryLobbyServer, id: &str, config: LobbyConfig) -> Player {
    let client = server.client_as(id);
    let platform = Arc::new(Platform::new(client.clone(), client.clone()));
    platform.open().await.expect("platform should open");
    let director = SessionDirector::new(Arc::clone(&platform), config);
    Player {
        id: id.to_string(),
        client,
        platform,
        director,
    }
}

/// Lets spawned background tasks run until they block again.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Installs a log subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Event recorders ─────────────────────────────────────────────────

/// Short name of a director event, for order assertions.
pub fn director_event_name(event: &DirectorEvent) -> &'static str {
    match event {
        DirectorEvent::QueriedListChanged => "queried_list_changed",
        DirectorEvent::CurrentSessionChanged => "current_session_changed",
        DirectorEvent::Created(_) => "created",
        DirectorEvent::Deleted(_) => "deleted",
        DirectorEvent::Joined(_) => "joined",
        DirectorEvent::Left(_) => "left",
    }
}

/// Records the names of every director event from now on.
pub fn record_director(director: &SessionDirector) -> Arc<Mutex<Vec<&'static str>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    director
        .events()
        .listen(move |event| sink.lock().unwrap().push(director_event_name(event)));
    seen
}

/// Records every session event from now on.
pub fn record_session(session: &RoomSession) -> Arc<Mutex<Vec<SessionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session
        .events()
        .listen(move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

/// Number of recorded events named `name`.
pub fn count(seen: &Arc<Mutex<Vec<&'static str>>>, name: &str) -> usize {
    seen.lock().unwrap().iter().filter(|n| **n == name).count()
}

// ── Model helpers ───────────────────────────────────────────────────

/// Public metadata built from key/value pairs.
pub fn data(pairs: &[(&str, &str)]) -> DataMap {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), DataEntry::public(*value)))
        .collect()
}

/// A public room filled with placeholder participants, leaving `free` slots.
pub fn seed_room(id: &str, name: &str, max_players: u32, free: u32) -> Room {
    let occupied = max_players - free;
    let participants: Vec<Participant> = (0..occupied)
        .map(|i| Participant::new(format!("{id}-p{i}"), format!("Seed {i}")))
        .collect();
    Room {
        id: id.to_string(),
        code: Some(id.to_uppercase()),
        name: name.to_string(),
        host_id: participants
            .first()
            .map(|p| p.id.clone())
            .unwrap_or_default(),
        max_players,
        available_slots: free,
        created: SystemTime::now(),
        last_updated: SystemTime::now(),
        participants,
        ..Room::default()
    }
}
