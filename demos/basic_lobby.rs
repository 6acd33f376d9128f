//! # Basic Lobby Example
//!
//! Two players share one room on the in-process lobby service:
//!
//! 1. Open a platform per player and sign in
//! 2. Alice creates a room, Bob finds it through a directory query and joins
//! 3. Both react to each other's metadata changes
//! 4. Alice leaves, Bob becomes host and deletes the room
//!
//! ## Running
//!
//! ```sh
//! cargo run --example basic_lobby
//!
//! # Verbose engine logs:
//! RUST_LOG=lobby_sync=debug cargo run --example basic_lobby
//! ```

use std::sync::Arc;
use std::time::Duration;

use lobby_sync::services::MemoryLobbyServer;
use lobby_sync::{
    DataEntry, DataMap, DirectorEvent, LobbyConfig, Platform, RoomSession, SessionDirector,
    SessionEvent,
};

/// Opens a platform for `name` and wraps it in a director.
async fn sign_in(
    server: &MemoryLobbyServer,
    name: &str,
) -> Result<SessionDirector, Box<dyn std::error::Error>> {
    let client = server.client();
    let platform = Arc::new(Platform::new(client.clone(), client));
    platform.open().await?;
    let config = LobbyConfig::new(name).with_request_cooldown(Duration::from_millis(500));
    Ok(SessionDirector::new(platform, config))
}

/// Logs every event of `session` under `who`.
fn watch(who: &'static str, session: &RoomSession) {
    let room = session.clone();
    session.events().listen(move |event| match event {
        SessionEvent::PlayersJoined { participants } => {
            tracing::info!("[{who}] joined: {participants:?}");
        }
        SessionEvent::PlayersLeft { participants } => {
            tracing::info!("[{who}] left: {participants:?}");
        }
        SessionEvent::LobbyDataChanged => {
            tracing::info!("[{who}] lobby data:\n{}", room.room().dump_data());
        }
        SessionEvent::PlayerDataChanged => {
            tracing::info!("[{who}] player data:\n{}", room.room().dump_participant_data());
        }
        SessionEvent::Deleted => tracing::info!("[{who}] room deleted"),
        SessionEvent::Kicked => tracing::info!("[{who}] kicked"),
    });
    session.fields().is_host.subscribe(move |is_host| {
        tracing::info!("[{who}] is host: {is_host}");
    });
}

fn entry(key: &str, value: &str) -> DataMap {
    DataMap::from([(key.to_string(), DataEntry::public(value))])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Players ─────────────────────────────────────────────────────
    let server = MemoryLobbyServer::new();
    let alice = sign_in(&server, "Alice").await?;
    let bob = sign_in(&server, "Bob").await?;

    bob.events().listen(|event| {
        if let DirectorEvent::QueriedListChanged = event {
            tracing::info!("[bob] directory refreshed");
        }
    });

    // ── Create ──────────────────────────────────────────────────────
    let Some(hosted) = alice.create("Friday night", false, None).await? else {
        return Err("room creation was refused".into());
    };
    watch("alice", &hosted);
    tracing::info!("alice created room {} ({:?})", hosted.id(), hosted.room().code);

    // ── Query and join ──────────────────────────────────────────────
    let rooms = bob.query().await?.unwrap_or_default();
    let Some(target) = rooms.iter().find(|room| bob.can_join(room, None)) else {
        return Err("no joinable room".into());
    };
    let Some(joined) = bob.join(target, None).await? else {
        return Err("join was refused".into());
    };
    watch("bob", &joined);

    // ── Metadata ────────────────────────────────────────────────────
    hosted.update_room_data(Some(entry("map", "forest"))).await?;
    joined.update_participant_data(entry("ready", "true")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // ── Teardown ────────────────────────────────────────────────────
    alice.leave(&hosted).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    if bob.can_delete(&joined) {
        bob.delete(&joined).await?;
    }

    tracing::info!(
        "done: alice in room = {}, bob in room = {}",
        alice.is_in_room(),
        bob.is_in_room()
    );
    Ok(())
}
