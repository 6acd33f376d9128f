//! # Lobby Sync
//!
//! Client-side session synchronization for server-authoritative multiplayer
//! lobbies.
//!
//! Many participants observe and mutate one remote room at the same time.
//! This crate keeps a local cache of that room coherent with the service,
//! serializes and rate-limits outbound calls, keeps the membership alive with
//! heartbeats, and publishes change notifications so dependent logic never
//! has to poll.
//!
//! ## Building blocks
//!
//! - [`Observable`]: a value that notifies subscribers on every real change.
//! - [`RequestGovernor`]: one call in flight per action class, spaced by a cooldown.
//! - [`RoomSession`]: one joined room, its cache, heartbeat and event listener.
//! - [`SessionDirector`]: at most one current session plus the room directory.
//! - [`Platform`]: the explicitly opened service and identity context.
//!
//! The remote service is reached through the [`LobbyService`] trait. The
//! `memory-service` feature (on by default) provides an in-process
//! implementation in [`services`].
//!
//! ## Quick Start
//!
//! ```rust
//! # async fn example() -> lobby_sync::Result<()> {
//! use std::sync::Arc;
//! use lobby_sync::services::MemoryLobbyServer;
//! use lobby_sync::{DirectorEvent, LobbyConfig, Platform, SessionDirector};
//!
//! let server = MemoryLobbyServer::new();
//! let client = server.client();
//! let platform = Arc::new(Platform::new(client.clone(), client));
//! platform.open().await?;
//!
//! let director = SessionDirector::new(platform, LobbyConfig::new("Alice"));
//! director.events().listen(|event| {
//!     if let DirectorEvent::CurrentSessionChanged = event {
//!         println!("current session changed");
//!     }
//! });
//!
//! if let Some(session) = director.create("Friday night", false, None).await? {
//!     assert!(session.fields().is_host.get());
//!     director.leave(&session).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod director;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod governor;
pub mod model;
pub mod observable;
pub mod platform;
pub mod service;
pub mod services;
pub mod session;

// Re-export primary types for ergonomic imports.
pub use config::LobbyConfig;
pub use director::SessionDirector;
pub use error::{LobbyError, Result};
pub use error_codes::ErrorCode;
pub use event::{DirectorEvent, EventHub, SessionEvent};
pub use governor::RequestGovernor;
pub use model::{
    CreateRoomOptions, DataEntry, DataMap, EventConnectionState, MapChanges, Participant,
    ParticipantId, ParticipantProfile, ParticipantUpdate, QueryFilter, Room, RoomChanges, RoomId,
    RoomUpdate, Visibility, CREATOR_ID_KEY,
};
pub use observable::{ListenerId, Observable};
pub use platform::{AnonymousIdentity, AuthState, Platform, ServiceState};
pub use service::{IdentityProvider, LobbyService, RoomEvent, RoomSubscription};
pub use session::{LocalMutation, RoomPatch, RoomSession, SessionFields};
