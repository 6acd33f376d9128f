//! Seams to the external collaborators: the lobby service and the identity provider.
//!
//! The remote room directory is assumed to offer reliable RPC semantics; its
//! wire protocol and authentication are owned elsewhere. Adapters implement
//! [`LobbyService`] on top of whatever client library the service provides.
//! The crate ships an in-process implementation behind the `memory-service`
//! feature (see [`services`](crate::services)).
//!
//! # Error contract
//!
//! Expected rejections (room not found, full, locked, wrong password,
//! forbidden, rate limited) must be reported as
//! [`LobbyError::Service`](crate::LobbyError::Service), ideally with an
//! [`ErrorCode`](crate::ErrorCode). Anything else (connection reset,
//! malformed response) should be [`LobbyError::Transport`](crate::LobbyError::Transport).
//! The engine turns the former into empty results and propagates the latter.
//!
//! # Implementing a service adapter
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use lobby_sync::model::{
//!     CreateRoomOptions, Participant, ParticipantUpdate, QueryFilter, Room, RoomUpdate,
//! };
//! use lobby_sync::service::{LobbyService, RoomSubscription};
//! use lobby_sync::{LobbyError, Result};
//!
//! struct MyService { /* ... */ }
//!
//! #[async_trait]
//! impl LobbyService for MyService {
//!     async fn query_rooms(&self, filter: &QueryFilter) -> Result<Vec<Room>> {
//!         Err(LobbyError::Transport("not wired up".into()))
//!     }
//!     // ... remaining operations forward to the service's client library
//! #   async fn join_by_code(&self, _: &str, _: &Participant, _: Option<&str>) -> Result<Room> { unimplemented!() }
//! #   async fn join_by_id(&self, _: &str, _: &Participant, _: Option<&str>) -> Result<Room> { unimplemented!() }
//! #   async fn create_room(&self, _: &str, _: u32, _: CreateRoomOptions) -> Result<Room> { unimplemented!() }
//! #   async fn delete_room(&self, _: &str) -> Result<()> { unimplemented!() }
//! #   async fn remove_participant(&self, _: &str, _: &str) -> Result<()> { unimplemented!() }
//! #   async fn update_room(&self, _: &str, _: RoomUpdate) -> Result<Room> { unimplemented!() }
//! #   async fn update_participant(&self, _: &str, _: &str, _: ParticipantUpdate) -> Result<Room> { unimplemented!() }
//! #   async fn send_heartbeat(&self, _: &str) -> Result<()> { unimplemented!() }
//! #   async fn subscribe(&self, _: &str) -> Result<Box<dyn RoomSubscription>> { unimplemented!() }
//! }
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    CreateRoomOptions, EventConnectionState, Participant, ParticipantId, ParticipantUpdate,
    QueryFilter, Room, RoomChanges, RoomUpdate,
};

/// A change pushed by the lobby service on a room subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Diff against the last delivered state. This is the only event that
    /// changes the cached room.
    Changed(RoomChanges),
    /// The subscription's connection state changed.
    ConnectionStateChanged(EventConnectionState),
    /// The room was deleted.
    Deleted,
    /// The subscribing participant was removed from the room.
    Kicked,
    /// Participants joined. Notification only; the matching state change
    /// arrives as [`RoomEvent::Changed`].
    ParticipantsJoined(Vec<Participant>),
    /// Participants left. Notification only; the matching state change
    /// arrives as [`RoomEvent::Changed`].
    ParticipantsLeft(Vec<ParticipantId>),
}

/// The remote room directory and room operations.
///
/// Every call is made on behalf of the participant the identity provider
/// signed in.
#[async_trait]
pub trait LobbyService: Send + Sync + 'static {
    /// Prepares the service for use. Called by [`Platform::open`](crate::Platform::open).
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Lists joinable rooms, in the service's order.
    async fn query_rooms(&self, filter: &QueryFilter) -> Result<Vec<Room>>;

    /// Joins the room with the given join code.
    async fn join_by_code(
        &self,
        code: &str,
        participant: &Participant,
        password: Option<&str>,
    ) -> Result<Room>;

    /// Joins the room with the given id.
    async fn join_by_id(
        &self,
        room_id: &str,
        participant: &Participant,
        password: Option<&str>,
    ) -> Result<Room>;

    /// Creates a room; the participant in `options` becomes host and first member.
    async fn create_room(
        &self,
        name: &str,
        max_players: u32,
        options: CreateRoomOptions,
    ) -> Result<Room>;

    /// Deletes a room.
    async fn delete_room(&self, room_id: &str) -> Result<()>;

    /// Removes a participant from a room.
    async fn remove_participant(&self, room_id: &str, participant_id: &str) -> Result<()>;

    /// Replaces the room's settings and metadata; returns the authoritative snapshot.
    async fn update_room(&self, room_id: &str, update: RoomUpdate) -> Result<Room>;

    /// Replaces a participant's metadata; returns the authoritative snapshot.
    async fn update_participant(
        &self,
        room_id: &str,
        participant_id: &str,
        update: ParticipantUpdate,
    ) -> Result<Room>;

    /// Signals that the caller's client is still present.
    async fn send_heartbeat(&self, room_id: &str) -> Result<()>;

    /// Opens the room's change channel.
    async fn subscribe(&self, room_id: &str) -> Result<Box<dyn RoomSubscription>>;
}

/// An open change channel for one room.
///
/// # Cancel Safety
///
/// [`next_event`](RoomSubscription::next_event) **MUST** be cancel-safe: it
/// is raced against cancellation inside `tokio::select!`. Channel-backed
/// implementations are naturally cancel-safe.
#[async_trait]
pub trait RoomSubscription: Send + 'static {
    /// Waits for the next pushed event. `None` means the channel closed.
    async fn next_event(&mut self) -> Option<RoomEvent>;

    /// Closes the channel. Called exactly once, after the last `next_event`.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Supplies the stable identifier of the local participant.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Signs in and returns the participant id, valid until [`sign_out`](IdentityProvider::sign_out).
    async fn sign_in(&self) -> Result<ParticipantId>;

    /// Signs out.
    async fn sign_out(&self) -> Result<()> {
        Ok(())
    }
}
