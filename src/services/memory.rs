//! In-process lobby service.
//!
//! [`MemoryLobbyServer`] keeps every room in memory and plays the part of the
//! remote service for any number of [`MemoryLobbyClient`]s, one per
//! participant. Each client is both the [`LobbyService`] and the
//! [`IdentityProvider`] of one participant, so a test or demo can run several
//! directors against one server.
//!
//! Rules enforced by the server:
//!
//! - queries list public rooms in creation order and hide non-public metadata;
//! - joins are rejected with `RoomNotFound`, `AlreadyInRoom`, `RoomLocked`,
//!   `RoomFull` or `IncorrectPassword`;
//! - only the host updates room settings or removes other participants, and
//!   participants update only their own metadata (`Forbidden` otherwise);
//! - when the host leaves the next participant becomes host, and a room whose
//!   last participant leaves is deleted;
//! - changes are pushed to every subscriber except the caller; a removed
//!   participant is pushed `Kicked`, a deleted room pushes `Deleted`.
//!
//! Tests can inject one-shot faults per [`Operation`], add latency and push
//! arbitrary events.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{LobbyError, Result};
use crate::error_codes::ErrorCode;
use crate::model::{
    CreateRoomOptions, EventConnectionState, MapChanges, Participant, ParticipantId,
    ParticipantUpdate, QueryFilter, Room, RoomChanges, RoomId, RoomUpdate, Visibility,
};
use crate::observable::lock;
use crate::service::{IdentityProvider, LobbyService, RoomEvent, RoomSubscription};

/// Length of generated join codes.
const CODE_LEN: usize = 6;

/// One service operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initialize,
    SignIn,
    Query,
    JoinByCode,
    JoinById,
    Create,
    Delete,
    RemoveParticipant,
    UpdateRoom,
    UpdateParticipant,
    Heartbeat,
    Subscribe,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Reject(ErrorCode),
    Break,
}

struct Subscriber {
    id: u64,
    participant: ParticipantId,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

struct StoredRoom {
    room: Room,
    password: Option<String>,
    subscribers: Vec<Subscriber>,
}

impl StoredRoom {
    /// Sends `events` to every subscriber not owned by `except`.
    fn push(&mut self, except: Option<&str>, events: &[RoomEvent]) {
        self.subscribers.retain(|sub| {
            if except == Some(sub.participant.as_str()) {
                return true;
            }
            events.iter().all(|event| sub.tx.send(event.clone()).is_ok())
        });
    }

    /// Pushes the difference between `before` and the current room.
    fn publish(&mut self, before: &Room, caller: &str) {
        let changes = changes_between(before, &self.room);
        if changes.is_empty() {
            return;
        }
        let mut events = vec![RoomEvent::Changed(changes.clone())];
        if !changes.participants_joined.is_empty() {
            events.push(RoomEvent::ParticipantsJoined(changes.participants_joined));
        }
        if !changes.participants_left.is_empty() {
            events.push(RoomEvent::ParticipantsLeft(changes.participants_left));
        }
        self.push(Some(caller), &events);
    }

    fn touch(&mut self) {
        self.room.last_updated = SystemTime::now();
        let occupied = u32::try_from(self.room.participants.len()).unwrap_or(u32::MAX);
        self.room.available_slots = self.room.max_players.saturating_sub(occupied);
    }
}

#[derive(Default)]
struct ServerState {
    rooms: Vec<StoredRoom>,
    faults: HashMap<Operation, Fault>,
    /// Kept after a room is deleted.
    heartbeats: HashMap<RoomId, usize>,
    latency: Duration,
    next_subscriber: u64,
}

impl ServerState {
    fn room_mut(&mut self, room_id: &str) -> Result<&mut StoredRoom> {
        self.rooms
            .iter_mut()
            .find(|stored| stored.room.id == room_id)
            .ok_or_else(|| LobbyError::rejected(ErrorCode::RoomNotFound))
    }

    fn remove_room(&mut self, room_id: &str) -> Option<StoredRoom> {
        let index = self.rooms.iter().position(|s| s.room.id == room_id)?;
        Some(self.rooms.remove(index))
    }
}

/// Shared in-memory room store. Clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryLobbyServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryLobbyServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client that signs in with a fresh random id.
    pub fn client(&self) -> Arc<MemoryLobbyClient> {
        Arc::new(MemoryLobbyClient {
            server: self.clone(),
            fixed_id: None,
            id: Mutex::new(None),
        })
    }

    /// A client that always signs in as `id`.
    pub fn client_as(&self, id: impl Into<ParticipantId>) -> Arc<MemoryLobbyClient> {
        Arc::new(MemoryLobbyClient {
            server: self.clone(),
            fixed_id: Some(id.into()),
            id: Mutex::new(None),
        })
    }

    // ── Test controls ───────────────────────────────────────────────

    /// Makes the next call of `operation` fail with a service rejection.
    pub fn fail_next(&self, operation: Operation, code: ErrorCode) {
        lock(&self.state)
            .faults
            .insert(operation, Fault::Reject(code));
    }

    /// Makes the next call of `operation` fail with a transport fault.
    pub fn break_next(&self, operation: Operation) {
        lock(&self.state).faults.insert(operation, Fault::Break);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// Stores a room as is, for seeding directories.
    pub fn insert_room(&self, room: Room, password: Option<String>) {
        lock(&self.state).rooms.push(StoredRoom {
            room,
            password,
            subscribers: Vec::new(),
        });
    }

    /// Snapshot of one room.
    pub fn room(&self, room_id: &str) -> Option<Room> {
        lock(&self.state)
            .rooms
            .iter()
            .find(|s| s.room.id == room_id)
            .map(|s| s.room.clone())
    }

    /// Snapshots of every room, in creation order.
    pub fn rooms(&self) -> Vec<Room> {
        lock(&self.state)
            .rooms
            .iter()
            .map(|s| s.room.clone())
            .collect()
    }

    /// Heartbeats received for a room, including after it was deleted.
    pub fn heartbeat_count(&self, room_id: &str) -> usize {
        lock(&self.state)
            .heartbeats
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    /// Open subscriptions on a room.
    pub fn subscriber_count(&self, room_id: &str) -> usize {
        lock(&self.state)
            .rooms
            .iter()
            .find(|s| s.room.id == room_id)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Removes a participant on the service's own authority.
    pub fn kick(&self, room_id: &str, participant_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Ok(stored) = state.room_mut(room_id) else {
            return false;
        };
        if !stored.room.has_participant(participant_id) {
            return false;
        }
        let emptied = remove_member(stored, participant_id, None);
        if emptied {
            state.remove_room(room_id);
        }
        true
    }

    /// Deletes a room on the service's own authority.
    pub fn delete(&self, room_id: &str) -> bool {
        let removed = lock(&self.state).remove_room(room_id);
        match removed {
            Some(mut stored) => {
                stored.push(None, &[RoomEvent::Deleted]);
                true
            }
            None => false,
        }
    }

    /// Pushes an arbitrary event to every subscriber of a room.
    pub fn push(&self, room_id: &str, event: RoomEvent) -> bool {
        let mut state = lock(&self.state);
        match state.room_mut(room_id) {
            Ok(stored) => {
                stored.push(None, &[event]);
                true
            }
            Err(_) => false,
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    async fn enter(&self, operation: Operation) -> Result<()> {
        let (latency, fault) = {
            let mut state = lock(&self.state);
            (state.latency, state.faults.remove(&operation))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(Fault::Reject(code)) => {
                debug!("memory service: injected {code} for {operation:?}");
                Err(LobbyError::rejected(code))
            }
            Some(Fault::Break) => {
                debug!("memory service: injected transport fault for {operation:?}");
                Err(LobbyError::Transport(format!("{operation:?}: connection reset")))
            }
            None => Ok(()),
        }
    }

    fn query(&self, filter: &QueryFilter) -> Vec<Room> {
        let state = lock(&self.state);
        let matching = state
            .rooms
            .iter()
            .map(|s| &s.room)
            .filter(|room| !room.is_private && filter.matches(room))
            .map(public_view);
        match filter.max_results {
            Some(max) => matching.take(max).collect(),
            None => matching.collect(),
        }
    }

    fn join(
        &self,
        find: impl Fn(&Room) -> bool,
        participant: &Participant,
        password: Option<&str>,
    ) -> Result<Room> {
        let mut state = lock(&self.state);
        let stored = state
            .rooms
            .iter_mut()
            .find(|s| find(&s.room))
            .ok_or_else(|| LobbyError::rejected(ErrorCode::RoomNotFound))?;

        if stored.room.has_participant(&participant.id) {
            return Err(LobbyError::rejected(ErrorCode::AlreadyInRoom));
        }
        if stored.room.is_locked {
            return Err(LobbyError::rejected(ErrorCode::RoomLocked));
        }
        if stored.room.available_slots == 0 {
            return Err(LobbyError::rejected(ErrorCode::RoomFull));
        }
        if let Some(expected) = &stored.password {
            if password != Some(expected.as_str()) {
                return Err(LobbyError::rejected(ErrorCode::IncorrectPassword));
            }
        }

        let before = stored.room.clone();
        let mut member = participant.clone();
        member.joined = Some(SystemTime::now());
        stored.room.participants.push(member);
        stored.touch();
        stored.publish(&before, &participant.id);
        debug!("memory service: {} joined room {}", participant.id, stored.room.id);
        Ok(stored.room.clone())
    }

    fn create(&self, name: &str, max_players: u32, options: CreateRoomOptions) -> Result<Room> {
        let Some(mut host) = options.participant else {
            return Err(LobbyError::rejected(ErrorCode::InvalidInput));
        };
        if max_players == 0 || name.trim().is_empty() {
            return Err(LobbyError::rejected(ErrorCode::InvalidInput));
        }

        let now = SystemTime::now();
        host.joined = Some(now);
        let id = uuid::Uuid::new_v4().to_string();
        let code = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(CODE_LEN)
            .collect::<String>()
            .to_uppercase();
        let mut stored = StoredRoom {
            room: Room {
                id,
                code: Some(code),
                name: name.to_string(),
                host_id: host.id.clone(),
                max_players,
                available_slots: 0,
                is_private: options.is_private,
                is_locked: options.is_locked,
                has_password: options.password.is_some(),
                created: now,
                last_updated: now,
                data: options.data,
                participants: vec![host],
            },
            password: options.password,
            subscribers: Vec::new(),
        };
        stored.touch();
        let room = stored.room.clone();
        lock(&self.state).rooms.push(stored);
        debug!("memory service: created room {} ({})", room.id, room.name);
        Ok(room)
    }

    fn delete_room(&self, caller: &str, room_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.room_mut(room_id)?.room.host_id != caller {
            return Err(LobbyError::rejected(ErrorCode::Forbidden));
        }
        if let Some(mut stored) = state.remove_room(room_id) {
            stored.push(Some(caller), &[RoomEvent::Deleted]);
        }
        debug!("memory service: room {room_id} deleted by {caller}");
        Ok(())
    }

    fn remove_participant(&self, caller: &str, room_id: &str, participant_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let stored = state.room_mut(room_id)?;
        if caller != participant_id && stored.room.host_id != caller {
            return Err(LobbyError::rejected(ErrorCode::Forbidden));
        }
        if !stored.room.has_participant(participant_id) {
            return Err(LobbyError::rejected(ErrorCode::NotInRoom));
        }
        if remove_member(stored, participant_id, Some(caller)) {
            state.remove_room(room_id);
        }
        Ok(())
    }

    fn update_room(&self, caller: &str, room_id: &str, update: RoomUpdate) -> Result<Room> {
        let mut state = lock(&self.state);
        let stored = state.room_mut(room_id)?;
        if stored.room.host_id != caller {
            return Err(LobbyError::rejected(ErrorCode::Forbidden));
        }
        let occupied = u32::try_from(stored.room.participants.len()).unwrap_or(u32::MAX);
        if update.max_players < occupied || !stored.room.has_participant(&update.host_id) {
            return Err(LobbyError::rejected(ErrorCode::InvalidInput));
        }

        let before = stored.room.clone();
        stored.room.name = update.name;
        stored.room.max_players = update.max_players;
        stored.room.is_private = update.is_private;
        stored.room.is_locked = update.is_locked;
        match update.password {
            Some(password) => stored.password = Some(password),
            None if update.clear_password => stored.password = None,
            None => {}
        }
        stored.room.has_password = stored.password.is_some();
        stored.room.host_id = update.host_id;
        stored.room.data = update.data;
        stored.touch();
        stored.publish(&before, caller);
        Ok(stored.room.clone())
    }

    fn update_participant(
        &self,
        caller: &str,
        room_id: &str,
        participant_id: &str,
        update: ParticipantUpdate,
    ) -> Result<Room> {
        let mut state = lock(&self.state);
        let stored = state.room_mut(room_id)?;
        if caller != participant_id {
            return Err(LobbyError::rejected(ErrorCode::Forbidden));
        }

        let before = stored.room.clone();
        let participant = stored
            .room
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| LobbyError::rejected(ErrorCode::NotInRoom))?;
        participant.data = update.data;
        participant.last_updated = Some(SystemTime::now());
        stored.touch();
        stored.publish(&before, caller);
        Ok(stored.room.clone())
    }

    fn heartbeat(&self, caller: &str, room_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let stored = state.room_mut(room_id)?;
        if !stored.room.has_participant(caller) {
            return Err(LobbyError::rejected(ErrorCode::NotInRoom));
        }
        *state.heartbeats.entry(room_id.to_string()).or_default() += 1;
        trace!("memory service: heartbeat from {caller} for room {room_id}");
        Ok(())
    }

    fn subscribe(&self, caller: &str, room_id: &str) -> Result<MemorySubscription> {
        let mut state = lock(&self.state);
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        let stored = state.room_mut(room_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive, so this send cannot fail.
        let _ = tx.send(RoomEvent::ConnectionStateChanged(
            EventConnectionState::Subscribed,
        ));
        stored.subscribers.push(Subscriber {
            id,
            participant: caller.to_string(),
            tx,
        });
        Ok(MemorySubscription {
            server: self.clone(),
            room_id: room_id.to_string(),
            id,
            rx,
        })
    }

    fn unsubscribe(&self, room_id: &str, id: u64) {
        let mut state = lock(&self.state);
        if let Ok(stored) = state.room_mut(room_id) {
            stored.subscribers.retain(|sub| sub.id != id);
        }
    }
}

impl fmt::Debug for MemoryLobbyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryLobbyServer")
            .field("rooms", &state.rooms.len())
            .field("latency", &state.latency)
            .finish()
    }
}

/// Removes `participant_id`, migrates the host and publishes the change.
///
/// `caller` is `None` for removals on the service's own authority. Returns
/// `true` if the room is now empty.
fn remove_member(stored: &mut StoredRoom, participant_id: &str, caller: Option<&str>) -> bool {
    let before = stored.room.clone();
    stored.room.participants.retain(|p| p.id != participant_id);
    if caller != Some(participant_id) {
        for sub in &stored.subscribers {
            if sub.participant == participant_id {
                let _ = sub.tx.send(RoomEvent::Kicked);
            }
        }
    }
    if stored.room.participants.is_empty() {
        debug!("memory service: room {} emptied", stored.room.id);
        return true;
    }

    if stored.room.host_id == participant_id {
        if let Some(next) = stored.room.participants.first() {
            stored.room.host_id.clone_from(&next.id);
        }
    }
    stored.touch();
    stored.publish(&before, caller.unwrap_or(participant_id));
    false
}

/// The room as directory queries show it: public metadata only.
fn public_view(room: &Room) -> Room {
    let mut room = room.clone();
    room.data
        .retain(|_, entry| entry.visibility == Visibility::Public);
    for participant in &mut room.participants {
        participant
            .data
            .retain(|_, entry| entry.visibility == Visibility::Public);
    }
    room
}

/// Describes how `before` turned into `after`.
fn changes_between(before: &Room, after: &Room) -> RoomChanges {
    fn differs<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
        (old != new).then(|| new.clone())
    }

    let participants_joined = after
        .participants
        .iter()
        .filter(|p| !before.has_participant(&p.id))
        .cloned()
        .collect();
    let participants_left = before
        .participants
        .iter()
        .filter(|p| !after.has_participant(&p.id))
        .map(|p| p.id.clone())
        .collect();
    let participant_data = after
        .participants
        .iter()
        .filter_map(|p| {
            let old = before.participant(&p.id)?;
            let changes = MapChanges::between(&old.data, &p.data);
            (!changes.is_empty()).then(|| (p.id.clone(), changes))
        })
        .collect();

    let mut changes = RoomChanges {
        name: differs(&before.name, &after.name),
        host_id: differs(&before.host_id, &after.host_id),
        max_players: differs(&before.max_players, &after.max_players),
        available_slots: differs(&before.available_slots, &after.available_slots),
        is_private: differs(&before.is_private, &after.is_private),
        is_locked: differs(&before.is_locked, &after.is_locked),
        has_password: differs(&before.has_password, &after.has_password),
        last_updated: None,
        data: MapChanges::between(&before.data, &after.data),
        participants_joined,
        participants_left,
        participant_data,
    };
    if !changes.is_empty() {
        changes.last_updated = Some(after.last_updated);
    }
    changes
}

// ── Client ──────────────────────────────────────────────────────────

/// One participant's connection to a [`MemoryLobbyServer`].
pub struct MemoryLobbyClient {
    server: MemoryLobbyServer,
    fixed_id: Option<ParticipantId>,
    id: Mutex<Option<ParticipantId>>,
}

impl MemoryLobbyClient {
    /// The server this client talks to.
    pub fn server(&self) -> &MemoryLobbyServer {
        &self.server
    }

    /// The signed-in participant id, if any.
    pub fn participant_id(&self) -> Option<ParticipantId> {
        lock(&self.id).clone()
    }

    fn caller(&self) -> Result<ParticipantId> {
        self.participant_id()
            .ok_or_else(|| LobbyError::rejected(ErrorCode::AuthenticationRequired))
    }
}

impl fmt::Debug for MemoryLobbyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLobbyClient")
            .field("id", &*lock(&self.id))
            .finish()
    }
}

#[async_trait]
impl IdentityProvider for MemoryLobbyClient {
    async fn sign_in(&self) -> Result<ParticipantId> {
        self.server.enter(Operation::SignIn).await?;
        let mut id = lock(&self.id);
        let id = id.get_or_insert_with(|| {
            self.fixed_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
        });
        Ok(id.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        *lock(&self.id) = None;
        Ok(())
    }
}

#[async_trait]
impl LobbyService for MemoryLobbyClient {
    async fn initialize(&self) -> Result<()> {
        self.server.enter(Operation::Initialize).await
    }

    async fn query_rooms(&self, filter: &QueryFilter) -> Result<Vec<Room>> {
        self.server.enter(Operation::Query).await?;
        Ok(self.server.query(filter))
    }

    async fn join_by_code(
        &self,
        code: &str,
        participant: &Participant,
        password: Option<&str>,
    ) -> Result<Room> {
        self.server.enter(Operation::JoinByCode).await?;
        self.server.join(
            |room| room.code.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(code)),
            participant,
            password,
        )
    }

    async fn join_by_id(
        &self,
        room_id: &str,
        participant: &Participant,
        password: Option<&str>,
    ) -> Result<Room> {
        self.server.enter(Operation::JoinById).await?;
        self.server
            .join(|room| room.id == room_id, participant, password)
    }

    async fn create_room(
        &self,
        name: &str,
        max_players: u32,
        options: CreateRoomOptions,
    ) -> Result<Room> {
        self.server.enter(Operation::Create).await?;
        self.caller()?;
        self.server.create(name, max_players, options)
    }

    async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.server.enter(Operation::Delete).await?;
        self.server.delete_room(&self.caller()?, room_id)
    }

    async fn remove_participant(&self, room_id: &str, participant_id: &str) -> Result<()> {
        self.server.enter(Operation::RemoveParticipant).await?;
        self.server
            .remove_participant(&self.caller()?, room_id, participant_id)
    }

    async fn update_room(&self, room_id: &str, update: RoomUpdate) -> Result<Room> {
        self.server.enter(Operation::UpdateRoom).await?;
        self.server.update_room(&self.caller()?, room_id, update)
    }

    async fn update_participant(
        &self,
        room_id: &str,
        participant_id: &str,
        update: ParticipantUpdate,
    ) -> Result<Room> {
        self.server.enter(Operation::UpdateParticipant).await?;
        self.server
            .update_participant(&self.caller()?, room_id, participant_id, update)
    }

    async fn send_heartbeat(&self, room_id: &str) -> Result<()> {
        self.server.enter(Operation::Heartbeat).await?;
        self.server.heartbeat(&self.caller()?, room_id)
    }

    async fn subscribe(&self, room_id: &str) -> Result<Box<dyn RoomSubscription>> {
        self.server.enter(Operation::Subscribe).await?;
        let subscription = self.server.subscribe(&self.caller()?, room_id)?;
        Ok(Box::new(subscription))
    }
}

struct MemorySubscription {
    server: MemoryLobbyServer,
    room_id: RoomId,
    id: u64,
    rx: mpsc::UnboundedReceiver<RoomEvent>,
}

#[async_trait]
impl RoomSubscription for MemorySubscription {
    async fn next_event(&mut self) -> Option<RoomEvent> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx.close();
        self.server.unsubscribe(&self.room_id, self.id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::model::DataEntry;

    async fn signed_in(server: &MemoryLobbyServer, id: &str) -> Arc<MemoryLobbyClient> {
        let client = server.client_as(id);
        client.sign_in().await.unwrap();
        client
    }

    async fn create(client: &MemoryLobbyClient, max_players: u32) -> Room {
        let id = client.participant_id().unwrap();
        let options = CreateRoomOptions {
            participant: Some(Participant::new(id.clone(), id)),
            ..CreateRoomOptions::default()
        };
        client.create_room("Test", max_players, options).await.unwrap()
    }

    fn code_of(err: &LobbyError) -> ErrorCode {
        *err.error_code().expect("coded rejection")
    }

    #[test]
    fn changes_between_describes_membership_and_data() {
        let before = Room {
            host_id: "alice".into(),
            max_players: 4,
            available_slots: 3,
            participants: vec![Participant::new("alice", "Alice")],
            ..Room::default()
        };
        let mut after = before.clone();
        after.participants.push(Participant::new("bob", "Bob"));
        after.available_slots = 2;
        after.data.insert("map".into(), DataEntry::public("forest"));
        after.participants[0]
            .data
            .insert("ready".into(), DataEntry::public("true"));

        let changes = changes_between(&before, &after);
        assert_eq!(changes.available_slots, Some(2));
        assert_eq!(changes.participants_joined.len(), 1);
        assert!(changes.participants_left.is_empty());
        assert!(changes.data.added.contains_key("map"));
        assert!(changes.participant_data.contains_key("alice"));
        assert!(changes.name.is_none());

        let mut replayed = before.clone();
        changes.apply_to(&mut replayed);
        assert_eq!(replayed, after);
        assert!(changes_between(&after, &after).is_empty());
    }

    #[test]
    fn public_view_hides_member_data() {
        let mut room = Room::default();
        room.data.insert("map".into(), DataEntry::public("forest"));
        room.data.insert("secret".into(), DataEntry::member("x"));
        let view = public_view(&room);
        assert!(view.data.contains_key("map"));
        assert!(!view.data.contains_key("secret"));
    }

    #[tokio::test]
    async fn join_rejections() {
        let server = MemoryLobbyServer::new();
        let alice = signed_in(&server, "alice").await;
        let bob = signed_in(&server, "bob").await;
        let carol = signed_in(&server, "carol").await;
        let room = create(&alice, 2).await;
        let bob_p = Participant::new("bob", "Bob");
        let carol_p = Participant::new("carol", "Carol");

        let err = bob.join_by_id("missing", &bob_p, None).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::RoomNotFound);

        bob.join_by_id(&room.id, &bob_p, None).await.unwrap();
        let err = bob.join_by_id(&room.id, &bob_p, None).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::AlreadyInRoom);

        let err = carol.join_by_id(&room.id, &carol_p, None).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::RoomFull);
    }

    #[tokio::test]
    async fn only_host_updates_room_and_only_self_updates_participant() {
        let server = MemoryLobbyServer::new();
        let alice = signed_in(&server, "alice").await;
        let bob = signed_in(&server, "bob").await;
        let room = create(&alice, 4).await;
        bob.join_by_id(&room.id, &Participant::new("bob", "Bob"), None)
            .await
            .unwrap();

        let update = RoomUpdate {
            name: "Hijacked".into(),
            max_players: 4,
            host_id: "bob".into(),
            ..RoomUpdate::default()
        };
        let err = bob.update_room(&room.id, update).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::Forbidden);

        let err = bob
            .update_participant(&room.id, "alice", ParticipantUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::Forbidden);

        let err = bob.remove_participant(&room.id, "alice").await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn removal_pushes_kicked_and_migrates_host() {
        let server = MemoryLobbyServer::new();
        let alice = signed_in(&server, "alice").await;
        let bob = signed_in(&server, "bob").await;
        let room = create(&alice, 4).await;
        bob.join_by_id(&room.id, &Participant::new("bob", "Bob"), None)
            .await
            .unwrap();
        let mut bob_events = bob.subscribe(&room.id).await.unwrap();
        assert_eq!(
            bob_events.next_event().await,
            Some(RoomEvent::ConnectionStateChanged(EventConnectionState::Subscribed))
        );

        alice.remove_participant(&room.id, "bob").await.unwrap();
        assert_eq!(bob_events.next_event().await, Some(RoomEvent::Kicked));

        alice.remove_participant(&room.id, "alice").await.unwrap();
        assert!(server.room(&room.id).is_none());
    }

    #[tokio::test]
    async fn caller_does_not_receive_its_own_changes() {
        let server = MemoryLobbyServer::new();
        let alice = signed_in(&server, "alice").await;
        let bob = signed_in(&server, "bob").await;
        let room = create(&alice, 4).await;
        let mut alice_events = alice.subscribe(&room.id).await.unwrap();
        alice_events.next_event().await;

        bob.join_by_id(&room.id, &Participant::new("bob", "Bob"), None)
            .await
            .unwrap();
        match alice_events.next_event().await {
            Some(RoomEvent::Changed(changes)) => {
                assert_eq!(changes.participants_joined.len(), 1);
            }
            other => panic!("expected a diff, got {other:?}"),
        }
        assert!(matches!(
            alice_events.next_event().await,
            Some(RoomEvent::ParticipantsJoined(_))
        ));

        let mut bob_events = bob.subscribe(&room.id).await.unwrap();
        bob_events.next_event().await;
        let mut update = ParticipantUpdate::default();
        update.data.insert("ready".into(), DataEntry::public("true"));
        bob.update_participant(&room.id, "bob", update).await.unwrap();

        assert!(matches!(
            alice_events.next_event().await,
            Some(RoomEvent::Changed(_))
        ));
        let own = tokio::time::timeout(Duration::from_millis(10), bob_events.next_event()).await;
        assert!(own.is_err(), "caller should not see its own change");

        alice_events.unsubscribe().await.unwrap();
        assert_eq!(server.subscriber_count(&room.id), 1);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let server = MemoryLobbyServer::new();
        let alice = signed_in(&server, "alice").await;

        server.fail_next(Operation::Query, ErrorCode::RateLimitExceeded);
        let err = alice.query_rooms(&QueryFilter::default()).await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::RateLimitExceeded);

        server.break_next(Operation::Query);
        let err = alice.query_rooms(&QueryFilter::default()).await.unwrap_err();
        assert!(matches!(err, LobbyError::Transport(_)));

        assert!(alice.query_rooms(&QueryFilter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn unauthenticated_client_is_rejected() {
        let server = MemoryLobbyServer::new();
        let client = server.client();
        let err = client.send_heartbeat("room").await.unwrap_err();
        assert_eq!(code_of(&err), ErrorCode::AuthenticationRequired);
    }
}
