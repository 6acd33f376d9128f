//! Data model of the remote lobby service.
//!
//! A [`Room`] is one immutable snapshot of the server-side entity. Updates
//! arrive either as a complete authoritative snapshot (responses to local
//! mutations) or as a [`RoomChanges`] diff pushed by the service.
//!
//! Identifiers are opaque strings owned by the service.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Identifier of a participant, supplied by the identity provider.
pub type ParticipantId = String;

/// Identifier of a room, supplied by the lobby service.
pub type RoomId = String;

/// Metadata key holding the id of the participant that created the room.
///
/// The service's host id can be transferred; the creator id never changes.
pub const CREATOR_ID_KEY: &str = "creator-id";

/// Metadata entries keyed by name.
pub type DataMap = BTreeMap<String, DataEntry>;

// ── Enums ───────────────────────────────────────────────────────────

/// Who may read a metadata entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to everyone, including directory queries.
    #[default]
    Public,
    /// Visible to room members only.
    Member,
    /// Visible to the owning participant only (participant entries).
    Private,
}

/// State of the push-event channel of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventConnectionState {
    /// No subscription is open.
    #[default]
    Unsubscribed,
    /// A subscription is being established.
    Subscribing,
    /// Events are being delivered.
    Subscribed,
    /// The channel is up but events may have been missed.
    Unsynced,
    /// The subscription failed.
    Error,
}

// ── Structs ─────────────────────────────────────────────────────────

/// A metadata value and its visibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataEntry {
    pub value: String,
    #[serde(default)]
    pub visibility: Visibility,
}

impl DataEntry {
    /// Creates an entry with explicit visibility.
    pub fn new(value: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            value: value.into(),
            visibility,
        }
    }

    /// Creates a publicly visible entry.
    pub fn public(value: impl Into<String>) -> Self {
        Self::new(value, Visibility::Public)
    }

    /// Creates a member-only entry.
    pub fn member(value: impl Into<String>) -> Self {
        Self::new(value, Visibility::Member)
    }
}

/// Display profile of a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ParticipantProfile {
    pub name: String,
}

/// One member of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ParticipantProfile>,
    #[serde(default)]
    pub data: DataMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<SystemTime>,
}

impl Participant {
    /// Creates a participant descriptor with a display name.
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profile: Some(ParticipantProfile { name: name.into() }),
            data: DataMap::new(),
            joined: None,
            last_updated: None,
        }
    }

    /// Display name, if a profile is present.
    pub fn name(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.name.as_str())
    }
}

/// Snapshot of a remote room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    /// Short code other clients use to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub name: String,
    pub host_id: ParticipantId,
    pub max_players: u32,
    pub available_slots: u32,
    pub is_private: bool,
    pub is_locked: bool,
    pub has_password: bool,
    pub created: SystemTime,
    pub last_updated: SystemTime,
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl Default for Room {
    fn default() -> Self {
        Self {
            id: RoomId::new(),
            code: None,
            name: String::new(),
            host_id: ParticipantId::new(),
            max_players: 0,
            available_slots: 0,
            is_private: false,
            is_locked: false,
            has_password: false,
            created: SystemTime::UNIX_EPOCH,
            last_updated: SystemTime::UNIX_EPOCH,
            data: DataMap::new(),
            participants: Vec::new(),
        }
    }
}

impl Room {
    /// Id of the participant that created the room, read from [`CREATOR_ID_KEY`].
    pub fn creator_id(&self) -> Option<&str> {
        self.data.get(CREATOR_ID_KEY).map(|entry| entry.value.as_str())
    }

    /// Looks up a participant by id.
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Returns `true` if `id` is in the participant set.
    pub fn has_participant(&self, id: &str) -> bool {
        self.participant(id).is_some()
    }

    /// Pretty JSON of the room-level metadata, for diagnostics.
    pub fn dump_data(&self) -> String {
        serde_json::to_string_pretty(&self.data).unwrap_or_else(|e| format!("<unprintable: {e}>"))
    }

    /// Pretty JSON of every participant's id, profile and metadata, for diagnostics.
    pub fn dump_participant_data(&self) -> String {
        serde_json::to_string_pretty(&self.participants)
            .unwrap_or_else(|e| format!("<unprintable: {e}>"))
    }

    fn recompute_available_slots(&mut self) {
        let occupied = u32::try_from(self.participants.len()).unwrap_or(u32::MAX);
        self.available_slots = self.max_players.saturating_sub(occupied);
    }
}

// ── Diffs ───────────────────────────────────────────────────────────

/// Added, changed and removed entries of one metadata map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MapChanges {
    #[serde(default)]
    pub added: DataMap,
    #[serde(default)]
    pub changed: DataMap,
    #[serde(default)]
    pub removed: BTreeSet<String>,
}

impl MapChanges {
    /// Computes the changes that turn `old` into `new`.
    pub fn between(old: &DataMap, new: &DataMap) -> Self {
        let mut changes = Self::default();
        for (key, entry) in new {
            match old.get(key) {
                None => {
                    changes.added.insert(key.clone(), entry.clone());
                }
                Some(previous) if previous != entry => {
                    changes.changed.insert(key.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                changes.removed.insert(key.clone());
            }
        }
        changes
    }

    /// Returns `true` if no entry was added, changed or removed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Applies the changes to `map`.
    pub fn apply_to(&self, map: &mut DataMap) {
        for (key, entry) in self.added.iter().chain(self.changed.iter()) {
            map.insert(key.clone(), entry.clone());
        }
        for key in &self.removed {
            map.remove(key);
        }
    }
}

/// A service-pushed description of what changed in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_slots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_password: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<SystemTime>,
    #[serde(default)]
    pub data: MapChanges,
    #[serde(default)]
    pub participants_joined: Vec<Participant>,
    #[serde(default)]
    pub participants_left: Vec<ParticipantId>,
    #[serde(default)]
    pub participant_data: BTreeMap<ParticipantId, MapChanges>,
}

impl RoomChanges {
    /// Returns `true` if any participant's metadata changed.
    pub fn has_participant_data_changes(&self) -> bool {
        self.participant_data.values().any(|c| !c.is_empty())
    }

    /// Returns `true` if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Applies the diff to `room` in place.
    ///
    /// When participants joined or left and the diff carries no explicit slot
    /// count, `available_slots` is recomputed from the capacity.
    pub fn apply_to(&self, room: &mut Room) {
        if let Some(name) = &self.name {
            room.name.clone_from(name);
        }
        if let Some(host_id) = &self.host_id {
            room.host_id.clone_from(host_id);
        }
        if let Some(max_players) = self.max_players {
            room.max_players = max_players;
        }
        if let Some(is_private) = self.is_private {
            room.is_private = is_private;
        }
        if let Some(is_locked) = self.is_locked {
            room.is_locked = is_locked;
        }
        if let Some(has_password) = self.has_password {
            room.has_password = has_password;
        }
        if let Some(last_updated) = self.last_updated {
            room.last_updated = last_updated;
        }

        self.data.apply_to(&mut room.data);

        let membership_changed =
            !self.participants_joined.is_empty() || !self.participants_left.is_empty();
        for joined in &self.participants_joined {
            match room.participants.iter_mut().find(|p| p.id == joined.id) {
                Some(existing) => *existing = joined.clone(),
                None => room.participants.push(joined.clone()),
            }
        }
        room.participants
            .retain(|p| !self.participants_left.contains(&p.id));

        for (participant_id, changes) in &self.participant_data {
            if let Some(participant) = room
                .participants
                .iter_mut()
                .find(|p| &p.id == participant_id)
            {
                changes.apply_to(&mut participant.data);
            }
        }

        match self.available_slots {
            Some(slots) => room.available_slots = slots,
            None if membership_changed || self.max_players.is_some() => {
                room.recompute_available_slots();
            }
            None => {}
        }
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// Filter for directory queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryFilter {
    /// Only rooms whose name contains this text (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,
    /// Only rooms with at least this many free slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available_slots: Option<u32>,
    /// Maximum number of rooms to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl QueryFilter {
    /// Returns `true` if `room` passes the name and slot filters.
    pub fn matches(&self, room: &Room) -> bool {
        let name_ok = self.name_contains.as_ref().is_none_or(|needle| {
            room.name
                .to_lowercase()
                .contains(needle.to_lowercase().as_str())
        });
        let slots_ok = self
            .min_available_slots
            .is_none_or(|min| room.available_slots >= min);
        name_ok && slots_ok
    }
}

/// Options for creating a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CreateRoomOptions {
    /// The creating participant, who becomes host and first member.
    pub participant: Option<Participant>,
    pub is_private: bool,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub data: DataMap,
}

impl CreateRoomOptions {
    /// Stores `creator` in the creator-identity metadata slot (member visibility).
    pub fn set_creator_id(&mut self, creator: &str) {
        self.data
            .insert(CREATOR_ID_KEY.to_string(), DataEntry::member(creator));
    }
}

/// Full room settings sent with an update. Unspecified settings carry the
/// current cached values.
///
/// The password is the exception: the client may not know it, so `None`
/// keeps the stored password unless `clear_password` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoomUpdate {
    pub name: String,
    pub max_players: u32,
    pub is_private: bool,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub clear_password: bool,
    pub host_id: ParticipantId,
    #[serde(default)]
    pub data: DataMap,
}

/// Participant metadata sent with an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ParticipantUpdate {
    #[serde(default)]
    pub data: DataMap,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn room_with(participants: &[&str], max_players: u32) -> Room {
        let mut room = Room {
            id: "room-1".into(),
            name: "Test".into(),
            host_id: participants.first().map(|p| p.to_string()).unwrap_or_default(),
            max_players,
            participants: participants
                .iter()
                .map(|id| Participant::new(*id, *id))
                .collect(),
            ..Room::default()
        };
        room.recompute_available_slots();
        room
    }

    #[test]
    fn creator_id_comes_from_metadata_slot() {
        let mut options = CreateRoomOptions::default();
        options.set_creator_id("alice");
        let room = Room {
            data: options.data.clone(),
            ..Room::default()
        };

        assert_eq!(room.creator_id(), Some("alice"));
        assert_eq!(
            options.data[CREATOR_ID_KEY].visibility,
            Visibility::Member
        );
        assert_eq!(Room::default().creator_id(), None);
    }

    #[test]
    fn map_changes_between_and_apply() {
        let mut old = DataMap::new();
        old.insert("map".into(), DataEntry::public("forest"));
        old.insert("mode".into(), DataEntry::public("ffa"));
        let mut new = DataMap::new();
        new.insert("map".into(), DataEntry::public("desert"));
        new.insert("round".into(), DataEntry::member("3"));

        let changes = MapChanges::between(&old, &new);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.changed.len(), 1);
        assert!(changes.removed.contains("mode"));

        let mut applied = old.clone();
        changes.apply_to(&mut applied);
        assert_eq!(applied, new);
        assert!(MapChanges::between(&new, &new).is_empty());
    }

    #[test]
    fn apply_recomputes_slots_on_membership_change() {
        let mut room = room_with(&["alice"], 4);
        assert_eq!(room.available_slots, 3);

        let changes = RoomChanges {
            participants_joined: vec![Participant::new("bob", "Bob"), Participant::new("cat", "Cat")],
            ..RoomChanges::default()
        };
        changes.apply_to(&mut room);
        assert_eq!(room.participants.len(), 3);
        assert_eq!(room.available_slots, 1);

        let changes = RoomChanges {
            participants_left: vec!["alice".into()],
            host_id: Some("bob".into()),
            ..RoomChanges::default()
        };
        changes.apply_to(&mut room);
        assert!(!room.has_participant("alice"));
        assert_eq!(room.host_id, "bob");
        assert_eq!(room.available_slots, 2);
    }

    #[test]
    fn explicit_slot_count_wins() {
        let mut room = room_with(&["alice"], 4);
        RoomChanges {
            participants_joined: vec![Participant::new("bob", "Bob")],
            available_slots: Some(0),
            ..RoomChanges::default()
        }
        .apply_to(&mut room);
        assert_eq!(room.available_slots, 0);
    }

    #[test]
    fn rejoining_participant_replaces_entry() {
        let mut room = room_with(&["alice", "bob"], 4);
        let mut bob = Participant::new("bob", "Bobby");
        bob.data.insert("ready".into(), DataEntry::public("true"));
        RoomChanges {
            participants_joined: vec![bob],
            ..RoomChanges::default()
        }
        .apply_to(&mut room);

        assert_eq!(room.participants.len(), 2);
        assert_eq!(room.participant("bob").unwrap().name(), Some("Bobby"));
    }

    #[test]
    fn participant_data_changes_target_one_participant() {
        let mut room = room_with(&["alice", "bob"], 4);
        let mut changes = RoomChanges::default();
        let mut bob_changes = MapChanges::default();
        bob_changes
            .added
            .insert("color".into(), DataEntry::public("red"));
        changes.participant_data.insert("bob".into(), bob_changes);
        changes.participant_data.insert("ghost".into(), MapChanges::default());

        assert!(changes.has_participant_data_changes());
        changes.apply_to(&mut room);

        assert_eq!(room.participant("bob").unwrap().data["color"].value, "red");
        assert!(room.participant("alice").unwrap().data.is_empty());
    }

    #[test]
    fn query_filter_matches() {
        let room = room_with(&["alice"], 4);
        assert!(QueryFilter::default().matches(&room));
        let by_name = QueryFilter {
            name_contains: Some("tes".into()),
            ..QueryFilter::default()
        };
        assert!(by_name.matches(&room));
        let by_slots = QueryFilter {
            min_available_slots: Some(4),
            ..QueryFilter::default()
        };
        assert!(!by_slots.matches(&room));
    }

    #[test]
    fn empty_diff() {
        assert!(RoomChanges::default().is_empty());
        assert!(!RoomChanges::default().has_participant_data_changes());
    }
}
