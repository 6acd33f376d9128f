//! The director: at most one active room for this client.
//!
//! [`SessionDirector`] owns the "current session" slot and the cached room
//! directory. Every action has a matching synchronous guard predicate
//! (`can_*`) and re-checks it before doing anything:
//!
//! ```text
//! NoSession ──create / join──► HasSession ──leave / delete / kicked / remote delete──► NoSession
//! ```
//!
//! Actions follow the crate's error contract: a guard that does not hold, a
//! busy governor, or a remote rejection yields `Ok(None)` / `Ok(false)` and is
//! logged. Only transport faults come back as `Err`.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::config::LobbyConfig;
use crate::error::{LobbyError, Result};
use crate::event::{DirectorEvent, EventHub, SessionEvent};
use crate::governor::RequestGovernor;
use crate::model::{CreateRoomOptions, Participant, Room};
use crate::observable::{lock, ListenerId};
use crate::platform::Platform;
use crate::session::{Departure, RoomSession};

/// Handle to the director. Clones share the same state.
#[derive(Clone)]
pub struct SessionDirector {
    inner: Arc<DirectorInner>,
}

struct DirectorInner {
    platform: Arc<Platform>,
    config: LobbyConfig,
    current: Mutex<Option<Current>>,
    queried: Mutex<Vec<Room>>,
    last_query: Mutex<Option<SystemTime>>,
    query_governor: RequestGovernor,
    join_governor: RequestGovernor,
    create_governor: RequestGovernor,
    delete_governor: RequestGovernor,
    events: EventHub<DirectorEvent>,
}

struct Current {
    session: RoomSession,
    listener: ListenerId,
}

/// How a session became current.
#[derive(Clone, Copy)]
enum Entry {
    Created,
    Joined,
}

impl SessionDirector {
    /// Creates a director over an explicitly constructed platform.
    ///
    /// The platform may still be closed; every guard fails until it is open.
    pub fn new(platform: Arc<Platform>, config: LobbyConfig) -> Self {
        let governor = |name| {
            RequestGovernor::with_skew(name, config.request_cooldown, config.cooldown_skew)
        };
        let inner = DirectorInner {
            query_governor: governor("query"),
            join_governor: governor("join"),
            create_governor: governor("create"),
            delete_governor: governor("delete"),
            events: EventHub::new(config.event_channel_capacity),
            platform,
            current: Mutex::new(None),
            queried: Mutex::new(Vec::new()),
            last_query: Mutex::new(None),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// The platform this director acts through.
    pub fn platform(&self) -> &Arc<Platform> {
        &self.inner.platform
    }

    /// The configuration sessions are created with.
    pub fn config(&self) -> &LobbyConfig {
        &self.inner.config
    }

    /// Director events.
    pub fn events(&self) -> &EventHub<DirectorEvent> {
        &self.inner.events
    }

    /// Returns `true` when the service is reachable and the caller is signed in.
    pub fn is_enabled(&self) -> bool {
        self.inner.platform.is_enabled()
    }

    /// Returns `true` while a session is current.
    pub fn is_in_room(&self) -> bool {
        lock(&self.inner.current).is_some()
    }

    /// Returns `true` while a directory query is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.query_governor.is_running()
    }

    /// When the last directory query completed, successfully or not.
    pub fn last_refresh_time(&self) -> Option<SystemTime> {
        *lock(&self.inner.last_query)
    }

    /// The rooms returned by the last query; empty after a failed query.
    pub fn queried_rooms(&self) -> Vec<Room> {
        lock(&self.inner.queried).clone()
    }

    /// The current session, if any.
    pub fn current_session(&self) -> Option<RoomSession> {
        lock(&self.inner.current)
            .as_ref()
            .map(|current| current.session.clone())
    }

    /// Governor of directory queries.
    pub fn query_governor(&self) -> &RequestGovernor {
        &self.inner.query_governor
    }

    /// Governor of joins (by code and by id).
    pub fn join_governor(&self) -> &RequestGovernor {
        &self.inner.join_governor
    }

    /// Governor of room creation.
    pub fn create_governor(&self) -> &RequestGovernor {
        &self.inner.create_governor
    }

    /// Governor of room deletion.
    pub fn delete_governor(&self) -> &RequestGovernor {
        &self.inner.delete_governor
    }

    // ── Guards ──────────────────────────────────────────────────────

    pub fn can_query(&self) -> bool {
        self.is_enabled() && self.inner.query_governor.is_available()
    }

    pub fn can_join_by_code(&self, code: &str) -> bool {
        self.is_enabled()
            && !self.is_in_room()
            && !code.trim().is_empty()
            && !self.inner.join_governor.is_running()
    }

    /// Checks capacity and that a password is supplied when the room has
    /// one. The password itself is validated by the service.
    pub fn can_join(&self, room: &Room, password: Option<&str>) -> bool {
        self.is_enabled()
            && !self.is_in_room()
            && room.available_slots > 0
            && (!room.has_password || password.is_some())
            && !self.inner.join_governor.is_running()
    }

    pub fn can_create(&self) -> bool {
        self.is_enabled() && !self.is_in_room() && self.inner.create_governor.is_available()
    }

    /// Returns `true` if `session` is the current session.
    pub fn can_leave(&self, session: &RoomSession) -> bool {
        self.is_enabled() && self.inner.is_current(session)
    }

    /// Returns `true` if `session` is current and the caller hosts it.
    pub fn can_delete(&self, session: &RoomSession) -> bool {
        self.can_leave(session)
            && session.fields().is_host.get()
            && !self.inner.delete_governor.is_running()
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Refreshes the room directory.
    ///
    /// A completed attempt always replaces the cached list (with an empty
    /// list on failure), records the time and emits
    /// [`DirectorEvent::QueriedListChanged`]. Returns `Ok(None)` without
    /// touching the cache if the guard fails or a query is already running.
    ///
    /// # Errors
    ///
    /// Propagates transport failures after publishing the empty list.
    pub async fn query(&self) -> Result<Option<Vec<Room>>> {
        let inner = &self.inner;
        if !self.can_query() {
            debug!("query not allowed now");
            return Ok(None);
        }

        let outcome = inner
            .query_governor
            .try_run(|| inner.platform.service().query_rooms(&inner.config.query_filter))
            .await;
        let (rooms, result) = match outcome {
            Ok(rooms) => (rooms.clone(), Ok(Some(rooms))),
            Err(LobbyError::AlreadyRunning(_)) => return Ok(None),
            Err(e) if e.is_rejection() => {
                warn!("query failed: {e}");
                (Vec::new(), Ok(None))
            }
            Err(e) => {
                warn!("query failed: {e}");
                (Vec::new(), Err(e))
            }
        };

        debug!("query returned {} rooms", rooms.len());
        *lock(&inner.queried) = rooms;
        *lock(&inner.last_query) = Some(SystemTime::now());
        inner.events.emit(DirectorEvent::QueriedListChanged);
        result
    }

    /// Joins the room with the given code and makes it current.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn join_by_code(
        &self,
        code: &str,
        password: Option<&str>,
    ) -> Result<Option<RoomSession>> {
        let inner = &self.inner;
        if !self.can_join_by_code(code) {
            debug!("join by code not allowed now");
            return Ok(None);
        }
        let Some(participant) = inner.local_participant() else {
            return Ok(None);
        };

        let outcome = inner
            .join_governor
            .try_run(|| {
                inner
                    .platform
                    .service()
                    .join_by_code(code.trim(), &participant, password)
            })
            .await;
        let Some(room) = settle("join", outcome)? else {
            return Ok(None);
        };
        Ok(inner.install(room, participant.id, Entry::Joined, password).await)
    }

    /// Joins a room from the directory and makes it current.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn join(&self, room: &Room, password: Option<&str>) -> Result<Option<RoomSession>> {
        let inner = &self.inner;
        if !self.can_join(room, password) {
            debug!("join of room {} not allowed now", room.id);
            return Ok(None);
        }
        let Some(participant) = inner.local_participant() else {
            return Ok(None);
        };

        let outcome = inner
            .join_governor
            .try_run(|| {
                inner
                    .platform
                    .service()
                    .join_by_id(&room.id, &participant, password)
            })
            .await;
        let Some(room) = settle("join", outcome)? else {
            return Ok(None);
        };
        Ok(inner.install(room, participant.id, Entry::Joined, password).await)
    }

    /// Creates a room with the configured capacity and makes it current.
    ///
    /// The caller's id is stored in the creator-identity metadata slot.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn create(
        &self,
        name: &str,
        is_private: bool,
        password: Option<&str>,
    ) -> Result<Option<RoomSession>> {
        let inner = &self.inner;
        if !self.can_create() {
            debug!("create not allowed now");
            return Ok(None);
        }
        let Some(participant) = inner.local_participant() else {
            return Ok(None);
        };

        let mut options = CreateRoomOptions {
            participant: Some(participant.clone()),
            is_private,
            password: password.map(str::to_string),
            ..CreateRoomOptions::default()
        };
        options.set_creator_id(&participant.id);

        let outcome = inner
            .create_governor
            .try_run(|| {
                inner
                    .platform
                    .service()
                    .create_room(name, inner.config.max_players, options)
            })
            .await;
        let Some(room) = settle("create", outcome)? else {
            return Ok(None);
        };
        Ok(inner.install(room, participant.id, Entry::Created, password).await)
    }

    /// Leaves `session` remotely, tears it down and clears it.
    ///
    /// A service answer that the caller is already gone counts as success.
    /// Returns `false` if `session` is not current or the service refused.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; the session stays current.
    pub async fn leave(&self, session: &RoomSession) -> Result<bool> {
        let inner = &self.inner;
        if !self.can_leave(session) {
            debug!("leave of room {} not allowed now", session.id());
            return Ok(false);
        }

        let outcome = inner
            .platform
            .service()
            .remove_participant(session.id(), session.local_participant_id())
            .await;
        if !departed("leave", outcome)? {
            return Ok(false);
        }

        inner.discard(session, Departure::Left).await;
        inner.events.emit(DirectorEvent::Left(session.id().to_string()));
        Ok(true)
    }

    /// Deletes the hosted room `session`, tears it down and clears it.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; the session stays current.
    pub async fn delete(&self, session: &RoomSession) -> Result<bool> {
        let inner = &self.inner;
        if !self.can_delete(session) {
            debug!("delete of room {} not allowed now", session.id());
            return Ok(false);
        }

        let outcome = inner
            .delete_governor
            .try_run(|| inner.platform.service().delete_room(session.id()))
            .await;
        if !departed("delete", outcome)? {
            return Ok(false);
        }

        inner.discard(session, Departure::RoomDeleted).await;
        inner
            .events
            .emit(DirectorEvent::Deleted(session.id().to_string()));
        Ok(true)
    }

    /// Tears down and clears the current session without telling the service.
    pub async fn close(&self) {
        let Some(session) = self.current_session() else {
            return;
        };
        debug!("closing director, dropping room {}", session.id());
        session.shutdown().await;
        self.inner.clear_if_current(&session);
    }
}

impl fmt::Debug for SessionDirector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDirector")
            .field("enabled", &self.is_enabled())
            .field("current", &self.current_session())
            .field("queried", &lock(&self.inner.queried).len())
            .finish()
    }
}

impl DirectorInner {
    fn local_participant(&self) -> Option<Participant> {
        let id = self.platform.local_participant_id();
        if id.is_none() {
            debug!("no local participant id");
        }
        id.map(|id| Participant::new(id, self.config.display_name.clone()))
    }

    fn is_current(&self, session: &RoomSession) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|current| current.session.ptr_eq(session))
    }

    /// Makes a freshly joined or created room current.
    ///
    /// If another session became current while the request was in flight
    /// the newcomer is torn down and the caller leaves that room again.
    async fn install(
        self: &Arc<Self>,
        room: Room,
        local_id: String,
        entry: Entry,
        password: Option<&str>,
    ) -> Option<RoomSession> {
        let session = RoomSession::new(
            room,
            local_id,
            Arc::clone(self.platform.service()),
            &self.config,
        );
        session.remember_password(password);

        if !self.try_set_current(&session) {
            warn!(
                "room {} entered while another session is current; leaving it",
                session.id()
            );
            session.depart(Departure::Left);
            session.shutdown().await;
            if let Err(e) = self
                .platform
                .service()
                .remove_participant(session.id(), session.local_participant_id())
                .await
            {
                warn!("failed to leave room {}: {e}", session.id());
            }
            return None;
        }

        debug!("room {} is now current", session.id());
        self.events.emit(match entry {
            Entry::Created => DirectorEvent::Created(session.clone()),
            Entry::Joined => DirectorEvent::Joined(session.clone()),
        });
        Some(session)
    }

    /// Installs `session` if the slot is empty; emits
    /// [`DirectorEvent::CurrentSessionChanged`] on success.
    fn try_set_current(self: &Arc<Self>, session: &RoomSession) -> bool {
        {
            let mut current = lock(&self.current);
            if current.is_some() {
                return false;
            }
            let listener = self.hook(session);
            *current = Some(Current {
                session: session.clone(),
                listener,
            });
        }
        self.events.emit(DirectorEvent::CurrentSessionChanged);
        true
    }

    /// Clears the slot if it still holds `session`; emits
    /// [`DirectorEvent::CurrentSessionChanged`] when it did.
    fn clear_if_current(&self, session: &RoomSession) -> bool {
        let previous = {
            let mut current = lock(&self.current);
            match current.as_ref() {
                Some(c) if c.session.ptr_eq(session) => current.take(),
                _ => None,
            }
        };
        let Some(previous) = previous else {
            return false;
        };
        previous.session.events().unlisten(previous.listener);
        self.events.emit(DirectorEvent::CurrentSessionChanged);
        true
    }

    /// Follows the session's own removal events.
    fn hook(self: &Arc<Self>, session: &RoomSession) -> ListenerId {
        let director: Weak<Self> = Arc::downgrade(self);
        let instance = session.instance();
        session.events().listen(move |event| {
            if !matches!(event, SessionEvent::Deleted | SessionEvent::Kicked) {
                return;
            }
            if let Some(director) = director.upgrade() {
                director.on_session_removed(instance, event);
            }
        })
    }

    fn on_session_removed(&self, instance: u64, event: &SessionEvent) {
        let session = {
            let current = lock(&self.current);
            match current.as_ref() {
                Some(c) if c.session.instance() == instance => c.session.clone(),
                _ => return,
            }
        };
        debug!("room {}: {event:?}, clearing current session", session.id());
        self.clear_if_current(&session);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { session.shutdown().await });
            }
            Err(_) => warn!("no tokio runtime, room {} not shut down", session.id()),
        }
    }

    /// Tears `session` down after a successful local departure, then clears it.
    async fn discard(&self, session: &RoomSession, departure: Departure) {
        session.depart(departure);
        session.shutdown().await;
        self.clear_if_current(session);
    }
}

/// Maps rejections to `Ok(None)` and logs them.
fn settle<T>(action: &str, outcome: Result<T>) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_rejection() => {
            warn!("{action} failed: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Returns `true` if the caller is out of the room, including when the
/// service reports it was already gone.
fn departed(action: &str, outcome: Result<()>) -> Result<bool> {
    match outcome {
        Err(e) if e.error_code().is_some_and(|code| code.means_departed()) => {
            debug!("{action}: already gone ({e})");
            Ok(true)
        }
        outcome => Ok(settle(action, outcome)?.is_some()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCode;

    #[test]
    fn settle_maps_rejections_to_none() {
        assert_eq!(settle("x", Ok(3)).unwrap(), Some(3));
        assert_eq!(
            settle::<u8>("x", Err(LobbyError::rejected(ErrorCode::RoomFull))).unwrap(),
            None
        );
        assert_eq!(
            settle::<u8>("x", Err(LobbyError::AlreadyRunning("join"))).unwrap(),
            None
        );
        assert!(settle::<u8>("x", Err(LobbyError::Transport("reset".into()))).is_err());
    }

    #[test]
    fn departed_accepts_already_gone() {
        assert!(departed("leave", Ok(())).unwrap());
        assert!(departed("leave", Err(LobbyError::rejected(ErrorCode::NotInRoom))).unwrap());
        assert!(departed("leave", Err(LobbyError::rejected(ErrorCode::RoomNotFound))).unwrap());
        assert!(!departed("leave", Err(LobbyError::rejected(ErrorCode::RateLimitExceeded))).unwrap());
        assert!(departed("leave", Err(LobbyError::Transport("reset".into()))).is_err());
    }
}
