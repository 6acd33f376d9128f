//! One joined room and its live synchronization.
//!
//! A [`RoomSession`] owns the cached [`Room`] snapshot of a room the local
//! participant belongs to and keeps it converged with the service:
//!
//! - local mutations go through per-session [`RequestGovernor`]s and replace
//!   the cache with the authoritative snapshot the service returns;
//! - pushed [`RoomChanges`] diffs are applied in arrival order;
//! - while the local participant is a member, a heartbeat loop and an event
//!   listener run in the background. Both stop as soon as membership ends
//!   and no diff is applied after that point.
//!
//! Every derived value is exposed as an [`Observable`] in [`SessionFields`];
//! events are published on [`RoomSession::events`].
//!
//! # Lifecycle
//!
//! ```text
//! new ──► member? ──yes──► heartbeat + listener running
//!            │                       │ kicked / deleted / left / shutdown
//!            no                      ▼
//!            └──────────────► inactive (diffs dropped)
//! ```
//!
//! Background work is spawned on the ambient tokio runtime. A session created
//! outside a runtime never becomes active.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::LobbyConfig;
use crate::error::Result;
use crate::error_codes::ErrorCode;
use crate::event::{EventHub, SessionEvent};
use crate::governor::RequestGovernor;
use crate::model::{
    DataMap, EventConnectionState, ParticipantId, ParticipantUpdate, Room, RoomChanges, RoomId,
    RoomUpdate,
};
use crate::observable::{lock, Observable};
use crate::service::{LobbyService, RoomEvent};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

// ── Fields ──────────────────────────────────────────────────────────

/// Observable view of a session's state.
///
/// Membership flags are derived from the cached snapshot and the local
/// participant id. `password` is never reported by the service; it holds the
/// password this client created or joined the room with, or last set.
///
/// Field listeners run while the session applies an update. They may read
/// the session but must not call [`RoomSession::reconcile`] or start a
/// mutation synchronously; session events are the place for that.
#[derive(Debug)]
pub struct SessionFields {
    pub is_member: Observable<bool>,
    pub is_host: Observable<bool>,
    pub is_creator: Observable<bool>,
    pub host_id: Observable<ParticipantId>,
    pub creator_id: Observable<Option<ParticipantId>>,
    pub connection_state: Observable<EventConnectionState>,
    pub name: Observable<String>,
    pub available_slots: Observable<u32>,
    pub max_players: Observable<u32>,
    pub is_locked: Observable<bool>,
    pub is_private: Observable<bool>,
    pub has_password: Observable<bool>,
    pub password: Observable<Option<String>>,
    pub created: Observable<SystemTime>,
    pub last_updated: Observable<SystemTime>,
}

impl SessionFields {
    fn from_room(room: &Room) -> Self {
        Self {
            is_member: Observable::new(false),
            is_host: Observable::new(false),
            is_creator: Observable::new(false),
            host_id: Observable::new(room.host_id.clone()),
            creator_id: Observable::new(room.creator_id().map(str::to_string)),
            connection_state: Observable::default(),
            name: Observable::new(room.name.clone()),
            available_slots: Observable::new(room.available_slots),
            max_players: Observable::new(room.max_players),
            is_locked: Observable::new(room.is_locked),
            is_private: Observable::new(room.is_private),
            has_password: Observable::new(room.has_password),
            password: Observable::new(None),
            created: Observable::new(room.created),
            last_updated: Observable::new(room.last_updated),
        }
    }

    fn sync(&self, room: &Room) {
        self.host_id.set(room.host_id.clone());
        self.creator_id.set(room.creator_id().map(str::to_string));
        self.name.set(room.name.clone());
        self.available_slots.set(room.available_slots);
        self.max_players.set(room.max_players);
        self.is_locked.set(room.is_locked);
        self.is_private.set(room.is_private);
        self.has_password.set(room.has_password);
        self.created.set(room.created);
        self.last_updated.set(room.last_updated);
    }
}

// ── Mutations ───────────────────────────────────────────────────────

/// Room settings and metadata to change. `None` keeps the cached value.
///
/// Metadata entries are merged over the cached room metadata. A new
/// `password` wins over `clear_password`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub max_players: Option<u32>,
    pub is_private: Option<bool>,
    pub is_locked: Option<bool>,
    pub password: Option<String>,
    pub clear_password: bool,
    pub host_id: Option<ParticipantId>,
    pub data: DataMap,
}

impl RoomPatch {
    /// A patch that only merges metadata.
    pub fn data(data: DataMap) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Returns `true` if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A local mutation of the session's room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMutation {
    /// Change room settings or room-level metadata.
    Room(RoomPatch),
    /// Merge entries into the local participant's metadata.
    Participant(DataMap),
}

impl LocalMutation {
    fn is_empty(&self) -> bool {
        match self {
            Self::Room(patch) => patch.is_empty(),
            Self::Participant(data) => data.is_empty(),
        }
    }
}

/// How the local participant stopped being a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
    /// Only the local participant is gone.
    Left,
    /// The whole room is gone.
    RoomDeleted,
}

// ── Session ─────────────────────────────────────────────────────────

/// Handle to one joined room. Clones share the same session.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    instance: u64,
    room_id: RoomId,
    local_id: ParticipantId,
    service: Arc<dyn LobbyService>,
    heartbeat_grace: Duration,
    heartbeat_interval: Duration,
    shutdown_timeout: Duration,
    room: Mutex<Room>,
    fields: SessionFields,
    events: EventHub<SessionEvent>,
    update_room_governor: RequestGovernor,
    update_participant_governor: RequestGovernor,
    heartbeat_governor: Arc<RequestGovernor>,
    /// Serializes snapshot replacement, field derivation and event emission.
    apply: Mutex<()>,
    liveness: Mutex<Liveness>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Liveness {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomSession {
    /// Wraps a freshly joined or created room.
    ///
    /// If `local_id` is among the room's participants the heartbeat and event
    /// listener start immediately.
    pub fn new(
        room: Room,
        local_id: impl Into<ParticipantId>,
        service: Arc<dyn LobbyService>,
        config: &LobbyConfig,
    ) -> Self {
        let request = |name| {
            RequestGovernor::with_skew(name, config.request_cooldown, config.cooldown_skew)
        };
        let inner = Arc::new(SessionInner {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            room_id: room.id.clone(),
            local_id: local_id.into(),
            service,
            heartbeat_grace: config.heartbeat_grace,
            heartbeat_interval: config.heartbeat_interval,
            shutdown_timeout: config.shutdown_timeout,
            fields: SessionFields::from_room(&room),
            room: Mutex::new(room),
            events: EventHub::new(config.event_channel_capacity),
            update_room_governor: request("update room"),
            update_participant_governor: request("update participant"),
            heartbeat_governor: Arc::new(RequestGovernor::with_skew(
                "heartbeat",
                config.heartbeat_cooldown,
                config.cooldown_skew,
            )),
            apply: Mutex::new(()),
            liveness: Mutex::new(Liveness::default()),
            closed: AtomicBool::new(false),
        });
        inner.update_membership();
        debug!(
            "session for room {} created (member: {})",
            inner.room_id,
            inner.fields.is_member.get()
        );
        Self { inner }
    }

    /// The room id.
    pub fn id(&self) -> &str {
        &self.inner.room_id
    }

    /// The participant this session acts for.
    pub fn local_participant_id(&self) -> &str {
        &self.inner.local_id
    }

    /// A copy of the cached room snapshot.
    pub fn room(&self) -> Room {
        lock(&self.inner.room).clone()
    }

    /// Observable derived state.
    pub fn fields(&self) -> &SessionFields {
        &self.inner.fields
    }

    /// Session events.
    pub fn events(&self) -> &EventHub<SessionEvent> {
        &self.inner.events
    }

    /// Returns `true` while background work runs and diffs are applied.
    pub fn is_active(&self) -> bool {
        self.inner.is_accepting()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Returns `true` if both handles refer to the same session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Governor of room updates.
    pub fn update_room_governor(&self) -> &RequestGovernor {
        &self.inner.update_room_governor
    }

    /// Governor of participant updates.
    pub fn update_participant_governor(&self) -> &RequestGovernor {
        &self.inner.update_participant_governor
    }

    /// Governor of heartbeats.
    pub fn heartbeat_governor(&self) -> &RequestGovernor {
        &self.inner.heartbeat_governor
    }

    pub(crate) fn instance(&self) -> u64 {
        self.inner.instance
    }

    /// Changes room settings or metadata. `None` re-fetches the room
    /// without changing anything.
    ///
    /// # Errors
    ///
    /// See [`apply_local_mutation`](Self::apply_local_mutation).
    pub async fn update_room(&self, patch: Option<RoomPatch>) -> Result<Option<Room>> {
        self.apply_local_mutation(LocalMutation::Room(patch.unwrap_or_default()))
            .await
    }

    /// Merges entries into the room-level metadata. `None` resyncs the
    /// cached room without firing [`SessionEvent::LobbyDataChanged`].
    ///
    /// # Errors
    ///
    /// See [`apply_local_mutation`](Self::apply_local_mutation).
    pub async fn update_room_data(&self, data: Option<DataMap>) -> Result<Option<Room>> {
        self.update_room(data.map(RoomPatch::data)).await
    }

    /// Merges entries into the local participant's metadata.
    ///
    /// # Errors
    ///
    /// See [`apply_local_mutation`](Self::apply_local_mutation).
    pub async fn update_participant_data(&self, data: DataMap) -> Result<Option<Room>> {
        self.apply_local_mutation(LocalMutation::Participant(data))
            .await
    }

    /// Sends a mutation through its governor and adopts the returned snapshot.
    ///
    /// Returns `Ok(None)` if the session is inactive, the governor is busy,
    /// the service rejected the request, or the session was torn down while
    /// the request was in flight. The cached room is unchanged in all of
    /// these cases.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; the cached room is left unchanged.
    pub async fn apply_local_mutation(&self, mutation: LocalMutation) -> Result<Option<Room>> {
        let inner = &self.inner;
        if !inner.is_accepting() {
            debug!("room {}: session inactive, mutation ignored", inner.room_id);
            return Ok(None);
        }

        let outcome = match &mutation {
            LocalMutation::Room(patch) => {
                let update = inner.room_update(patch);
                inner
                    .update_room_governor
                    .try_run(|| inner.service.update_room(&inner.room_id, update))
                    .await
            }
            LocalMutation::Participant(data) => {
                let update = inner.participant_update(data);
                inner
                    .update_participant_governor
                    .try_run(|| {
                        inner
                            .service
                            .update_participant(&inner.room_id, &inner.local_id, update)
                    })
                    .await
            }
        };

        let room = match outcome {
            Ok(room) => room,
            Err(e) if e.is_rejection() => {
                warn!("room {}: update rejected: {e}", inner.room_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let applying = lock(&inner.apply);
        if !inner.is_accepting() {
            debug!(
                "room {}: session torn down while updating, response dropped",
                inner.room_id
            );
            return Ok(None);
        }
        if let LocalMutation::Room(patch) = &mutation {
            match &patch.password {
                Some(password) => {
                    inner.fields.password.set(Some(password.clone()));
                }
                None if patch.clear_password => {
                    inner.fields.password.set(None);
                }
                None => {}
            }
        }
        *lock(&inner.room) = room.clone();
        inner.fields.sync(&room);
        inner.update_membership();
        drop(applying);

        if !mutation.is_empty() {
            inner.events.emit(match mutation {
                LocalMutation::Room(_) => SessionEvent::LobbyDataChanged,
                LocalMutation::Participant(_) => SessionEvent::PlayerDataChanged,
            });
        }
        Ok(Some(room))
    }

    /// Applies a service-pushed diff to the cached room.
    ///
    /// Returns `false` if the session is inactive and the diff was dropped.
    pub fn reconcile(&self, changes: &RoomChanges) -> bool {
        self.inner.reconcile(changes)
    }

    /// Re-derives the membership flags from the cached room and starts or
    /// stops the background work accordingly.
    pub fn update_membership(&self) {
        self.inner.update_membership();
    }

    /// Seeds the session-local password with the one the room was entered
    /// with.
    pub(crate) fn remember_password(&self, password: Option<&str>) {
        if let Some(password) = password {
            self.inner.fields.password.set(Some(password.to_string()));
        }
    }

    /// Records a local departure without emitting session events.
    pub(crate) fn depart(&self, departure: Departure) {
        self.inner.remove_local(departure, None);
    }

    /// Stops the background work and waits for it to finish.
    ///
    /// Each task gets the configured shutdown timeout and is aborted when it
    /// expires. After shutdown the session applies no further diffs or
    /// mutation responses and never restarts. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        let tasks = {
            let mut liveness = lock(&inner.liveness);
            if let Some(cancel) = liveness.cancel.take() {
                cancel.cancel();
            }
            std::mem::take(&mut liveness.tasks)
        };
        if tasks.is_empty() {
            return;
        }
        debug!("room {}: shutting down session", inner.room_id);

        for mut task in tasks {
            match tokio::time::timeout(inner.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("room {}: session task failed: {join_err}", inner.room_id);
                }
                Err(_) => {
                    warn!(
                        "room {}: session task did not exit within timeout; aborting",
                        inner.room_id
                    );
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("room {}: session task aborted: {join_err}", inner.room_id);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.inner.room_id)
            .field("local_id", &self.inner.local_id)
            .field("is_member", &self.inner.fields.is_member.get())
            .field("active", &self.inner.is_accepting())
            .finish()
    }
}

impl SessionInner {
    fn is_accepting(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && lock(&self.liveness)
                .cancel
                .as_ref()
                .is_some_and(|cancel| !cancel.is_cancelled())
    }

    fn room_update(&self, patch: &RoomPatch) -> RoomUpdate {
        let room = lock(&self.room);
        let mut data = room.data.clone();
        data.extend(patch.data.clone());
        RoomUpdate {
            name: patch.name.clone().unwrap_or_else(|| room.name.clone()),
            max_players: patch.max_players.unwrap_or(room.max_players),
            is_private: patch.is_private.unwrap_or(room.is_private),
            is_locked: patch.is_locked.unwrap_or(room.is_locked),
            password: patch.password.clone(),
            clear_password: patch.clear_password && patch.password.is_none(),
            host_id: patch.host_id.clone().unwrap_or_else(|| room.host_id.clone()),
            data,
        }
    }

    fn participant_update(&self, patch: &DataMap) -> ParticipantUpdate {
        let room = lock(&self.room);
        let mut data = room
            .participant(&self.local_id)
            .map(|p| p.data.clone())
            .unwrap_or_default();
        data.extend(patch.clone());
        ParticipantUpdate { data }
    }

    fn reconcile(self: &Arc<Self>, changes: &RoomChanges) -> bool {
        let applying = lock(&self.apply);
        if !self.is_accepting() {
            debug!("room {}: diff arrived after teardown, dropped", self.room_id);
            return false;
        }
        let snapshot = {
            let mut room = lock(&self.room);
            changes.apply_to(&mut room);
            room.clone()
        };
        trace!("room {}: applied diff", self.room_id);
        self.fields.sync(&snapshot);
        self.update_membership();
        drop(applying);

        if !changes.data.is_empty() {
            self.events.emit(SessionEvent::LobbyDataChanged);
        }
        if changes.has_participant_data_changes() {
            self.events.emit(SessionEvent::PlayerDataChanged);
        }
        true
    }

    fn update_membership(self: &Arc<Self>) {
        let (is_member, is_host, is_creator) = {
            let room = lock(&self.room);
            (
                room.has_participant(&self.local_id),
                room.host_id == self.local_id,
                room.creator_id() == Some(self.local_id.as_str()),
            )
        };
        self.fields.is_member.set(is_member);
        self.fields.is_host.set(is_host);
        self.fields.is_creator.set(is_creator);

        let mut liveness = lock(&self.liveness);
        liveness.tasks.retain(|task| !task.is_finished());
        match (is_member, liveness.cancel.is_some()) {
            (true, false) => {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(
                        "room {}: no tokio runtime, background work not started",
                        self.room_id
                    );
                    return;
                };
                let cancel = CancellationToken::new();
                liveness.tasks.push(runtime.spawn(heartbeat_loop(
                    Arc::downgrade(self),
                    Arc::clone(&self.service),
                    Arc::clone(&self.heartbeat_governor),
                    self.room_id.clone(),
                    self.heartbeat_grace,
                    self.heartbeat_interval,
                    cancel.clone(),
                )));
                liveness.tasks.push(runtime.spawn(event_loop(
                    Arc::downgrade(self),
                    Arc::clone(&self.service),
                    self.room_id.clone(),
                    cancel.clone(),
                )));
                liveness.cancel = Some(cancel);
                debug!("room {}: member, background work started", self.room_id);
            }
            (false, true) => {
                if let Some(cancel) = liveness.cancel.take() {
                    cancel.cancel();
                }
                debug!("room {}: no longer a member, background work stopped", self.room_id);
            }
            _ => {}
        }
    }

    fn remove_local(self: &Arc<Self>, departure: Departure, event: Option<SessionEvent>) {
        let applying = lock(&self.apply);
        if !self.is_accepting() {
            return;
        }
        let snapshot = {
            let mut room = lock(&self.room);
            match departure {
                Departure::Left => room.participants.retain(|p| p.id != self.local_id),
                Departure::RoomDeleted => room.participants.clear(),
            }
            room.clone()
        };
        self.fields.sync(&snapshot);
        self.update_membership();
        drop(applying);

        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    fn handle_event(self: &Arc<Self>, event: RoomEvent) {
        match event {
            RoomEvent::Changed(changes) => {
                self.reconcile(&changes);
            }
            RoomEvent::ConnectionStateChanged(state) => {
                debug!("room {}: event connection {state:?}", self.room_id);
                self.fields.connection_state.set(state);
            }
            RoomEvent::Deleted => {
                debug!("room {} was deleted", self.room_id);
                self.remove_local(Departure::RoomDeleted, Some(SessionEvent::Deleted));
            }
            RoomEvent::Kicked => {
                debug!("room {}: removed by the service", self.room_id);
                self.remove_local(Departure::Left, Some(SessionEvent::Kicked));
            }
            RoomEvent::ParticipantsJoined(joined) => {
                if self.is_accepting() {
                    self.events.emit(SessionEvent::PlayersJoined {
                        participants: joined.into_iter().map(|p| p.id).collect(),
                    });
                }
            }
            RoomEvent::ParticipantsLeft(participants) => {
                if self.is_accepting() {
                    self.events.emit(SessionEvent::PlayersLeft { participants });
                }
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let liveness = self
            .liveness
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = liveness.cancel.take() {
            cancel.cancel();
        }
        for task in liveness.tasks.drain(..) {
            task.abort();
        }
    }
}

// ── Background work ─────────────────────────────────────────────────

/// Sends governed heartbeats until cancelled.
///
/// The first heartbeat goes out after `grace`. A rejection saying the
/// participant is no longer in the room removes it locally, as a kick would;
/// other failures are logged and the loop keeps going.
async fn heartbeat_loop(
    session: Weak<SessionInner>,
    service: Arc<dyn LobbyService>,
    governor: Arc<RequestGovernor>,
    room_id: RoomId,
    grace: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(grace) => {}
    }

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = governor.try_run(|| service.send_heartbeat(&room_id)) => outcome,
        };
        match outcome {
            Ok(()) => trace!("room {room_id}: heartbeat sent"),
            Err(e) if e.error_code().is_some_and(ErrorCode::means_departed) => {
                warn!("room {room_id}: heartbeat shows we are no longer a member: {e}");
                if let Some(session) = session.upgrade() {
                    session.remove_local(Departure::Left, Some(SessionEvent::Kicked));
                }
                break;
            }
            Err(e) => warn!("room {room_id}: heartbeat failed: {e}"),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("room {room_id}: heartbeat loop stopped");
}

/// Subscribes to the room's events and feeds them to the session until
/// cancelled, then unsubscribes.
async fn event_loop(
    session: Weak<SessionInner>,
    service: Arc<dyn LobbyService>,
    room_id: RoomId,
    cancel: CancellationToken,
) {
    set_connection_state(&session, EventConnectionState::Subscribing);
    let subscribed = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            set_connection_state(&session, EventConnectionState::Unsubscribed);
            return;
        }
        subscribed = service.subscribe(&room_id) => subscribed,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("room {room_id}: event subscription failed: {e}");
            set_connection_state(&session, EventConnectionState::Error);
            return;
        }
    };
    set_connection_state(&session, EventConnectionState::Subscribed);
    debug!("room {room_id}: subscribed to events");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = subscription.next_event() => {
                let Some(event) = event else {
                    debug!("room {room_id}: event channel closed");
                    break;
                };
                let Some(inner) = session.upgrade() else {
                    break;
                };
                inner.handle_event(event);
            }
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        warn!("room {room_id}: unsubscribe failed: {e}");
    }
    set_connection_state(&session, EventConnectionState::Unsubscribed);
    debug!("room {room_id}: unsubscribed from events");
}

fn set_connection_state(session: &Weak<SessionInner>, state: EventConnectionState) {
    if let Some(inner) = session.upgrade() {
        inner.fields.connection_state.set(state);
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
    use crate::error::LobbyError;
    use crate::error_codes::ErrorCode;
    use crate::model::{
        CreateRoomOptions, DataEntry, MapChanges, Participant, QueryFilter,
    };
    use crate::service::RoomSubscription;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Service that echoes updates back and counts heartbeats. Pushed events
    /// are fed through `push`.
    struct EchoService {
        room: Mutex<Room>,
        heartbeats: AtomicUsize,
        reject_updates: AtomicBool,
        push: Mutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
        unsubscribed: AtomicBool,
    }

    impl EchoService {
        fn new(room: Room) -> (Arc<Self>, mpsc::UnboundedSender<RoomEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let service = Arc::new(Self {
                room: Mutex::new(room),
                heartbeats: AtomicUsize::new(0),
                reject_updates: AtomicBool::new(false),
                push: Mutex::new(Some(rx)),
                unsubscribed: AtomicBool::new(false),
            });
            (service, tx)
        }
    }

    struct ChannelSubscription {
        rx: mpsc::UnboundedReceiver<RoomEvent>,
        service: Arc<EchoService>,
    }

    #[async_trait]
    impl RoomSubscription for ChannelSubscription {
        async fn next_event(&mut self) -> Option<RoomEvent> {
            self.rx.recv().await
        }
        async fn unsubscribe(&mut self) -> Result<()> {
            self.service.unsubscribed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Handle(Arc<EchoService>);

    #[async_trait]
    impl LobbyService for Handle {
        async fn query_rooms(&self, _: &QueryFilter) -> Result<Vec<Room>> {
            Ok(Vec::new())
        }
        async fn join_by_code(&self, _: &str, _: &Participant, _: Option<&str>) -> Result<Room> {
            Err(LobbyError::rejected(ErrorCode::RoomNotFound))
        }
        async fn join_by_id(&self, _: &str, _: &Participant, _: Option<&str>) -> Result<Room> {
            Err(LobbyError::rejected(ErrorCode::RoomNotFound))
        }
        async fn create_room(&self, _: &str, _: u32, _: CreateRoomOptions) -> Result<Room> {
            Err(LobbyError::rejected(ErrorCode::ServiceUnavailable))
        }
        async fn delete_room(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_participant(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn update_room(&self, _: &str, update: RoomUpdate) -> Result<Room> {
            if self.0.reject_updates.load(Ordering::SeqCst) {
                return Err(LobbyError::rejected(ErrorCode::Forbidden));
            }
            let mut room = self.0.room.lock().unwrap();
            room.name = update.name;
            room.is_locked = update.is_locked;
            if update.password.is_some() {
                room.has_password = true;
            } else if update.clear_password {
                room.has_password = false;
            }
            room.data = update.data;
            Ok(room.clone())
        }
        async fn update_participant(
            &self,
            _: &str,
            participant_id: &str,
            update: ParticipantUpdate,
        ) -> Result<Room> {
            let mut room = self.0.room.lock().unwrap();
            let participant = room
                .participants
                .iter_mut()
                .find(|p| p.id == participant_id)
                .ok_or_else(|| LobbyError::rejected(ErrorCode::NotInRoom))?;
            participant.data = update.data;
            Ok(room.clone())
        }
        async fn send_heartbeat(&self, _: &str) -> Result<()> {
            self.0.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn subscribe(&self, _: &str) -> Result<Box<dyn RoomSubscription>> {
            let rx = self
                .0
                .push
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| LobbyError::Transport("already subscribed".into()))?;
            Ok(Box::new(ChannelSubscription {
                rx,
                service: Arc::clone(&self.0),
            }))
        }
    }

    fn room() -> Room {
        Room {
            id: "room-1".into(),
            name: "Lobby".into(),
            host_id: "alice".into(),
            max_players: 4,
            available_slots: 2,
            participants: vec![Participant::new("alice", "Alice"), Participant::new("bob", "Bob")],
            ..Room::default()
        }
    }

    fn config() -> LobbyConfig {
        LobbyConfig::default()
            .with_heartbeat_interval(Duration::from_secs(15))
            .with_request_cooldown(Duration::from_secs(5))
    }

    fn session_for(
        local: &str,
    ) -> (
        RoomSession,
        Arc<EchoService>,
        mpsc::UnboundedSender<RoomEvent>,
    ) {
        let (service, push) = EchoService::new(room());
        let session = RoomSession::new(room(), local, Arc::new(Handle(Arc::clone(&service))), &config());
        (session, service, push)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn record(session: &RoomSession) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session
            .events()
            .listen(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn member_session_derives_flags_and_subscribes() {
        let (session, _service, _push) = session_for("alice");
        settle().await;

        let fields = session.fields();
        assert!(fields.is_member.get());
        assert!(fields.is_host.get());
        assert!(!fields.is_creator.get());
        assert_eq!(fields.connection_state.get(), EventConnectionState::Subscribed);
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn non_member_session_stays_inactive() {
        let (session, service, _push) = session_for("mallory");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!session.fields().is_member.get());
        assert!(!session.is_active());
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 0);
        assert!(!session.reconcile(&RoomChanges {
            name: Some("Renamed".into()),
            ..RoomChanges::default()
        }));
        assert_eq!(session.room().name, "Lobby");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_follow_grace_then_interval() {
        let (session, service, _push) = session_for("bob");
        settle().await;

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 2);

        session.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_diff_updates_fields_and_emits_once_per_category() {
        let (session, _service, push) = session_for("bob");
        let seen = record(&session);
        settle().await;

        let mut data = MapChanges::default();
        data.added.insert("map".into(), DataEntry::public("forest"));
        push.send(RoomEvent::Changed(RoomChanges {
            name: Some("Renamed".into()),
            data,
            ..RoomChanges::default()
        }))
        .unwrap();
        settle().await;

        assert_eq!(session.fields().name.get(), "Renamed");
        assert_eq!(session.room().data["map"].value, "forest");
        assert_eq!(*seen.lock().unwrap(), vec![SessionEvent::LobbyDataChanged]);
    }

    #[tokio::test(start_paused = true)]
    async fn host_transfer_diff_flips_is_host() {
        let (session, _service, push) = session_for("bob");
        settle().await;
        assert!(!session.fields().is_host.get());

        push.send(RoomEvent::Changed(RoomChanges {
            host_id: Some("bob".into()),
            ..RoomChanges::default()
        }))
        .unwrap();
        settle().await;

        assert!(session.fields().is_host.get());
        assert_eq!(session.fields().host_id.get(), "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn kicked_stops_background_work_and_drops_later_diffs() {
        let (session, service, push) = session_for("bob");
        let seen = record(&session);
        settle().await;

        push.send(RoomEvent::Kicked).unwrap();
        push.send(RoomEvent::Changed(RoomChanges {
            name: Some("Too late".into()),
            ..RoomChanges::default()
        }))
        .unwrap();
        settle().await;

        assert!(!session.fields().is_member.get());
        assert!(!session.is_active());
        assert_eq!(session.room().name, "Lobby");
        assert_eq!(*seen.lock().unwrap(), vec![SessionEvent::Kicked]);
        assert!(service.unsubscribed.load(Ordering::SeqCst));
        assert_eq!(
            session.fields().connection_state.get(),
            EventConnectionState::Unsubscribed
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(service.heartbeats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_clears_participants() {
        let (session, _service, push) = session_for("alice");
        let seen = record(&session);
        settle().await;

        push.send(RoomEvent::Deleted).unwrap();
        settle().await;

        assert!(session.room().participants.is_empty());
        assert!(!session.fields().is_member.get());
        assert_eq!(*seen.lock().unwrap(), vec![SessionEvent::Deleted]);
    }

    #[tokio::test(start_paused = true)]
    async fn join_and_leave_notifications_carry_ids() {
        let (session, _service, push) = session_for("alice");
        let seen = record(&session);
        settle().await;

        push.send(RoomEvent::ParticipantsJoined(vec![Participant::new("cat", "Cat")]))
            .unwrap();
        push.send(RoomEvent::ParticipantsLeft(vec!["bob".into()]))
            .unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionEvent::PlayersJoined {
                    participants: vec!["cat".into()]
                },
                SessionEvent::PlayersLeft {
                    participants: vec!["bob".into()]
                },
            ]
        );
        assert_eq!(session.room().participants.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_room_update_adopts_snapshot() {
        let (session, _service, _push) = session_for("alice");
        let seen = record(&session);
        settle().await;

        let mut data = DataMap::new();
        data.insert("mode".into(), DataEntry::public("ctf"));
        let room = session
            .update_room(Some(RoomPatch {
                is_locked: Some(true),
                password: Some("hunter2".into()),
                data,
                ..RoomPatch::default()
            }))
            .await
            .unwrap()
            .unwrap();

        assert!(room.is_locked);
        assert!(session.fields().is_locked.get());
        assert!(session.fields().has_password.get());
        assert_eq!(session.fields().password.get().as_deref(), Some("hunter2"));
        assert_eq!(session.room().data["mode"].value, "ctf");
        assert_eq!(*seen.lock().unwrap(), vec![SessionEvent::LobbyDataChanged]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_update_refreshes_without_event() {
        let (session, _service, _push) = session_for("alice");
        let seen = record(&session);
        settle().await;

        assert!(session.update_room(None).await.unwrap().is_some());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn participant_update_merges_own_data() {
        let (session, _service, _push) = session_for("bob");
        settle().await;

        let mut first = DataMap::new();
        first.insert("color".into(), DataEntry::public("red"));
        session.update_participant_data(first).await.unwrap().unwrap();

        let mut second = DataMap::new();
        second.insert("ready".into(), DataEntry::public("true"));
        session.update_participant_data(second).await.unwrap().unwrap();

        let room = session.room();
        let bob = room.participant("bob").unwrap();
        assert_eq!(bob.data["color"].value, "red");
        assert_eq!(bob.data["ready"].value, "true");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_update_leaves_cache_unchanged() {
        let (session, service, _push) = session_for("alice");
        settle().await;
        service.reject_updates.store(true, Ordering::SeqCst);

        let outcome = session
            .update_room(Some(RoomPatch {
                name: Some("Nope".into()),
                ..RoomPatch::default()
            }))
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(session.room().name, "Lobby");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_update_is_rejected_by_governor() {
        let (session, _service, _push) = session_for("alice");
        settle().await;

        session.update_room(None).await.unwrap();
        let (first, second) = tokio::join!(session.update_room(None), session.update_room(None));
        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent_and_final() {
        let (session, _service, _push) = session_for("alice");
        settle().await;

        session.shutdown().await;
        session.shutdown().await;
        assert!(session.is_closed());
        assert!(!session.is_active());

        session.update_membership();
        assert!(!session.is_active());
        assert!(session.update_room(None).await.unwrap().is_none());
    }

    #[test]
    fn session_without_runtime_is_inactive() {
        let (service, _push) = EchoService::new(room());
        let session = RoomSession::new(room(), "alice", Arc::new(Handle(service)), &config());
        assert!(session.fields().is_member.get());
        assert!(!session.is_active());
    }
}
