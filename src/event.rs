//! Change events published by sessions and the director.
//!
//! [`EventHub`] is the publish/subscribe point for both. It offers two kinds
//! of consumers:
//!
//! - **Listeners** (`listen`) are synchronous callbacks invoked in
//!   subscription order at the moment the event is emitted, after the
//!   emitting component has finished updating its state.
//! - **Receivers** (`subscribe`) are [`tokio::sync::broadcast`] receivers for
//!   async consumers. A receiver that falls behind the channel capacity
//!   observes `RecvError::Lagged` and skips the oldest events.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{ParticipantId, RoomId};
use crate::observable::{ListenerId, Listeners};
use crate::session::RoomSession;

/// Events emitted by a single [`RoomSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Other participants joined the room.
    PlayersJoined {
        /// Ids of the participants that joined.
        participants: Vec<ParticipantId>,
    },
    /// Participants left the room.
    PlayersLeft {
        /// Ids of the participants that left.
        participants: Vec<ParticipantId>,
    },
    /// Room-level metadata was added, changed or removed.
    LobbyDataChanged,
    /// Participant-level metadata was added, changed or removed.
    PlayerDataChanged,
    /// The room was deleted remotely. The session has torn down its background work.
    Deleted,
    /// The local participant was removed from the room. The session has torn
    /// down its background work.
    Kicked,
}

/// Events emitted by the [`SessionDirector`](crate::SessionDirector).
#[derive(Debug, Clone)]
pub enum DirectorEvent {
    /// A directory query completed (successfully or not).
    QueriedListChanged,
    /// The current session was replaced or cleared.
    CurrentSessionChanged,
    /// The caller created a room and it became the current session.
    Created(RoomSession),
    /// The caller deleted its room.
    Deleted(RoomId),
    /// The caller joined a room and it became the current session.
    Joined(RoomSession),
    /// The caller left a room.
    Left(RoomId),
}

/// Publish/subscribe hub with ordered synchronous listeners and async receivers.
pub struct EventHub<E> {
    listeners: Listeners<E>,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventHub<E> {
    /// Creates a hub whose async receivers buffer up to `capacity` events.
    ///
    /// Values below 1 are clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Listeners::new(),
            sender,
        }
    }

    /// Registers a synchronous listener.
    ///
    /// Listeners run on the emitting thread after the emitter has released
    /// its own state, so a session listener may call back into the session.
    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Removes a synchronous listener. Returns `false` if it was not registered.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Returns a new async receiver that sees every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Delivers `event` to every listener (in subscription order) and then to
    /// the async receivers.
    pub fn emit(&self, event: E) {
        self.listeners.notify(&event);
        if self.sender.send(event).is_err() {
            trace!("event emitted with no async receivers");
        }
    }

    /// Number of synchronous listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.len())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
