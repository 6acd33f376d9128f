//! Tuning knobs for the director and its sessions.

use std::time::Duration;

use crate::governor::DEFAULT_COOLDOWN_SKEW;
use crate::model::QueryFilter;

/// Default capacity of rooms created through the director.
const DEFAULT_MAX_PLAYERS: u32 = 4;

/// Default spacing between two governed calls of the same class.
const DEFAULT_REQUEST_COOLDOWN: Duration = Duration::from_secs(5);

/// Default interval between heartbeats, also used as the initial grace delay.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default capacity of the async event channels.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for a session's graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`SessionDirector`](crate::SessionDirector) and the
/// sessions it creates.
///
/// # Example
///
/// ```
/// use lobby_sync::LobbyConfig;
/// use std::time::Duration;
///
/// let config = LobbyConfig::new("Alice")
///     .with_max_players(8)
///     .with_heartbeat_interval(Duration::from_secs(10));
/// assert_eq!(config.display_name, "Alice");
/// assert_eq!(config.max_players, 8);
/// ```
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Profile name sent with every join/create.
    pub display_name: String,
    /// Capacity of rooms created through the director. Defaults to **4**.
    pub max_players: u32,
    /// Cooldown of the query, join, create, delete and update governors.
    /// Defaults to **5 seconds**.
    pub request_cooldown: Duration,
    /// Cooldown of each session's heartbeat governor. Defaults to **5 seconds**.
    pub heartbeat_cooldown: Duration,
    /// Extra spacing added to every cooldown. Defaults to **100 ms**.
    pub cooldown_skew: Duration,
    /// Wait between two heartbeats. Defaults to **15 seconds**.
    pub heartbeat_interval: Duration,
    /// Delay before the first heartbeat. Defaults to **15 seconds**.
    pub heartbeat_grace: Duration,
    /// Filter sent with every directory query.
    pub query_filter: QueryFilter,
    /// Capacity of the async event receivers. Defaults to **256**; values
    /// below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time a session's background tasks get to finish on shutdown before
    /// they are aborted. Defaults to **1 second**; zero aborts immediately.
    pub shutdown_timeout: Duration,
}

impl LobbyConfig {
    /// Creates a configuration with the given display name and default values.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            max_players: DEFAULT_MAX_PLAYERS,
            request_cooldown: DEFAULT_REQUEST_COOLDOWN,
            heartbeat_cooldown: DEFAULT_REQUEST_COOLDOWN,
            cooldown_skew: DEFAULT_COOLDOWN_SKEW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_grace: DEFAULT_HEARTBEAT_INTERVAL,
            query_filter: QueryFilter::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the capacity of created rooms.
    #[must_use]
    pub fn with_max_players(mut self, max_players: u32) -> Self {
        self.max_players = max_players;
        self
    }

    /// Set the cooldown of the directory and update governors.
    #[must_use]
    pub fn with_request_cooldown(mut self, cooldown: Duration) -> Self {
        self.request_cooldown = cooldown;
        self
    }

    /// Set the cooldown of the heartbeat governor.
    #[must_use]
    pub fn with_heartbeat_cooldown(mut self, cooldown: Duration) -> Self {
        self.heartbeat_cooldown = cooldown;
        self
    }

    /// Set the skew added to every cooldown.
    #[must_use]
    pub fn with_cooldown_skew(mut self, skew: Duration) -> Self {
        self.cooldown_skew = skew;
        self
    }

    /// Set the heartbeat interval and, with it, the initial grace delay.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_grace = interval;
        self
    }

    /// Set the delay before the first heartbeat.
    #[must_use]
    pub fn with_heartbeat_grace(mut self, grace: Duration) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    /// Set the filter used by directory queries.
    #[must_use]
    pub fn with_query_filter(mut self, filter: QueryFilter) -> Self {
        self.query_filter = filter;
        self
    }

    /// Set the capacity of the async event receivers. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the graceful shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self::new("Player")
    }
}
