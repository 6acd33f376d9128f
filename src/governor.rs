//! Mutual exclusion and rate limiting for one class of remote call.
//!
//! Lobby services enforce per-action rate limits (one create every few
//! seconds, one heartbeat per interval, ...). A [`RequestGovernor`] wraps
//! one such call site:
//!
//! - at most one call is in flight; a second attempt fails immediately with
//!   [`LobbyError::AlreadyRunning`] instead of queueing;
//! - a call does not start until `cooldown + skew` has elapsed since the
//!   previous call completed. The skew absorbs clock and ping jitter.
//!
//! The predicates [`is_running`](RequestGovernor::is_running) and
//! [`is_on_cooldown`](RequestGovernor::is_on_cooldown) are cheap and
//! synchronous so callers can gate features before attempting a call.
//!
//! The governor never interprets or retries the outcome of the call.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LobbyError, Result};
use crate::observable::lock;

/// Default extra spacing added to every cooldown.
pub const DEFAULT_COOLDOWN_SKEW: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct GovernorState {
    running: bool,
    last_completion: Option<Instant>,
}

/// Serializes and spaces out calls to one remote operation.
///
/// # Example
///
/// ```
/// # async fn example() -> lobby_sync::Result<()> {
/// use std::time::Duration;
/// use lobby_sync::RequestGovernor;
///
/// let governor = RequestGovernor::new("query", Duration::from_secs(5));
/// let rooms = governor.try_run(|| async { Ok(vec!["room-a"]) }).await?;
/// assert_eq!(rooms.len(), 1);
/// assert!(governor.is_on_cooldown());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RequestGovernor {
    name: &'static str,
    cooldown: Duration,
    skew: Duration,
    state: Mutex<GovernorState>,
}

impl RequestGovernor {
    /// Creates a governor with the default skew.
    pub fn new(name: &'static str, cooldown: Duration) -> Self {
        Self::with_skew(name, cooldown, DEFAULT_COOLDOWN_SKEW)
    }

    /// Creates a governor with an explicit skew.
    pub fn with_skew(name: &'static str, cooldown: Duration, skew: Duration) -> Self {
        Self {
            name,
            cooldown,
            skew,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Name used in logs and in [`LobbyError::AlreadyRunning`].
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Configured cooldown (without skew).
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns `true` while a call is in flight.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Returns `true` if a call started now would have to wait.
    pub fn is_on_cooldown(&self) -> bool {
        !self.cooldown_remaining().is_zero()
    }

    /// Returns `true` if a call could start immediately.
    pub fn is_available(&self) -> bool {
        !self.is_running() && !self.is_on_cooldown()
    }

    /// Time left before the next call may start.
    pub fn cooldown_remaining(&self) -> Duration {
        let last = lock(&self.state).last_completion;
        self.remaining_since(last)
    }

    /// Completion time of the previous call, if any.
    pub fn last_completion(&self) -> Option<Instant> {
        lock(&self.state).last_completion
    }

    fn remaining_since(&self, last: Option<Instant>) -> Duration {
        match last {
            Some(at) => (self.cooldown + self.skew).saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Runs the call produced by `factory` under the governor's rules.
    ///
    /// Waits out any residual cooldown, then awaits the call and hands its
    /// outcome back unchanged. The in-flight flag is cleared and the
    /// completion time recorded whether the call succeeds, fails, or the
    /// returned future is dropped before finishing.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::AlreadyRunning`] without invoking `factory` if
    /// another call is in flight; otherwise returns whatever the call returns.
    pub async fn try_run<T, F, Fut>(&self, factory: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (_in_flight, remaining) = {
            let mut state = lock(&self.state);
            if state.running {
                warn!("{} request is already running", self.name);
                return Err(LobbyError::AlreadyRunning(self.name));
            }
            state.running = true;
            let remaining = self.remaining_since(state.last_completion);
            (InFlight { state: &self.state }, remaining)
        };

        if !remaining.is_zero() {
            debug!("{} request waiting {:?} for cooldown", self.name, remaining);
            tokio::time::sleep(remaining).await;
        }

        factory().await
    }
}

/// Clears the in-flight flag and records the completion time when dropped.
struct InFlight<'a> {
    state: &'a Mutex<GovernorState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        state.running = false;
        state.last_completion = Some(Instant::now());
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
    use crate::error_codes::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    const COOLDOWN: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn first_call_runs_immediately() {
        let governor = RequestGovernor::new("test", COOLDOWN);
        assert!(governor.is_available());

        let started = Instant::now();
        let value = governor.try_run(|| async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!governor.is_running());
        assert!(governor.is_on_cooldown());
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_for_cooldown_plus_skew() {
        let governor = RequestGovernor::new("test", COOLDOWN);
        governor.try_run(|| async { Ok(()) }).await.unwrap();
        let first_completed = Instant::now();

        let factory_started = Arc::new(Mutex::new(None));
        let marker = Arc::clone(&factory_started);
        governor
            .try_run(|| async move {
                *marker.lock().unwrap() = Some(Instant::now());
                Ok(())
            })
            .await
            .unwrap();

        let started = factory_started.lock().unwrap().unwrap();
        assert!(started.duration_since(first_completed) >= COOLDOWN + DEFAULT_COOLDOWN_SKEW);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_call_stays_pending_until_cooldown_elapses() {
        let governor = RequestGovernor::new("test", COOLDOWN);
        governor.try_run(|| async { Ok(()) }).await.unwrap();

        let mut call = tokio_test::task::spawn(governor.try_run(|| async { Ok(1) }));
        assert_pending!(call.poll());
        assert!(governor.is_running());

        tokio::time::advance(COOLDOWN).await;
        assert_pending!(call.poll());

        tokio::time::advance(DEFAULT_COOLDOWN_SKEW).await;
        let value = assert_ready!(call.poll()).unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_call_is_rejected_without_invoking_factory() {
        let governor = Arc::new(RequestGovernor::new("join", COOLDOWN));
        let invocations = Arc::new(AtomicUsize::new(0));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let governor = Arc::clone(&governor);
            let invocations = Arc::clone(&invocations);
            tokio::spawn(async move {
                governor
                    .try_run(|| async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(governor.is_running());

        let counter = Arc::clone(&invocations);
        let second = governor
            .try_run(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(second, Err(LobbyError::AlreadyRunning("join"))));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert!(!governor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_pass_through_and_clear_running() {
        let governor = RequestGovernor::new("delete", COOLDOWN);
        let result: Result<()> = governor
            .try_run(|| async { Err(LobbyError::rejected(ErrorCode::RoomNotFound)) })
            .await;

        assert_eq!(
            result.unwrap_err().error_code(),
            Some(&ErrorCode::RoomNotFound)
        );
        assert!(!governor.is_running());
        assert!(governor.last_completion().is_some());

        let transport: Result<()> = governor
            .try_run(|| async { Err(LobbyError::Transport("connection reset".into())) })
            .await;
        assert!(matches!(transport, Err(LobbyError::Transport(_))));
        assert!(!governor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_does_not_leave_governor_busy() {
        let governor = RequestGovernor::new("heartbeat", COOLDOWN);
        {
            let mut call = tokio_test::task::spawn(
                governor.try_run(|| std::future::pending::<Result<()>>()),
            );
            assert_pending!(call.poll());
            assert!(governor.is_running());
        }
        assert!(!governor.is_running());
        assert!(governor.is_on_cooldown());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires() {
        let governor = RequestGovernor::with_skew("query", COOLDOWN, Duration::ZERO);
        governor.try_run(|| async { Ok(()) }).await.unwrap();
        assert_eq!(governor.cooldown_remaining(), COOLDOWN);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(governor.cooldown_remaining(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!governor.is_on_cooldown());
        assert!(governor.is_available());
    }
}
