//! Explicitly constructed service and identity context.
//!
//! [`Platform`] owns the lobby service handle and the identity provider and
//! tracks their readiness. Nothing is initialized implicitly: call
//! [`Platform::open`] before using a director and [`Platform::close`] when
//! done.
//!
//! ```text
//! ServiceState: Uninitialized → Initializing → Initialized | FailedToInitialize
//! AuthState:    NotAuthenticated → Authenticating → Authenticated | FailedToAuthenticate
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{LobbyError, Result};
use crate::model::ParticipantId;
use crate::observable::{lock, Observable};
use crate::service::{IdentityProvider, LobbyService};

/// Initialization state of the lobby service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
    FailedToInitialize,
}

/// Authentication state of the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthState {
    #[default]
    NotAuthenticated,
    Authenticating,
    Authenticated,
    FailedToAuthenticate,
}

/// The lobby service plus the identity of the local participant.
pub struct Platform {
    service: Arc<dyn LobbyService>,
    identity: Arc<dyn IdentityProvider>,
    service_state: Observable<ServiceState>,
    auth_state: Observable<AuthState>,
    local_id: Mutex<Option<ParticipantId>>,
}

impl Platform {
    /// Creates a closed platform.
    pub fn new(service: Arc<dyn LobbyService>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            service,
            identity,
            service_state: Observable::default(),
            auth_state: Observable::default(),
            local_id: Mutex::new(None),
        }
    }

    /// Initializes the service, then signs in.
    ///
    /// Calling `open` on an already enabled platform is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotInitialized`] if the service fails to
    /// initialize and [`LobbyError::NotAuthenticated`] if sign-in fails. The
    /// underlying failure is logged.
    pub async fn open(&self) -> Result<()> {
        if self.is_enabled() {
            debug!("platform already open");
            return Ok(());
        }

        self.service_state.set(ServiceState::Initializing);
        if let Err(e) = self.service.initialize().await {
            warn!("lobby service failed to initialize: {e}");
            self.service_state.set(ServiceState::FailedToInitialize);
            return Err(LobbyError::NotInitialized);
        }
        self.service_state.set(ServiceState::Initialized);

        self.auth_state.set(AuthState::Authenticating);
        match self.identity.sign_in().await {
            Ok(id) => {
                debug!("signed in as {id}");
                *lock(&self.local_id) = Some(id);
                self.auth_state.set(AuthState::Authenticated);
                Ok(())
            }
            Err(e) => {
                warn!("sign-in failed: {e}");
                self.auth_state.set(AuthState::FailedToAuthenticate);
                Err(LobbyError::NotAuthenticated)
            }
        }
    }

    /// Signs out and resets both states.
    pub async fn close(&self) {
        if self.auth_state.get() == AuthState::Authenticated {
            if let Err(e) = self.identity.sign_out().await {
                warn!("sign-out failed: {e}");
            }
        }
        *lock(&self.local_id) = None;
        self.auth_state.set(AuthState::NotAuthenticated);
        self.service_state.set(ServiceState::Uninitialized);
        debug!("platform closed");
    }

    /// Returns `true` when the service is initialized and the participant is signed in.
    pub fn is_enabled(&self) -> bool {
        self.service_state.get() == ServiceState::Initialized
            && self.auth_state.get() == AuthState::Authenticated
    }

    /// The local participant id; `None` unless authenticated.
    pub fn local_participant_id(&self) -> Option<ParticipantId> {
        if self.auth_state.get() != AuthState::Authenticated {
            return None;
        }
        lock(&self.local_id).clone()
    }

    /// The lobby service handle.
    pub fn service(&self) -> &Arc<dyn LobbyService> {
        &self.service
    }

    /// Observable service initialization state.
    pub fn service_state(&self) -> &Observable<ServiceState> {
        &self.service_state
    }

    /// Observable authentication state.
    pub fn auth_state(&self) -> &Observable<AuthState> {
        &self.auth_state
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("service_state", &self.service_state.get())
            .field("auth_state", &self.auth_state.get())
            .field("local_id", &*lock(&self.local_id))
            .finish()
    }
}

/// Identity provider that signs in anonymously with a fresh random id.
///
/// The id stays stable until [`sign_out`](IdentityProvider::sign_out).
#[derive(Debug, Default)]
pub struct AnonymousIdentity {
    current: Mutex<Option<ParticipantId>>,
}

impl AnonymousIdentity {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn sign_in(&self) -> Result<ParticipantId> {
        let mut current = lock(&self.current);
        let id = current
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone();
        Ok(id)
    }

    async fn sign_out(&self) -> Result<()> {
        *lock(&self.current) = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error_codes::ErrorCode;
    use crate::model::{
        CreateRoomOptions, Participant, ParticipantUpdate, QueryFilter, Room, RoomUpdate,
    };
    use crate::service::RoomSubscription;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Service whose initialization can be made to fail; every other call is rejected.
    struct StubService {
        fail_init: AtomicBool,
    }

    #[async_trait]
    impl LobbyService for StubService {
        async fn initialize(&self) -> Result<()> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(LobbyError::Transport("unreachable".into()));
            }
            Ok(())
        }
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
        async fn update_room(&self, _: &str, _: RoomUpdate) -> Result<Room> {
            Err(LobbyError::rejected(ErrorCode::RoomNotFound))
        }
        async fn update_participant(&self, _: &str, _: &str, _: ParticipantUpdate) -> Result<Room> {
            Err(LobbyError::rejected(ErrorCode::RoomNotFound))
        }
        async fn send_heartbeat(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _: &str) -> Result<Box<dyn RoomSubscription>> {
            Err(LobbyError::rejected(ErrorCode::RoomNotFound))
        }
    }

    struct FailingIdentity;

    #[async_trait]
    impl IdentityProvider for FailingIdentity {
        async fn sign_in(&self) -> Result<ParticipantId> {
            Err(LobbyError::Transport("auth backend down".into()))
        }
    }

    fn stub(fail_init: bool) -> Arc<StubService> {
        Arc::new(StubService {
            fail_init: AtomicBool::new(fail_init),
        })
    }

    #[tokio::test]
    async fn open_walks_both_state_machines() {
        let platform = Platform::new(stub(false), Arc::new(AnonymousIdentity::new()));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        platform
            .auth_state()
            .subscribe(move |state| sink.lock().unwrap().push(*state));

        assert!(!platform.is_enabled());
        assert!(platform.local_participant_id().is_none());

        platform.open().await.unwrap();

        assert!(platform.is_enabled());
        assert_eq!(platform.service_state().get(), ServiceState::Initialized);
        assert!(platform.local_participant_id().is_some());
        assert_eq!(
            *transitions.lock().unwrap(),
            vec![AuthState::Authenticating, AuthState::Authenticated]
        );
    }

    #[tokio::test]
    async fn failed_initialization_stops_before_sign_in() {
        let platform = Platform::new(stub(true), Arc::new(AnonymousIdentity::new()));
        let err = platform.open().await.unwrap_err();

        assert!(matches!(err, LobbyError::NotInitialized));
        assert_eq!(
            platform.service_state().get(),
            ServiceState::FailedToInitialize
        );
        assert_eq!(platform.auth_state().get(), AuthState::NotAuthenticated);
        assert!(!platform.is_enabled());
    }

    #[tokio::test]
    async fn failed_sign_in_leaves_platform_disabled() {
        let platform = Platform::new(stub(false), Arc::new(FailingIdentity));
        let err = platform.open().await.unwrap_err();

        assert!(matches!(err, LobbyError::NotAuthenticated));
        assert_eq!(platform.auth_state().get(), AuthState::FailedToAuthenticate);
        assert!(platform.local_participant_id().is_none());
    }

    #[tokio::test]
    async fn close_resets_identity() {
        let identity = Arc::new(AnonymousIdentity::new());
        let platform = Platform::new(stub(false), identity.clone());
        platform.open().await.unwrap();
        let first = platform.local_participant_id().unwrap();

        platform.close().await;
        assert!(!platform.is_enabled());
        assert!(platform.local_participant_id().is_none());

        platform.open().await.unwrap();
        let second = platform.local_participant_id().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn anonymous_identity_is_stable_until_sign_out() {
        let identity = AnonymousIdentity::new();
        let a = identity.sign_in().await.unwrap();
        let b = identity.sign_in().await.unwrap();
        assert_eq!(a, b);
        identity.sign_out().await.unwrap();
        assert_ne!(identity.sign_in().await.unwrap(), a);
    }
}
