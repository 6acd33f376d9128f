//! Built-in [`LobbyService`](crate::LobbyService) implementations.
//!
//! Enable the corresponding Cargo feature to pull in a service:
//!
//! | Feature          | Service                                      |
//! |------------------|----------------------------------------------|
//! | `memory-service` | [`MemoryLobbyServer`] / [`MemoryLobbyClient`] |
//!
//! # Example
//!
//! ```rust
//! # async fn example() -> lobby_sync::Result<()> {
//! use std::sync::Arc;
//! use lobby_sync::services::MemoryLobbyServer;
//! use lobby_sync::{LobbyConfig, Platform, SessionDirector};
//!
//! let server = MemoryLobbyServer::new();
//! let client = server.client();
//! let platform = Arc::new(Platform::new(client.clone(), client));
//! platform.open().await?;
//!
//! let director = SessionDirector::new(platform, LobbyConfig::new("Alice"));
//! let session = director.create("Friday night", false, None).await?;
//! assert!(session.is_some());
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "memory-service")]
pub mod memory;

#[cfg(feature = "memory-service")]
pub use memory::{MemoryLobbyClient, MemoryLobbyServer, Operation};
