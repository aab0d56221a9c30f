//! # parley-server
//!
//! Real-time relay for two-party chat and audio call signaling.
//!
//! - **Identity binding**: sockets are bound to an identity at handshake
//! - **Presence**: online / last-seen tracking broadcast to every connection
//! - **Relay**: chat messages, typing and seen signals, call signaling
//! - **Initial sync**: one `data` payload pushed after connect
//! - **HTTP**: health and instance info next to the WebSocket endpoint

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod relay;
pub mod sync;

pub use api::{build_router, serve, serve_on, AppState};
pub use auth::{AuthError, Authenticator, TokenAuthenticator};
pub use config::ServerConfig;
pub use error::ServerError;
pub use presence::PresenceRegistry;
