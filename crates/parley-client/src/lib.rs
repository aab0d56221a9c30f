//! Parley chat client: a relay session with local chat state and voice
//! calls.

pub mod chat;
pub mod client;

pub use chat::{ChatState, Contact};
pub use client::{wait_for_sync, Client, ClientError, ClientNotice, Synced};
