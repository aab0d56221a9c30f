//! # parley-store
//!
//! Durable storage for identities and chat messages, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` with typed CRUD helpers, and the [`Persistence`]
//! trait through which the relay server reads and writes records.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod persistence;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use persistence::{Persistence, SharedDatabase};
