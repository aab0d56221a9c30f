//! Records persisted in the SQLite database.
//!
//! Messages and identities are stored in exactly the shape they travel on
//! the wire, so those types are re-exported from `parley-shared`.

use chrono::{DateTime, Utc};

pub use parley_shared::types::{Identity, IdentityId, Message};

/// A user row as written by the account system.
///
/// The password hash lives only here; [`Identity`] is what the real-time
/// core ever reads back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub identity: Identity,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl NewUser {
    pub fn new(identity: Identity, password_hash: impl Into<String>) -> Self {
        Self {
            identity,
            password_hash: password_hash.into(),
            created_at: Utc::now(),
        }
    }
}
