//! The persistence interface consumed by the relay.
//!
//! All methods are blocking; async callers are expected to run them on the
//! blocking thread pool.

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Identity, IdentityId, Message};

pub trait Persistence: Send + Sync + 'static {
    fn create_message(&self, message: &Message) -> Result<()>;

    /// Messages where `identity` is sender or receiver.
    fn find_messages_for(&self, identity: &IdentityId) -> Result<Vec<Message>>;

    /// Mark every unseen message from `sender` to `receiver` as seen.
    fn mark_seen(&self, sender: &IdentityId, receiver: &IdentityId) -> Result<usize>;

    fn list_other_identities(&self, excluding: &IdentityId) -> Result<Vec<Identity>>;

    /// `Ok(None)` when no such identity exists.
    fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>>;
}

/// A [`Database`] shared between threads behind a mutex.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so every call takes the
/// lock for the duration of one statement.
#[derive(Clone)]
pub struct SharedDatabase {
    db: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let guard = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

impl Persistence for SharedDatabase {
    fn create_message(&self, message: &Message) -> Result<()> {
        self.with(|db| db.insert_message(message))
    }

    fn find_messages_for(&self, identity: &IdentityId) -> Result<Vec<Message>> {
        self.with(|db| db.messages_for(identity))
    }

    fn mark_seen(&self, sender: &IdentityId, receiver: &IdentityId) -> Result<usize> {
        self.with(|db| db.mark_seen(sender, receiver))
    }

    fn list_other_identities(&self, excluding: &IdentityId) -> Result<Vec<Identity>> {
        self.with(|db| db.list_users_except(excluding))
    }

    fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>> {
        self.with(|db| match db.get_user(id) {
            Ok(identity) => Ok(Some(identity)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        })
    }
}
