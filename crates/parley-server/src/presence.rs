//! Presence registry and per-identity connection groups.
//!
//! Group membership is the only liveness signal, so membership and the
//! presence table live behind one lock: the 0 -> 1 and 1 -> 0 transitions
//! of an identity's group are detected in the same critical section that
//! joins or leaves it. Broadcasts are enqueued before the lock is released,
//! which keeps an identity's online/offline announcements in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use parley_shared::protocol::ServerEvent;
use parley_shared::types::{IdentityId, Presence, PresenceSnapshot};

/// Outbound queue of one live connection.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryInner {
    /// identity -> live connections bound to it
    groups: HashMap<IdentityId, HashMap<ConnectionId, Outbox>>,
    presence: PresenceSnapshot,
}

impl RegistryInner {
    fn broadcast(&self, event: &ServerEvent) -> usize {
        self.groups
            .values()
            .flat_map(|group| group.values())
            .filter(|outbox| outbox.send(event.clone()).is_ok())
            .count()
    }

    fn announce(&mut self, identity: &IdentityId, presence: Presence) {
        self.presence.insert(identity.clone(), presence);
        let mut change = PresenceSnapshot::new();
        change.insert(identity.clone(), presence);
        let reached = self.broadcast(&ServerEvent::UserStatus(change));
        debug!(identity = %identity, ?presence, reached, "Broadcast presence change");
    }
}

/// Process-wide presence state. Resets on restart.
pub struct PresenceRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join `outbox` to the identity's group.
    ///
    /// The first connection of an identity flips it to `Online` and
    /// announces that to every live connection (including the new one).
    pub async fn mark_online(&self, identity: &IdentityId, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().await;

        let group = inner.groups.entry(identity.clone()).or_default();
        group.insert(id, outbox);
        let size = group.len();

        if size == 1 {
            info!(identity = %identity, connection = %id, "Identity online");
            inner.announce(identity, Presence::Online);
        } else {
            debug!(
                identity = %identity,
                connection = %id,
                connections = size,
                "Additional connection joined"
            );
        }

        id
    }

    /// Remove a connection from its group; if the group is now empty the
    /// identity becomes `LastSeen(now)` and that is announced to everyone.
    ///
    /// Returns `true` when this was the identity's last connection. Removing
    /// an unknown connection is a no-op.
    pub async fn mark_offline_if_last_connection(
        &self,
        identity: &IdentityId,
        connection: ConnectionId,
    ) -> bool {
        let mut inner = self.inner.lock().await;

        let Some(group) = inner.groups.get_mut(identity) else {
            return false;
        };
        if group.remove(&connection).is_none() {
            return false;
        }
        if !group.is_empty() {
            debug!(
                identity = %identity,
                connection = %connection,
                connections = group.len(),
                "Connection left, identity still online"
            );
            return false;
        }

        inner.groups.remove(identity);
        info!(identity = %identity, connection = %connection, "Identity offline");
        inner.announce(identity, Presence::LastSeen(Utc::now()));
        true
    }

    /// Deliver to every connection of `identity`; returns how many accepted it.
    pub async fn send_to(&self, identity: &IdentityId, event: &ServerEvent) -> usize {
        self.send_to_except(identity, None, event).await
    }

    /// Like [`send_to`](Self::send_to) but skipping one connection, typically
    /// the one the event came from.
    pub async fn send_to_except(
        &self,
        identity: &IdentityId,
        except: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let inner = self.inner.lock().await;
        inner.groups.get(identity).map_or(0, |group| {
            group
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .filter(|(_, outbox)| outbox.send(event.clone()).is_ok())
                .count()
        })
    }

    pub async fn snapshot(&self) -> PresenceSnapshot {
        self.inner.lock().await.presence.clone()
    }

    pub async fn connection_count(&self, identity: &IdentityId) -> usize {
        self.inner
            .lock()
            .await
            .groups
            .get(identity)
            .map_or(0, HashMap::len)
    }

    /// Number of identities with at least one live connection.
    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.groups.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
