//! Initial sync payload pushed once to every freshly bound connection.

use std::sync::Arc;

use tracing::debug;

use parley_shared::protocol::{InitialData, ServerEvent};
use parley_shared::types::Identity;
use parley_store::Persistence;

use crate::error::ServerError;
use crate::presence::PresenceRegistry;

/// Assemble the `data` event for `identity`: its own profile, every other
/// identity, its full message history and the current presence snapshot.
pub async fn initial_payload(
    store: &Arc<dyn Persistence>,
    registry: &PresenceRegistry,
    identity: &Identity,
) -> Result<ServerEvent, ServerError> {
    let reader = store.clone();
    let id = identity.id.clone();
    let (contacts, messages) = tokio::task::spawn_blocking(move || {
        let contacts = reader.list_other_identities(&id)?;
        let messages = reader.find_messages_for(&id)?;
        Ok::<_, ServerError>((contacts, messages))
    })
    .await??;

    let presence = registry.snapshot().await;
    debug!(
        identity = %identity.id,
        contacts = contacts.len(),
        messages = messages.len(),
        online = presence.values().filter(|p| p.is_online()).count(),
        "Assembled initial sync"
    );

    Ok(ServerEvent::Data(InitialData {
        user: identity.clone(),
        contacts,
        messages,
        presence,
    }))
}
