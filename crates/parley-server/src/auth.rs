//! Identity binding for inbound connections.
//!
//! Credential issuance belongs to the account system; the relay only needs
//! to turn an opaque token into an [`Identity`]. Tokens minted by
//! [`TokenAuthenticator`] have the form
//!
//! ```text
//! <identity-id>.<expiry, epoch seconds>.<hex keyed BLAKE3 MAC>
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use parley_shared::types::{Identity, IdentityId};
use parley_store::{Persistence, StoreError};

const MAC_CONTEXT: &[u8] = b"parley-token-v1:";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No credential token supplied")]
    MissingToken,

    #[error("Malformed credential token")]
    Malformed,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token expired")]
    Expired,

    #[error("Unknown identity: {0}")]
    UnknownIdentity(IdentityId),

    #[error("Identity lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Resolves a credential token into the identity it was issued for.
///
/// Implementations may block (e.g. hit the database); async callers run
/// them on the blocking pool.
pub trait Authenticator: Send + Sync + 'static {
    fn resolve_identity(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Stateless MAC-signed tokens backed by the identity table.
pub struct TokenAuthenticator {
    secret: [u8; 32],
    store: Arc<dyn Persistence>,
}

impl TokenAuthenticator {
    pub fn new(secret: [u8; 32], store: Arc<dyn Persistence>) -> Self {
        Self { secret, store }
    }

    /// Mint a token for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &IdentityId, ttl: Duration) -> String {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        let payload = format!("{identity}.{expires_at}");
        let mac = self.mac(&payload);
        format!("{payload}.{}", hex::encode(mac))
    }

    fn mac(&self, payload: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.secret);
        hasher.update(MAC_CONTEXT);
        hasher.update(payload.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Check signature and expiry, returning the identity id on success.
    fn verify(&self, token: &str) -> Result<IdentityId, AuthError> {
        // Ids may themselves contain dots, so split from the right.
        let mut parts = token.rsplitn(3, '.');
        let (Some(mac_hex), Some(expiry), Some(id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        if id.is_empty() {
            return Err(AuthError::Malformed);
        }

        let provided = hex::decode(mac_hex).map_err(|_| AuthError::Malformed)?;
        let expected = self.mac(&format!("{id}.{expiry}"));
        if provided.len() != expected.len()
            || expected.as_slice().ct_eq(provided.as_slice()).unwrap_u8() != 1
        {
            return Err(AuthError::BadSignature);
        }

        let expires_at: i64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        if expires_at <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(IdentityId::from(id))
    }
}

impl Authenticator for TokenAuthenticator {
    fn resolve_identity(&self, token: &str) -> Result<Identity, AuthError> {
        let id = self.verify(token)?;
        self.store
            .find_identity(&id)?
            .ok_or(AuthError::UnknownIdentity(id))
    }
}
