use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::{api, AppState, ServerConfig, TokenAuthenticator};
use parley_shared::types::IdentityId;
use parley_store::{Database, Persistence, SharedDatabase};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Parley relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.uses_dev_secret() {
        warn!("AUTH_SECRET not set, using the all-zero development key");
    }

    // -----------------------------------------------------------------------
    // 3. Open storage
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database ready");
    let store: Arc<dyn Persistence> = Arc::new(SharedDatabase::new(db));

    // -----------------------------------------------------------------------
    // 4. Wire up the relay
    // -----------------------------------------------------------------------
    let authenticator = Arc::new(TokenAuthenticator::new(config.auth_secret, store.clone()));

    // `parley-server issue-token <identity-id>` prints a token and exits.
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some("issue-token") {
        let id = IdentityId::from(
            args.next()
                .ok_or_else(|| anyhow::anyhow!("usage: parley-server issue-token <identity-id>"))?,
        );
        if store.find_identity(&id)?.is_none() {
            anyhow::bail!("unknown identity: {id}");
        }
        let ttl = Duration::from_secs(config.token_ttl_secs);
        println!("{}", authenticator.issue(&id, ttl));
        info!(identity = %id, ttl_secs = config.token_ttl_secs, "Issued credential token");
        return Ok(());
    }

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store, authenticator);

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
