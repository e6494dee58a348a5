//! # courier-server
//!
//! Text messaging server speaking newline-delimited JSON over TCP.
//!
//! This binary provides:
//! - **Accounts**: registration and login against a SQLite user table
//! - **Direct messages**: relayed live to online recipients, stored and
//!   flushed at login for offline ones
//! - **Typing indicators**: best-effort, online recipients only
//!
//! One task per connection reads and dispatches frames; a process-wide
//! session registry maps each logged-in user to their single live
//! connection (last login wins).

mod config;
mod connection;
mod credentials;
mod dispatcher;
mod error;
mod registry;
mod router;
mod server;
mod store;
#[cfg(test)]
mod testutil;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_shared::constants::APP_NAME;
use courier_store::Database;

use crate::config::ServerConfig;
use crate::server::Server;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let mut config = ServerConfig::from_env();
    if let Err(usage) = config.apply_args(std::env::args().skip(1)) {
        eprintln!("{usage}");
        std::process::exit(2);
    }

    info!("Starting {APP_NAME} server v{}", env!("CARGO_PKG_VERSION"));
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database and bind
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");

    let server = Server::bind(&config, Store::new(db)).await?;
    let registry = server.registry();
    info!(addr = %server.local_addr()?, "Listening");

    // -----------------------------------------------------------------------
    // 4. Serve until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!(online = registry.len().await, "Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
