//! Tunnel Supervisor — manages a fleet of user-defined SSH reverse
//! port-forward tunnels: establishes the SSH session, runs the
//! reverse-forward, actively verifies the forwarded port is reachable,
//! classifies failures, applies a bounded retry policy, and broadcasts
//! status transitions to realtime subscribers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnelsup::broadcaster::StatusBroadcaster;
//! use tunnelsup::config::InMemoryConfigStore;
//! use tunnelsup::supervisor::Supervisor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryConfigStore::new());
//!     let broadcaster = Arc::new(StatusBroadcaster::new());
//!     let supervisor = Supervisor::new(store, broadcaster);
//!
//!     let app = tunnelsup::server::router(supervisor);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8787").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod broadcaster;
pub mod classify;
pub mod config;
pub mod error;
pub mod ingress;
pub mod instance;
pub mod liveness;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod verifier;

pub use broadcaster::StatusBroadcaster;
pub use config::{InMemoryConfigStore, ServerSettings, TunnelConfig, TunnelConfigStore};
pub use error::{SupervisorError, SupervisorResult};
pub use state::{Phase, StatusRecord, TunnelState};
pub use supervisor::Supervisor;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging with a filter driven by `RUST_LOG` (or
/// `log_filter` from [`ServerSettings`] when running under `serve`).
pub fn init_logging(default_filter: &str) -> SupervisorResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| SupervisorError::Config(e.to_string()))?;

    Ok(())
}
