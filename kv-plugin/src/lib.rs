//! # kv-plugin
//!
//! Out-of-process key/value plugin speaking the go-plugin gRPC handshake.
//!
//! A host launches the plugin binary, reads one handshake line from its
//! stdout, connects over gRPC, and keeps the plugin's stdin open for as long
//! as it wants the plugin alive.
//!
//! - **Health registry**: named serving statuses, exposed via `grpc.health.v1`
//! - **Endpoint**: tcp or unix listener hosting every service on one port
//! - **Handshake**: `1|<app-version>|<transport>|<address>|grpc`, flushed once
//! - **Lifecycle**: bind, announce, serve, drain on stdin EOF / SIGTERM / `Shutdown`
//!
//! ## Example
//!
//! ```rust,no_run
//! use kv_plugin::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(watch_host(
//!         tokio::io::stdin(),
//!         shutdown.clone(),
//!         config.endpoint.liveness_poll(),
//!     ));
//!
//!     let store = store::from_config(&config.store);
//!     PluginServer::new(config, HostEnv::from_env(), store)
//!         .run(std::io::stdout(), shutdown)
//!         .await
//! }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod grpc;
pub mod handshake;
pub mod health;
pub mod lifecycle;
pub mod liveness;
pub mod negotiation;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::handshake::{HandshakeRecord, Transport, WireFormat, CORE_PROTOCOL_VERSION};
    pub use crate::health::{HealthRegistry, HealthStatus};
    pub use crate::lifecycle::{LifecycleState, PluginServer};
    pub use crate::liveness::{watch_host, watch_signals};
    pub use crate::negotiation::HostEnv;
    pub use crate::observability::init_tracing;
    pub use crate::store::{self, KvStore};
}
