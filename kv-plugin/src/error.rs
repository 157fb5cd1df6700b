//! Error types and gRPC status conversion

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Plugin error type
///
/// Startup variants (bind, handshake, cookie, host environment) end the
/// process with a non-zero exit. The store variants are scoped to a single
/// RPC and converted into a [`tonic::Status`].
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint listener could not be bound
    #[error("Failed to bind plugin listener on {address}: {source}")]
    Bind {
        /// Address or socket path that was attempted
        address: String,
        /// Underlying bind error
        #[source]
        source: io::Error,
    },

    /// No port in the host-supplied range was free
    #[error("Couldn't bind plugin TCP listener in port range {min}..={max}")]
    PortRange {
        /// Lowest port tried
        min: u16,
        /// Highest port tried
        max: u16,
    },

    /// Writing the handshake line failed
    #[error("Failed to write handshake: {0}")]
    Handshake(#[source] io::Error),

    /// A handshake record could not be built or parsed
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The magic cookie did not match; the binary was not launched by a host
    #[error("Magic cookie {key} missing or mismatched")]
    MagicCookie {
        /// Environment variable holding the cookie
        key: String,
    },

    /// A host-supplied environment variable was malformed
    #[error("Invalid host environment: {0}")]
    HostEnv(String),

    /// gRPC transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Key not present in the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key rejected by the store
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(key) => tonic::Status::not_found(format!("key {key} not found")),
            Error::InvalidKey(msg) => tonic::Status::invalid_argument(msg),
            Error::Io(e) => {
                tracing::error!(error = %e, "store I/O error");
                tonic::Status::internal("store operation failed")
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
