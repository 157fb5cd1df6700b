//! Listener setup for the plugin endpoint
//!
//! Binding produces an [`EndpointBinding`] (what goes into the handshake) and a
//! [`BoundListener`] (what the gRPC server accepts from).

use std::path::{Path, PathBuf};

use tokio::net::TcpListener;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::handshake::Transport;
use crate::negotiation::HostEnv;

/// Where the endpoint ended up listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointBinding {
    /// TCP listener
    Tcp {
        /// Host name advertised to the host process
        host: String,
        /// Port actually bound
        port: u16,
    },
    /// Unix domain socket
    Unix {
        /// Socket file path
        path: PathBuf,
    },
}

impl EndpointBinding {
    /// Transport for the handshake
    pub fn transport(&self) -> Transport {
        match self {
            Self::Tcp { .. } => Transport::Tcp,
            Self::Unix { .. } => Transport::Unix,
        }
    }

    /// Address string for the handshake
    pub fn address(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("{host}:{port}"),
            Self::Unix { path } => path.display().to_string(),
        }
    }
}

/// A bound, not yet serving, listener
#[derive(Debug)]
pub enum BoundListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix listener; the socket file is removed when the guard drops
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, SocketFileGuard),
}

/// Removes a unix socket file on drop
#[derive(Debug)]
pub struct SocketFileGuard {
    path: PathBuf,
}

impl SocketFileGuard {
    /// Guard `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "socket file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove socket file")
            }
        }
    }
}

/// Bind the listener described by `config`, honoring host overrides
pub async fn bind(config: &EndpointConfig, host_env: &HostEnv) -> Result<(BoundListener, EndpointBinding)> {
    match config.transport {
        Transport::Tcp => match host_env.port_range()? {
            Some((min, max)) => bind_tcp_range(min, max).await,
            None => bind_tcp(&config.host, config.port).await,
        },
        Transport::Unix => {
            let dir = host_env
                .unix_socket_dir()
                .or_else(|| config.socket_dir.clone())
                .unwrap_or_else(std::env::temp_dir);
            bind_unix(&dir)
        }
    }
}

async fn bind_tcp(host: &str, port: u16) -> Result<(BoundListener, EndpointBinding)> {
    let address = format!("{host}:{port}");
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| Error::Bind {
            address: address.clone(),
            source,
        })?;
    let local = listener.local_addr()?;

    tracing::info!(%address, local = %local, "plugin listener bound");

    Ok((
        BoundListener::Tcp(listener),
        EndpointBinding::Tcp {
            host: host.to_string(),
            port: local.port(),
        },
    ))
}

async fn bind_tcp_range(min: u16, max: u16) -> Result<(BoundListener, EndpointBinding)> {
    for port in min..=max {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                tracing::info!(local = %local, min, max, "plugin listener bound in host port range");
                return Ok((
                    BoundListener::Tcp(listener),
                    EndpointBinding::Tcp {
                        host: "127.0.0.1".to_string(),
                        port: local.port(),
                    },
                ));
            }
            Err(e) => tracing::trace!(port, error = %e, "port unavailable"),
        }
    }

    Err(Error::PortRange { min, max })
}

#[cfg(unix)]
fn bind_unix(dir: &Path) -> Result<(BoundListener, EndpointBinding)> {
    let path = dir.join(format!("plugin-{}.sock", uuid::Uuid::new_v4().simple()));
    let listener = tokio::net::UnixListener::bind(&path).map_err(|source| Error::Bind {
        address: path.display().to_string(),
        source,
    })?;

    tracing::info!(path = %path.display(), "plugin listener bound on unix socket");

    Ok((
        BoundListener::Unix(listener, SocketFileGuard::new(&path)),
        EndpointBinding::Unix { path },
    ))
}

#[cfg(not(unix))]
fn bind_unix(dir: &Path) -> Result<(BoundListener, EndpointBinding)> {
    Err(Error::Bind {
        address: dir.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{MAX_PORT_ENV, MIN_PORT_ENV, UNIX_SOCKET_DIR_ENV};

    fn tcp_config(port: u16) -> EndpointConfig {
        EndpointConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..EndpointConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_reports_real_port() {
        let (listener, binding) = bind(&tcp_config(0), &HostEnv::default()).await.unwrap();
        let BoundListener::Tcp(listener) = listener else {
            panic!("expected tcp listener");
        };
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(binding.address(), format!("127.0.0.1:{port}"));
        assert_eq!(binding.transport(), Transport::Tcp);
    }

    #[tokio::test]
    async fn test_bind_taken_port_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind(&tcp_config(port), &HostEnv::default()).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_bind_in_host_range_skips_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        // Range holding only the taken port
        let env = HostEnv::from_vars([
            (MIN_PORT_ENV, port.to_string()),
            (MAX_PORT_ENV, port.to_string()),
        ]);
        let err = bind(&tcp_config(1234), &env).await.unwrap_err();
        assert!(matches!(err, Error::PortRange { .. }));
    }

    #[tokio::test]
    async fn test_bad_host_range_fails_before_binding() {
        let env = HostEnv::from_vars([(MIN_PORT_ENV, "9000"), (MAX_PORT_ENV, "8000")]);
        let err = bind(&tcp_config(0), &env).await.unwrap_err();
        assert!(matches!(err, Error::HostEnv(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = EndpointConfig {
            transport: Transport::Unix,
            ..EndpointConfig::default()
        };
        let env = HostEnv::from_vars([(UNIX_SOCKET_DIR_ENV, dir.path().display().to_string())]);

        let (listener, binding) = bind(&config, &env).await.unwrap();
        let EndpointBinding::Unix { path } = &binding else {
            panic!("expected unix binding");
        };
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
        assert_eq!(binding.transport(), Transport::Unix);

        drop(listener);
        assert!(!path.exists());
    }
}
