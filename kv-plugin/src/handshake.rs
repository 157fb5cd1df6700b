//! Handshake line announced to the host on stdout
//!
//! The host reads exactly one line of the form
//! `<core-protocol-version>|<app-protocol-version>|<transport>|<address>|<wire-format>`
//! before it tries to connect, e.g. `1|1|tcp|localhost:1234|grpc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Version of the plugin handshake protocol itself
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Network transport the endpoint listens on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// TCP socket, address is `host:port`
    #[default]
    Tcp,
    /// Unix domain socket, address is the socket path
    Unix,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(Error::InvalidHandshake(format!("unknown transport {other:?}"))),
        }
    }
}

/// Encoding of the services behind the endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// gRPC over HTTP/2
    #[default]
    Grpc,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

impl FromStr for WireFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grpc" => Ok(Self::Grpc),
            other => Err(Error::InvalidHandshake(format!("unsupported wire format {other:?}"))),
        }
    }
}

/// Everything the host needs to reach the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    protocol_version: u32,
    app_protocol_version: u32,
    transport: Transport,
    address: String,
    wire_format: WireFormat,
}

impl HandshakeRecord {
    /// Build a record, rejecting zero versions and unencodable addresses
    pub fn new(
        protocol_version: u32,
        app_protocol_version: u32,
        transport: Transport,
        address: impl Into<String>,
        wire_format: WireFormat,
    ) -> Result<Self> {
        let address = address.into();

        if protocol_version == 0 || app_protocol_version == 0 {
            return Err(Error::InvalidHandshake(
                "protocol versions must be at least 1".to_string(),
            ));
        }
        if address.is_empty() || address.contains(['|', '\n', '\r']) {
            return Err(Error::InvalidHandshake(format!(
                "address {address:?} cannot be encoded in a handshake line"
            )));
        }

        Ok(Self {
            protocol_version,
            app_protocol_version,
            transport,
            address,
            wire_format,
        })
    }

    /// Core protocol version
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Negotiated app protocol version
    pub fn app_protocol_version(&self) -> u32 {
        self.app_protocol_version
    }

    /// Listener transport
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Address the host should dial
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wire format of the served services
    pub fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    /// Write the record as one newline-terminated line and flush it.
    ///
    /// The host blocks on this line, so nothing is left buffered. Any error
    /// here is fatal for the plugin.
    pub fn emit<W: Write>(&self, out: &mut W) -> Result<()> {
        let line = format!("{self}\n");
        out.write_all(line.as_bytes()).map_err(Error::Handshake)?;
        out.flush().map_err(Error::Handshake)?;

        tracing::info!(handshake = %self, "handshake emitted");
        Ok(())
    }
}

impl fmt::Display for HandshakeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.protocol_version,
            self.app_protocol_version,
            self.transport,
            self.address,
            self.wire_format
        )
    }
}

impl FromStr for HandshakeRecord {
    type Err = Error;

    /// Parse a handshake line as read by a host
    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(Error::InvalidHandshake(format!(
                "expected 5 fields, got {}: {line:?}",
                parts.len()
            )));
        }

        let version = |field: &str, name: &str| {
            field
                .parse::<u32>()
                .map_err(|e| Error::InvalidHandshake(format!("bad {name} {field:?}: {e}")))
        };

        Self::new(
            version(parts[0], "core protocol version")?,
            version(parts[1], "app protocol version")?,
            parts[2].parse()?,
            parts[3],
            parts[4].parse()?,
        )
    }
}
