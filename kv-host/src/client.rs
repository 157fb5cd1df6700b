//! Launching a plugin process and talking to it

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kv_plugin::grpc::pb::grpc::health::v1::health_check_response::ServingStatus;
use kv_plugin::grpc::pb::grpc::health::v1::health_client::HealthClient;
use kv_plugin::grpc::pb::grpc::health::v1::HealthCheckRequest;
use kv_plugin::grpc::pb::proto::kv_client::KvClient;
use kv_plugin::grpc::pb::proto::{GetRequest, PutRequest};
use kv_plugin::handshake::{HandshakeRecord, Transport, CORE_PROTOCOL_VERSION};
use kv_plugin::negotiation::PROTOCOL_VERSIONS_ENV;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tonic::transport::{Channel, Endpoint};

/// How to start the plugin
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Plugin executable
    pub plugin: PathBuf,
    /// App protocol versions this host speaks
    pub versions: Vec<u32>,
    /// Magic cookie passed through the environment
    pub cookie: Option<(String, String)>,
    /// How long to wait for the handshake line
    pub start_timeout: Duration,
}

/// A running plugin with an open gRPC channel
pub struct PluginClient {
    child: Child,
    stdin: Option<ChildStdin>,
    record: HandshakeRecord,
    channel: Channel,
}

impl PluginClient {
    /// Start the plugin, read its handshake, and connect
    pub async fn launch(options: &LaunchOptions) -> Result<Self> {
        let mut command = Command::new(&options.plugin);
        command
            .env(PROTOCOL_VERSIONS_ENV, join_versions(&options.versions))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some((key, value)) = &options.cookie {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start plugin {}", options.plugin.display()))?;
        let stdin = child.stdin.take();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "kv_host::plugin", "{line}");
                }
            });
        }

        let stdout = child.stdout.take().context("plugin stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        let line = match tokio::time::timeout(options.start_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let status = child.wait().await?;
                bail!("plugin exited before handshake ({status})");
            }
            Ok(Err(e)) => return Err(e).context("Failed to read plugin handshake"),
            Err(_) => bail!(
                "plugin did not complete handshake within {}s",
                options.start_timeout.as_secs()
            ),
        };

        let record = validate_handshake(&line, &options.versions)?;
        tracing::info!(
            address = %record.address(),
            transport = %record.transport(),
            app_protocol_version = record.app_protocol_version(),
            "plugin handshake accepted"
        );

        let channel = connect(&record).await?;

        Ok(Self {
            child,
            stdin,
            record,
            channel,
        })
    }

    /// The accepted handshake
    pub fn handshake(&self) -> &HandshakeRecord {
        &self.record
    }

    /// Serving status of `service`
    pub async fn ping(&self, service: &str) -> Result<ServingStatus> {
        let resp = HealthClient::new(self.channel.clone())
            .check(HealthCheckRequest {
                service: service.to_string(),
            })
            .await?;
        Ok(resp.into_inner().status())
    }

    /// Store `value` under `key`
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        KvClient::new(self.channel.clone())
            .put(PutRequest {
                key: key.to_string(),
                value,
            })
            .await?;
        Ok(())
    }

    /// Fetch the value stored under `key`
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = KvClient::new(self.channel.clone())
            .get(GetRequest {
                key: key.to_string(),
            })
            .await?;
        Ok(resp.into_inner().value)
    }

    /// Close stdin, wait up to `timeout`, then kill
    pub async fn kill(mut self, timeout: Duration) -> Result<ExitStatus> {
        self.stdin.take();
        self.wait_or_kill(timeout).await
    }

    async fn wait_or_kill(&mut self, timeout: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                tracing::warn!("plugin did not exit in time, killing it");
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }
}

fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a handshake line and check it against what this host speaks
pub fn validate_handshake(line: &str, versions: &[u32]) -> Result<HandshakeRecord> {
    let record: HandshakeRecord = line
        .trim_end()
        .parse()
        .with_context(|| format!("Unrecognized handshake line: {line:?}"))?;

    if record.protocol_version() != CORE_PROTOCOL_VERSION {
        bail!(
            "Incompatible core protocol version {} (expected {CORE_PROTOCOL_VERSION})",
            record.protocol_version()
        );
    }
    if !versions.contains(&record.app_protocol_version()) {
        bail!(
            "Plugin chose app protocol version {}, host supports {:?}",
            record.app_protocol_version(),
            versions
        );
    }

    Ok(record)
}

async fn connect(record: &HandshakeRecord) -> Result<Channel> {
    match record.transport() {
        Transport::Tcp => {
            let channel = Endpoint::from_shared(format!("http://{}", record.address()))?
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}", record.address()))?;
            Ok(channel)
        }
        Transport::Unix => connect_unix(Path::new(record.address())).await,
    }
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> Result<Channel> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tonic::transport::Uri;

    let path = path.to_path_buf();
    let display = path.display().to_string();
    // The URI is ignored by the connector
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .with_context(|| format!("Failed to connect to {display}"))?;
    Ok(channel)
}

#[cfg(not(unix))]
async fn connect_unix(path: &Path) -> Result<Channel> {
    bail!("unix socket transport is not supported here: {}", path.display())
}
