//! Plugin lifecycle controller
//!
//! ```text
//! Init -> Starting -> Ready -> Serving -> Draining -> Terminated
//!             \
//!              +-> Failed (bind error, handshake write error, bad host env)
//! ```
//!
//! Nothing is written to the handshake channel unless the listener is bound,
//! so a failed start leaves the host with silence and a non-zero exit rather
//! than a line it cannot use.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::endpoint;
use crate::error::{Error, Result};
use crate::grpc::GrpcServicesBuilder;
use crate::handshake::{HandshakeRecord, WireFormat, CORE_PROTOCOL_VERSION};
use crate::health::{HealthRegistry, HealthStatus};
use crate::negotiation::HostEnv;
use crate::store::KvStore;

/// Lifecycle states, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registry created, nothing bound
    Init,
    /// Health set, bind in progress
    Starting,
    /// Bound and handshake written
    Ready,
    /// Accepting calls until a termination trigger
    Serving,
    /// No new calls, in-flight calls finishing
    Draining,
    /// Clean exit
    Terminated,
    /// Startup or serving failed
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives one plugin process from startup to exit
pub struct PluginServer {
    config: Config,
    host_env: HostEnv,
    registry: HealthRegistry,
    store: Arc<dyn KvStore>,
    state: LifecycleState,
}

impl PluginServer {
    /// Create a server in the Init state
    pub fn new(config: Config, host_env: HostEnv, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            host_env,
            registry: HealthRegistry::new(),
            store,
            state: LifecycleState::Init,
        }
    }

    /// Registry backing the health services
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        tracing::info!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
    }

    /// Run until `shutdown` is cancelled
    ///
    /// `handshake_out` receives the handshake line (stdout in production).
    /// Errors returned from here are fatal and map to a non-zero exit.
    pub async fn run<W: Write>(
        &mut self,
        mut handshake_out: W,
        shutdown: CancellationToken,
    ) -> Result<()> {
        match self.run_inner(&mut handshake_out, shutdown).await {
            Ok(()) => {
                self.transition(LifecycleState::Terminated);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "plugin failed");
                self.transition(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn run_inner<W: Write>(
        &mut self,
        handshake_out: &mut W,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.transition(LifecycleState::Starting);

        self.host_env.check_magic_cookie(&self.config.plugin)?;
        let app_version = self
            .host_env
            .negotiate_version(&self.config.plugin.app_protocol_versions)?;

        self.registry
            .set_status(&self.config.plugin.health_service, HealthStatus::Serving);

        let (listener, binding) = endpoint::bind(&self.config.endpoint, &self.host_env).await?;

        let record = HandshakeRecord::new(
            CORE_PROTOCOL_VERSION,
            app_version,
            binding.transport(),
            binding.address(),
            WireFormat::Grpc,
        )?;

        let drain = CancellationToken::new();
        let mut serving = GrpcServicesBuilder::new(
            self.registry.clone(),
            self.store.clone(),
            shutdown.clone(),
            drain.clone(),
        )
        .serve(listener);

        if let Err(e) = record.emit(handshake_out) {
            drain.cancel();
            serving.finish(self.config.endpoint.shutdown_grace()).await.ok();
            return Err(e);
        }
        self.transition(LifecycleState::Ready);
        self.transition(LifecycleState::Serving);

        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = serving.stopped() => {
                // The server only stops by itself on a transport failure
                result?;
                return Err(Error::Internal(
                    "server stopped without a shutdown request".to_string(),
                ));
            }
        }

        self.transition(LifecycleState::Draining);
        self.registry.shutdown();
        drain.cancel();
        serving.finish(self.config.endpoint.shutdown_grace()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::pb::grpc::health::v1::health_check_response::ServingStatus;
    use crate::grpc::pb::grpc::health::v1::health_client::HealthClient;
    use crate::grpc::pb::grpc::health::v1::HealthCheckRequest;
    use crate::grpc::pb::plugin::grpc_controller_client::GrpcControllerClient;
    use crate::grpc::pb::plugin::Empty;
    use crate::grpc::pb::proto::kv_client::KvClient;
    use crate::grpc::pb::proto::{GetRequest, PutRequest};
    use crate::store::MemoryStore;
    use futures::StreamExt;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tonic::transport::Channel;

    /// Handshake sink the test can read while the server runs
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }

        async fn wait_for_line(&self) -> String {
            for _ in 0..200 {
                let contents = self.contents();
                if contents.ends_with('\n') {
                    return contents;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no handshake line was written");
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config(port: u16) -> Config {
        let mut config = Config::default();
        config.endpoint.host = "127.0.0.1".to_string();
        config.endpoint.port = port;
        config.endpoint.shutdown_grace_secs = 1;
        config
    }

    fn start(
        config: Config,
    ) -> (
        SharedBuf,
        CancellationToken,
        tokio::task::JoinHandle<(Result<()>, LifecycleState)>,
    ) {
        start_with_store(config, Arc::new(MemoryStore::new()))
    }

    fn start_with_store(
        config: Config,
        store: Arc<dyn KvStore>,
    ) -> (
        SharedBuf,
        CancellationToken,
        tokio::task::JoinHandle<(Result<()>, LifecycleState)>,
    ) {
        let out = SharedBuf::default();
        let token = CancellationToken::new();
        let mut server = PluginServer::new(config, HostEnv::default(), store);

        let task = {
            let out = out.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let result = server.run(out, token).await;
                (result, server.state())
            })
        };

        (out, token, task)
    }

    async fn connect(line: &str) -> Channel {
        let record: HandshakeRecord = line.parse().unwrap();
        Channel::from_shared(format!("http://{}", record.address()))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let (out, token, task) = start(test_config(0));

        let line = out.wait_for_line().await;
        let record: HandshakeRecord = line.parse().unwrap();
        assert_eq!(record.protocol_version(), 1);
        assert_eq!(record.app_protocol_version(), 1);
        assert!(line.starts_with("1|1|tcp|127.0.0.1:"));
        assert!(line.ends_with("|grpc\n"));
        assert_eq!(line.matches('\n').count(), 1);

        let channel = connect(&line).await;

        let mut health = HealthClient::new(channel.clone());
        let resp = health
            .check(HealthCheckRequest {
                service: "plugin".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.into_inner().status(), ServingStatus::Serving);

        let mut kv = KvClient::new(channel);
        kv.put(PutRequest {
            key: "a".to_string(),
            value: b"v1".to_vec(),
        })
        .await
        .unwrap();
        let got = kv
            .get(GetRequest {
                key: "a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(got.into_inner().value, b"v1");

        token.cancel();
        let (result, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LifecycleState::Terminated);
        assert_eq!(out.contents().matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn test_call_failures_do_not_affect_health() {
        let (out, token, task) = start(test_config(0));
        let channel = connect(&out.wait_for_line().await).await;

        let mut kv = KvClient::new(channel.clone());
        let status = kv
            .get(GetRequest {
                key: "missing".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let mut health = HealthClient::new(channel);
        let resp = health
            .check(HealthCheckRequest {
                service: "plugin".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(resp.into_inner().status(), ServingStatus::Serving);

        token.cancel();
        let (result, _) = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_watchers_see_not_serving_on_drain() {
        let (out, token, task) = start(test_config(0));
        let channel = connect(&out.wait_for_line().await).await;

        let mut health = HealthClient::new(channel);
        let mut stream = health
            .watch(HealthCheckRequest {
                service: "plugin".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.status(), ServingStatus::Serving);

        token.cancel();

        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last.status(), ServingStatus::NotServing);

        let (result, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_controller_shutdown_drains() {
        let (out, _token, task) = start(test_config(0));
        let channel = connect(&out.wait_for_line().await).await;

        let mut controller = GrpcControllerClient::new(channel);
        controller.shutdown(Empty {}).await.unwrap();

        let (result, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_bind_failure_emits_nothing() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (out, _token, task) = start(test_config(port));
        let (result, state) = task.await.unwrap();

        assert!(matches!(result, Err(Error::Bind { .. })));
        assert_eq!(state, LifecycleState::Failed);
        assert!(out.contents().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_write_failure_is_fatal() {
        struct Closed;

        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut server = PluginServer::new(
            test_config(0),
            HostEnv::default(),
            Arc::new(MemoryStore::new()),
        );
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            server.run(Closed, CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(server.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_magic_cookie_mismatch_emits_nothing() {
        let mut config = test_config(0);
        config.plugin.magic_cookie_key = Some("KV_PLUGIN_TEST_COOKIE".to_string());
        config.plugin.magic_cookie_value = Some("expected".to_string());

        let out = SharedBuf::default();
        let mut server = PluginServer::new(config, HostEnv::default(), Arc::new(MemoryStore::new()));
        let result = server.run(out.clone(), CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::MagicCookie { .. })));
        assert!(out.contents().is_empty());
    }

    /// Store whose reads outlive any reasonable grace period
    struct StalledStore;

    #[async_trait::async_trait]
    impl KvStore for StalledStore {
        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn get(&self, _key: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_in_flight_call_is_cut_off_after_grace_period() {
        let (out, token, task) = start_with_store(test_config(0), Arc::new(StalledStore));
        let channel = connect(&out.wait_for_line().await).await;

        let call = tokio::spawn(async move {
            KvClient::new(channel)
                .get(GetRequest {
                    key: "slow".to_string(),
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!call.is_finished());

        let started = std::time::Instant::now();
        token.cancel();
        let (result, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LifecycleState::Terminated);
        assert!(started.elapsed() >= Duration::from_secs(1));

        // The connection was closed under the call, so it fails well before the store returns
        let outcome = tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .expect("in-flight call still pending after force close")
            .unwrap();
        assert!(outcome.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        use crate::handshake::Transport;
        use hyper_util::rt::TokioIo;
        use tokio::net::UnixStream;
        use tonic::transport::{Endpoint, Uri};

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(0);
        config.endpoint.transport = Transport::Unix;
        config.endpoint.socket_dir = Some(dir.path().to_path_buf());

        let (out, token, task) = start(config);
        let line = out.wait_for_line().await;
        let record: HandshakeRecord = line.parse().unwrap();
        assert_eq!(record.transport(), Transport::Unix);
        assert!(line.starts_with("1|1|unix|"));

        let path = std::path::PathBuf::from(record.address());
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        let socket = path.clone();
        let channel = Endpoint::try_from("http://[::]:50051")
            .unwrap()
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
            }))
            .await
            .unwrap();

        let mut kv = KvClient::new(channel);
        kv.put(PutRequest {
            key: "a".to_string(),
            value: b"v1".to_vec(),
        })
        .await
        .unwrap();
        let got = kv
            .get(GetRequest {
                key: "a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(got.into_inner().value, b"v1");

        token.cancel();
        let (result, state) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(state, LifecycleState::Terminated);
        assert!(!path.exists());
    }
}
