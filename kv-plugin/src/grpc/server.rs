//! gRPC server wiring

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tower::layer::util::{Identity, Stack};
use tower_http::classify::{GrpcErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;

use super::controller::ControllerService;
use super::force_close::ForceClose;
use super::health::{HealthControlService, HealthService};
use super::kv::KvService;
use super::pb::grpc::health::v1::health_server::HealthServer;
use super::pb::plugin::grpc_controller_server::GrpcControllerServer;
use super::pb::plugin::health_control_server::HealthControlServer;
use super::pb::proto::kv_server::KvServer;
use crate::endpoint::BoundListener;
use crate::error::{Error, Result};
use crate::health::HealthRegistry;
use crate::store::KvStore;

type PluginRouter = Router<Stack<TraceLayer<SharedClassifier<GrpcErrorsAsFailures>>, Identity>>;

/// Builder for the plugin's gRPC services
///
/// Registers health, health control, controller and KV services on one
/// tonic server with a gRPC trace layer in front.
pub struct GrpcServicesBuilder {
    registry: HealthRegistry,
    store: Arc<dyn KvStore>,
    shutdown: CancellationToken,
    drain: CancellationToken,
}

impl GrpcServicesBuilder {
    /// Create a new services builder
    ///
    /// `shutdown` is cancelled by the controller service when the host asks
    /// us to stop. `drain` stops the server and ends open watches.
    pub fn new(
        registry: HealthRegistry,
        store: Arc<dyn KvStore>,
        shutdown: CancellationToken,
        drain: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            shutdown,
            drain,
        }
    }

    /// Build the router
    pub fn build(self) -> PluginRouter {
        Server::builder()
            .layer(TraceLayer::new_for_grpc())
            .add_service(HealthServer::new(HealthService::new(
                self.registry.clone(),
                self.drain.clone(),
            )))
            .add_service(HealthControlServer::new(HealthControlService::new(
                self.registry,
            )))
            .add_service(GrpcControllerServer::new(ControllerService::new(
                self.shutdown,
            )))
            .add_service(KvServer::new(KvService::new(self.store)))
    }

    /// Start accepting on `listener` in a background task
    ///
    /// The server stops accepting once `drain` is cancelled and finishes when
    /// in-flight calls complete. Every accepted connection is wrapped so
    /// [`ServingTask::finish`] can cut it off after the grace period.
    pub fn serve(self, listener: BoundListener) -> ServingTask {
        let signal = self.drain.clone().cancelled_owned();
        let force = CancellationToken::new();
        let router = self.build();

        let handle = match listener {
            BoundListener::Tcp(listener) => {
                let force = force.clone();
                let incoming = TcpListenerStream::new(listener)
                    .map(move |conn| conn.map(|io| ForceClose::new(io, force.clone())));
                tokio::spawn(async move { router.serve_with_incoming_shutdown(incoming, signal).await })
            }
            #[cfg(unix)]
            BoundListener::Unix(listener, socket_file) => {
                let force = force.clone();
                let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener)
                    .map(move |conn| conn.map(|io| ForceClose::new(io, force.clone())));
                tokio::spawn(async move {
                    let result = router.serve_with_incoming_shutdown(incoming, signal).await;
                    drop(socket_file);
                    result
                })
            }
        };

        ServingTask { handle, force }
    }
}

/// Handle to the background serving task
#[derive(Debug)]
pub struct ServingTask {
    handle: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
    force: CancellationToken,
}

impl ServingTask {
    /// Resolves if the server stops on its own
    pub async fn stopped(&mut self) -> Result<()> {
        flatten(&mut self.handle).await
    }

    /// Wait up to `grace` for the drained server to finish, then force it closed
    ///
    /// On return every connection accepted by this task has been cut off.
    pub async fn finish(mut self, grace: Duration) -> Result<()> {
        let result = match tokio::time::timeout(grace, flatten(&mut self.handle)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "in-flight calls did not finish within grace period, forcing close"
                );
                self.force.cancel();
                self.handle.abort();
                // Wait for the serve future (and a unix socket guard) to be dropped
                if let Err(e) = (&mut self.handle).await {
                    if !e.is_cancelled() {
                        tracing::warn!(error = %e, "serving task failed during force close");
                    }
                }
                Ok(())
            }
        };

        // Idle connections a clean finish left behind are closed too
        self.force.cancel();
        result
    }
}

async fn flatten(
    handle: &mut JoinHandle<std::result::Result<(), tonic::transport::Error>>,
) -> Result<()> {
    match handle.await {
        Ok(result) => result.map_err(Error::from),
        Err(e) => Err(Error::Internal(format!("serving task failed: {e}"))),
    }
}
