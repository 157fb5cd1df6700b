//! `plugin.GRPCController` service

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::pb::plugin::grpc_controller_server::GrpcController;
use super::pb::plugin::Empty;

/// Translates a host `Shutdown` call into the plugin's shutdown trigger
#[derive(Debug, Clone)]
pub struct ControllerService {
    shutdown: CancellationToken,
}

impl ControllerService {
    /// Cancel `shutdown` when the host asks us to stop
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[tonic::async_trait]
impl GrpcController for ControllerService {
    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        tracing::info!("host requested shutdown");
        self.shutdown.cancel();
        Ok(Response::new(Empty {}))
    }
}
