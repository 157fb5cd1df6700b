//! gRPC health check service
//!
//! Implements `grpc.health.v1.Health` over the shared [`HealthRegistry`].
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md
//!
//! Unlike the reference server, `Check` on an unregistered name answers
//! `UNKNOWN` instead of failing with NOT_FOUND.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::pb::grpc::health::v1::health_check_response::ServingStatus;
use super::pb::grpc::health::v1::health_server::Health;
use super::pb::grpc::health::v1::{HealthCheckRequest, HealthCheckResponse};
use super::pb::plugin::health_control_server::HealthControl;
use super::pb::plugin::{ClearStatusRequest, Empty, SetStatusRequest};
use crate::health::{HealthRegistry, HealthStatus};

impl From<HealthStatus> for ServingStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Unknown => ServingStatus::Unknown,
            HealthStatus::Serving => ServingStatus::Serving,
            HealthStatus::NotServing => ServingStatus::NotServing,
        }
    }
}

impl From<ServingStatus> for HealthStatus {
    fn from(status: ServingStatus) -> Self {
        match status {
            ServingStatus::Serving => HealthStatus::Serving,
            ServingStatus::NotServing => HealthStatus::NotServing,
            ServingStatus::Unknown | ServingStatus::ServiceUnknown => HealthStatus::Unknown,
        }
    }
}

fn response(status: HealthStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: ServingStatus::from(status) as i32,
    }
}

/// Read side of the health registry: Check and Watch
#[derive(Debug, Clone)]
pub struct HealthService {
    registry: HealthRegistry,
    drain: CancellationToken,
}

impl HealthService {
    /// Serve `registry`; open watches end once `drain` is cancelled
    pub fn new(registry: HealthRegistry, drain: CancellationToken) -> Self {
        Self { registry, drain }
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        let status = self.registry.check(&service);
        tracing::debug!(service = %service, ?status, "health check");
        Ok(Response::new(response(status)))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;
        tracing::debug!(service = %service, "health watch started");

        // Queued changes are still delivered once draining starts; the stream
        // ends when the queue is empty. Dropping it (peer went away) drops the
        // subscription, which unregisters it from the registry.
        let subscription = self.registry.watch(&service);
        let stream = futures::stream::unfold(
            (subscription, self.drain.clone()),
            |(mut subscription, drain)| async move {
                tokio::select! {
                    biased;
                    Some(status) = subscription.next() => {
                        Some((Ok(response(status)), (subscription, drain)))
                    }
                    _ = drain.cancelled() => None,
                }
            },
        );

        Ok(Response::new(Box::pin(stream)))
    }
}

/// Write side of the health registry
#[derive(Debug, Clone)]
pub struct HealthControlService {
    registry: HealthRegistry,
}

impl HealthControlService {
    /// Mutate `registry`
    pub fn new(registry: HealthRegistry) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl HealthControl for HealthControlService {
    async fn set_status(
        &self,
        request: Request<SetStatusRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let status = ServingStatus::try_from(req.status)
            .map_err(|_| Status::invalid_argument(format!("unknown status {}", req.status)))?;

        self.registry.set_status(&req.service, status.into());
        Ok(Response::new(Empty {}))
    }

    async fn clear_status(
        &self,
        request: Request<ClearStatusRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.registry.clear_status(&request.into_inner().service);
        Ok(Response::new(Empty {}))
    }

    async fn clear_all(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.registry.clear_all();
        Ok(Response::new(Empty {}))
    }
}
