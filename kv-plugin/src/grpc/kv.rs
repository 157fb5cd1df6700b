//! `proto.KV` application service

use std::sync::Arc;

use tonic::{Request, Response, Status};

use super::pb::proto::kv_server::Kv;
use super::pb::proto::{Empty, GetRequest, GetResponse, PutRequest};
use crate::store::KvStore;

/// Exposes a [`KvStore`] over gRPC; store failures become call statuses
#[derive(Clone)]
pub struct KvService {
    store: Arc<dyn KvStore>,
}

impl KvService {
    /// Wrap a store
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl Kv for KvService {
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();

        let value = self.store.get(&req.key).await.map_err(|e| {
            tracing::warn!(key = %req.key, error = %e, "get failed");
            Status::from(e)
        })?;

        tracing::debug!(key = %req.key, bytes = value.len(), "get");
        Ok(Response::new(GetResponse { value }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let bytes = req.value.len();

        self.store.put(&req.key, req.value).await.map_err(|e| {
            tracing::warn!(key = %req.key, error = %e, "put failed");
            Status::from(e)
        })?;

        tracing::debug!(key = %req.key, bytes, "put");
        Ok(Response::new(Empty {}))
    }
}
