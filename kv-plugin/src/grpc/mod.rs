//! gRPC services hosted on the plugin endpoint
//!
//! Four services share one listener:
//! - `grpc.health.v1.Health`: Check and Watch, read by the host to decide readiness
//! - `plugin.HealthControl`: SetStatus / ClearStatus / ClearAll on the same registry
//! - `plugin.GRPCController`: lets the host request a graceful shutdown
//! - `proto.KV`: the application service
//!
//! ## Example
//!
//! ```ignore
//! use kv_plugin::grpc::GrpcServicesBuilder;
//!
//! let router = GrpcServicesBuilder::new(registry, store, shutdown, drain).build();
//! router.serve_with_incoming_shutdown(incoming, drain.cancelled()).await?;
//! ```

pub mod controller;
mod force_close;
pub mod health;
pub mod kv;
pub mod server;

/// Generated protobuf types and service stubs
pub mod pb {
    /// Standard gRPC health protocol
    pub mod grpc {
        pub mod health {
            pub mod v1 {
                tonic::include_proto!("grpc.health.v1");
            }
        }
    }

    /// Plugin control plane
    pub mod plugin {
        tonic::include_proto!("plugin");
    }

    /// Application KV service
    pub mod proto {
        tonic::include_proto!("proto");
    }
}

// Re-exports
pub use controller::ControllerService;
pub use health::{HealthControlService, HealthService};
pub use kv::KvService;
pub use server::{GrpcServicesBuilder, ServingTask};

// Re-export tonic types for convenience
pub use tonic::{Code, Request, Response, Status};
