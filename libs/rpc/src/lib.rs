//! Protobuf messages, server stubs and typed clients for cluster services.
//!
//! Messages and server traits under [`echo`] are generated. Clients are thin
//! wrappers over [`grpc_client::GrpcClient`] that supply method descriptors.

mod gen;

pub mod clients;

pub use gen::echo;
pub use clients::echo::{EchoService, EchoServiceClient, ECHO, SLOW_ECHO};
