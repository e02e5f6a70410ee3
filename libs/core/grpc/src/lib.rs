//! # gRPC Client Library
//!
//! Generic asynchronous client used by every service to call every other
//! service. One primitive, [`GrpcClient::call_method`], invokes any unary
//! method described by a [`MethodDescriptor`] and delivers the outcome to a
//! callback exactly once.
//!
//! ## Pieces
//!
//! - [`build_channel`]: lazy, optionally TLS-secured [`Connection`] with
//!   proxy, message size and stream buffer tuning from [`ChannelConfig`].
//! - [`ClientCallManager`]: runs transport futures on a Tokio runtime and
//!   callbacks on a dedicated [`EventLoop`] thread; tracks in-flight calls.
//! - [`RpcChaos`]: per-manager failure injection keyed by call name.
//! - [`GrpcClient`]: binds a connection to a manager for one service.
//!
//! ## Quick Start
//! ```ignore
//! use grpc_client::{CallManagerConfig, CallOptions, ChannelConfig, ClientCallManager, GrpcClient};
//! use rpc::echo::{EchoRequest, EchoService, ECHO};
//!
//! let rpc_config = core_config::rpc::RpcConfig::from_env()?;
//! let manager = ClientCallManager::new(
//!     tokio::runtime::Handle::current(),
//!     CallManagerConfig::from_rpc_config(&rpc_config)?,
//! )?;
//! let client = GrpcClient::<EchoService>::new(
//!     "127.0.0.1",
//!     50051,
//!     manager,
//!     rpc_config.use_tls,
//!     ChannelConfig::from_rpc_config(&rpc_config),
//! )?;
//!
//! client.call_method(
//!     &ECHO,
//!     EchoRequest { message: "hello".into() },
//!     |status, reply| tracing::info!(?status, reply = %reply.message, "echoed"),
//!     CallOptions::named("Echo").with_timeout_ms(500),
//! );
//! ```

pub mod call;
pub mod channel;
pub mod chaos;
pub mod client;
pub mod error;
pub mod method;
pub mod status;

pub use call::{
  CallHandle, CallManagerConfig, CallStatsSnapshot, ClientCallManager, ClientCallback, EventLoop,
  InFlightCall, MAX_CALL_TIMEOUT,
};
pub use channel::{ChannelConfig, Connection, ConnectivityState, TlsFiles, build_channel};
pub use chaos::{RpcChaos, RpcFailure};
pub use client::{GrpcClient, ServiceStub};
pub use error::{GrpcError, GrpcResult};
pub use method::{CallOptions, MethodDescriptor, RpcService, UNKNOWN_CALL_NAME};
pub use status::{RpcStatus, UNAVAILABLE_MESSAGE};
