use std::path::PathBuf;
use thiserror::Error;

pub type GrpcResult<T> = Result<T, GrpcError>;

/// Errors raised while building clients or originating calls.
///
/// Per-call outcomes (timeouts, unreachable peers, injected failures) are
/// never reported through this type; they reach the caller's callback as an
/// [`RpcStatus`](crate::RpcStatus).
#[derive(Error, Debug)]
pub enum GrpcError {
  /// Target address could not be turned into an endpoint URI
  #[error("Invalid URI: {0}")]
  InvalidUri(#[source] tonic::transport::Error),

  /// TLS material was read but rejected by the transport
  #[error("TLS configuration rejected: {0}")]
  Tls(#[source] tonic::transport::Error),

  /// A certificate or key file could not be read
  #[error("Failed to read certificate file {path}: {source}")]
  CertificateRead {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Invalid configuration
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  /// The callback thread of a call manager could not be started
  #[error("Failed to start event loop thread: {0}")]
  EventLoop(#[source] std::io::Error),

  /// The call manager refused to originate the call
  #[error("Call {call_name} could not be scheduled: connection to {target} is shut down")]
  CallNotScheduled { call_name: String, target: String },
}

impl From<core_config::ConfigError> for GrpcError {
  fn from(err: core_config::ConfigError) -> Self {
    GrpcError::InvalidConfig(err.to_string())
  }
}
