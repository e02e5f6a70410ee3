pub mod config;
pub mod connectivity;
mod proxy;
mod tls;

pub use config::{ChannelConfig, TlsFiles};
pub use connectivity::ConnectivityState;

use crate::error::{GrpcError, GrpcResult};
use connectivity::{ActiveCall, ConnectivityTracker, TrackingConnector};
use proxy::BaseConnector;
use std::net::IpAddr;
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// Shared handle to one transport target.
///
/// Cloning is cheap; every clone drives the same underlying channel, so
/// several clients can bind to one physical connection.
#[derive(Debug, Clone)]
pub struct Connection {
  channel: Channel,
  target: Arc<str>,
  max_message_size: usize,
  tracker: Arc<ConnectivityTracker>,
}

impl Connection {
  pub fn state(&self) -> ConnectivityState {
    self.tracker.state()
  }

  /// Refuse new calls and new transports. Calls already in flight finish
  /// normally.
  pub fn shutdown(&self) {
    tracing::debug!(target: "grpc_client", target_uri = %self.target, "Shutting down gRPC connection");
    self.tracker.shutdown();
  }

  pub fn is_shutdown(&self) -> bool {
    self.tracker.is_shutdown()
  }

  /// Target URI, e.g. `http://127.0.0.1:50051`
  pub fn target(&self) -> &str {
    &self.target
  }

  pub fn max_message_size(&self) -> usize {
    self.max_message_size
  }

  pub fn channel(&self) -> &Channel {
    &self.channel
  }

  pub(crate) fn begin_call(&self) -> ActiveCall {
    self.tracker.begin_call()
  }
}

/// Builds a lazy channel to `address:port`.
///
/// No I/O happens here: the first call opens the transport, and a failed
/// transport is reopened by the next call. Certificate files are read when
/// `use_tls` is set, and any read failure is returned to the caller.
///
/// ## Example
/// ```ignore
/// use grpc_client::{build_channel, ChannelConfig};
///
/// let connection = build_channel("127.0.0.1", 50051, false, &ChannelConfig::default())?;
/// assert_eq!(connection.target(), "http://127.0.0.1:50051");
/// ```
pub fn build_channel(
  address: &str,
  port: u16,
  use_tls: bool,
  config: &ChannelConfig,
) -> GrpcResult<Connection> {
  let target = target_uri(address, port, use_tls);

  let endpoint = Endpoint::from_shared(target.clone()).map_err(|e| {
    tracing::error!(target: "grpc_client", addr = %target, error = ?e, "Invalid URI");
    GrpcError::InvalidUri(e)
  })?;

  let mut endpoint = config.apply_to_endpoint(endpoint);

  if use_tls {
    let tls = tls::load_tls_config(&config.tls, address)?;
    endpoint = endpoint.tls_config(tls).map_err(|e| {
      tracing::error!(target: "grpc_client", addr = %target, error = ?e, "TLS configuration rejected");
      GrpcError::Tls(e)
    })?;
  }

  let base = BaseConnector::new(endpoint.uri(), config);
  let proxied = base.is_proxied();
  let tracker = Arc::new(ConnectivityTracker::default());
  let connector = TrackingConnector::new(base, Arc::clone(&tracker), config.idle_timeout);
  let channel = endpoint.connect_with_connector_lazy(connector);

  tracing::debug!(
    target: "grpc_client",
    addr = %target,
    use_tls,
    proxied,
    "Created lazy gRPC channel (connects on first request)"
  );

  Ok(Connection {
    channel,
    target: Arc::from(target),
    max_message_size: config.max_message_size,
    tracker,
  })
}

fn target_uri(address: &str, port: u16, use_tls: bool) -> String {
  let scheme = if use_tls { "https" } else { "http" };
  match address.parse::<IpAddr>() {
    Ok(IpAddr::V6(ip)) => format!("{scheme}://[{ip}]:{port}"),
    _ => format!("{scheme}://{address}:{port}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_target_uri() {
    assert_eq!(target_uri("127.0.0.1", 50051, false), "http://127.0.0.1:50051");
    assert_eq!(target_uri("::1", 50051, false), "http://[::1]:50051");
    assert_eq!(target_uri("api.internal", 443, true), "https://api.internal:443");
  }

  #[test]
  fn test_invalid_uri() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let result = build_channel("not a valid host", 50051, false, &ChannelConfig::default());
    assert!(matches!(result.unwrap_err(), GrpcError::InvalidUri(_)));
  }

  #[tokio::test]
  async fn test_build_is_lazy() {
    // nothing listens on port 9; building must still succeed
    let connection = build_channel("127.0.0.1", 9, false, &ChannelConfig::default()).unwrap();
    assert_eq!(connection.state(), ConnectivityState::Idle);
    assert_eq!(connection.target(), "http://127.0.0.1:9");
    assert_eq!(connection.max_message_size(), 512 * 1024 * 1024);
  }

  #[tokio::test]
  async fn test_tls_without_files_fails() {
    let result = build_channel("127.0.0.1", 9, true, &ChannelConfig::default());
    assert!(matches!(result.unwrap_err(), GrpcError::InvalidConfig(_)));
  }

  #[tokio::test]
  async fn test_clones_share_state() {
    let connection = build_channel("127.0.0.1", 9, false, &ChannelConfig::default()).unwrap();
    let shared = connection.clone();
    connection.shutdown();
    assert!(shared.is_shutdown());
    assert_eq!(shared.state(), ConnectivityState::Shutdown);
  }
}
