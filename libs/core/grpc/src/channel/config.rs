use core_config::rpc::RpcConfig;
use std::path::PathBuf;
use std::time::Duration;
use tonic::transport::Endpoint;

/// Certificate material for a secured channel.
///
/// All three paths must be set when the channel is built with TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
  /// PEM certificate chain presented to the peer
  pub server_cert: Option<PathBuf>,
  /// PEM private key for `server_cert`
  pub server_key: Option<PathBuf>,
  /// PEM root used to verify the peer
  pub ca_cert: Option<PathBuf>,
}

/// Tuning applied to every channel built by [`build_channel`](super::build_channel).
///
/// Usually derived from the process-wide [`RpcConfig`] with
/// [`ChannelConfig::from_rpc_config`] and adjusted with the `with_*` setters.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
  // Proxy
  pub enable_http_proxy: bool,

  // Message limits
  pub max_message_size: usize,
  pub stream_buffer_size: u32,

  // HTTP/2 Keep-Alive
  pub http2_keep_alive_interval: Option<Duration>,
  pub keep_alive_timeout: Duration,
  pub keep_alive_while_idle: bool,

  // Connection settings
  pub connect_timeout: Duration,
  pub initial_connection_window_size: Option<u32>,
  pub http2_adaptive_window: bool,

  /// Close a transport once no call has used it for this long
  pub idle_timeout: Option<Duration>,

  // TCP settings
  pub tcp_nodelay: bool,
  pub tcp_keepalive: Option<Duration>,

  pub tls: TlsFiles,
}

impl Default for ChannelConfig {
  fn default() -> Self {
    Self::from_rpc_config(&RpcConfig::default())
  }
}

impl ChannelConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Take proxy, size and certificate settings from the shared runtime config
  pub fn from_rpc_config(rpc: &RpcConfig) -> Self {
    Self {
      enable_http_proxy: rpc.enable_http_proxy,
      max_message_size: rpc.max_message_size,
      stream_buffer_size: rpc.stream_buffer_size,
      http2_keep_alive_interval: Some(Duration::from_secs(30)),
      keep_alive_timeout: Duration::from_secs(10),
      keep_alive_while_idle: false,
      connect_timeout: Duration::from_secs(5),
      initial_connection_window_size: None,
      http2_adaptive_window: false,
      idle_timeout: Some(rpc.client_idle_timeout_ms)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis),
      tcp_nodelay: true,
      tcp_keepalive: Some(Duration::from_secs(30)),
      tls: TlsFiles {
        server_cert: rpc.tls_server_cert.clone(),
        server_key: rpc.tls_server_key.clone(),
        ca_cert: rpc.tls_ca_cert.clone(),
      },
    }
  }

  pub fn with_http_proxy(mut self, enabled: bool) -> Self {
    self.enable_http_proxy = enabled;
    self
  }

  /// Cap on a single message, applied to both directions
  pub fn with_max_message_size(mut self, size: usize) -> Self {
    self.max_message_size = size;
    self
  }

  /// Per-stream HTTP/2 buffer
  pub fn with_stream_buffer_size(mut self, size: u32) -> Self {
    self.stream_buffer_size = size;
    self
  }

  /// Set the connection timeout
  ///
  /// # Example
  /// ```ignore
  /// let config = ChannelConfig::new()
  ///     .with_connect_timeout(Duration::from_secs(10));
  /// ```
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Set the HTTP/2 keep-alive interval
  pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
    self.http2_keep_alive_interval = Some(interval);
    self
  }

  /// Disable HTTP/2 keep-alive
  pub fn without_keep_alive(mut self) -> Self {
    self.http2_keep_alive_interval = None;
    self
  }

  /// Close the transport after `timeout` without calls or traffic. The
  /// next call reconnects.
  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = Some(timeout);
    self
  }

  /// Keep transports open until the peer closes them
  pub fn without_idle_timeout(mut self) -> Self {
    self.idle_timeout = None;
    self
  }

  pub fn with_tls_files(
    mut self,
    server_cert: impl Into<PathBuf>,
    server_key: impl Into<PathBuf>,
    ca_cert: impl Into<PathBuf>,
  ) -> Self {
    self.tls = TlsFiles {
      server_cert: Some(server_cert.into()),
      server_key: Some(server_key.into()),
      ca_cert: Some(ca_cert.into()),
    };
    self
  }

  /// Apply the HTTP/2 settings to a tonic Endpoint.
  ///
  /// TCP settings and the proxy are handled by the connector; message size
  /// limits live on the stub.
  pub(crate) fn apply_to_endpoint(&self, mut endpoint: Endpoint) -> Endpoint {
    if let Some(interval) = self.http2_keep_alive_interval {
      endpoint = endpoint
        .http2_keep_alive_interval(interval)
        .keep_alive_timeout(self.keep_alive_timeout)
        .keep_alive_while_idle(self.keep_alive_while_idle);
    }

    endpoint = endpoint
      .connect_timeout(self.connect_timeout)
      .initial_stream_window_size(self.stream_buffer_size)
      .http2_adaptive_window(self.http2_adaptive_window);

    if let Some(size) = self.initial_connection_window_size {
      endpoint = endpoint.initial_connection_window_size(size);
    }

    endpoint
  }
}
