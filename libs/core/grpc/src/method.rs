//! Typed descriptions of remote methods.
//!
//! Generated per-service code declares one [`MethodDescriptor`] constant per
//! method; [`GrpcClient::call_method`](crate::GrpcClient::call_method) is the
//! only thing that needs to understand it.
//!
//! ```ignore
//! pub struct EchoService;
//!
//! impl RpcService for EchoService {
//!   const NAME: &'static str = "echo.v1.EchoService";
//! }
//!
//! pub const ECHO: MethodDescriptor<EchoService, EchoRequest, EchoResponse> =
//!   MethodDescriptor::new("Echo", "/echo.v1.EchoService/Echo");
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

/// Call name used when the caller does not provide one
pub const UNKNOWN_CALL_NAME: &str = "UNKNOWN";

/// Marker for a remote service. Clients are typed by it so a client bound to
/// one service cannot be handed another service's methods.
pub trait RpcService: Send + Sync + 'static {
  /// Fully qualified protobuf service name, e.g. `echo.v1.EchoService`
  const NAME: &'static str;
}

/// One remote method: its name, its HTTP/2 path and its request/reply types.
pub struct MethodDescriptor<S, Req, Reply> {
  method: &'static str,
  path: &'static str,
  default_timeout: Option<Duration>,
  _marker: PhantomData<fn() -> (S, Req, Reply)>,
}

impl<S: RpcService, Req, Reply> MethodDescriptor<S, Req, Reply> {
  pub const fn new(method: &'static str, path: &'static str) -> Self {
    Self {
      method,
      path,
      default_timeout: None,
      _marker: PhantomData,
    }
  }

  /// Timeout used when a call does not set its own
  pub const fn with_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = Some(timeout);
    self
  }

  pub fn service(&self) -> &'static str {
    S::NAME
  }

  pub fn method(&self) -> &'static str {
    self.method
  }

  pub fn path(&self) -> &'static str {
    self.path
  }

  pub fn default_timeout(&self) -> Option<Duration> {
    self.default_timeout
  }

  /// Name used in logs and metrics when the caller passes none of its own
  pub fn call_name(&self) -> String {
    format!("{}.grpc_client.{}", S::NAME, self.method)
  }
}

impl<S, Req, Reply> Clone for MethodDescriptor<S, Req, Reply> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<S, Req, Reply> Copy for MethodDescriptor<S, Req, Reply> {}

impl<S, Req, Reply> fmt::Debug for MethodDescriptor<S, Req, Reply> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MethodDescriptor")
      .field("path", &self.path)
      .field("default_timeout", &self.default_timeout)
      .finish()
  }
}

/// Per-invocation options.
///
/// The call name is the key looked up in [`RpcChaos`](crate::RpcChaos) and
/// the label on every log line and metric for the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
  pub call_name: Option<String>,
  pub timeout: Option<Duration>,
}

impl CallOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn named(call_name: impl Into<String>) -> Self {
    Self {
      call_name: Some(call_name.into()),
      timeout: None,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Millisecond form; a negative value keeps the default timeout. Values
  /// past [`MAX_CALL_TIMEOUT`](crate::MAX_CALL_TIMEOUT) are clamped when the
  /// call starts.
  pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
    self.timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
    self
  }

  pub fn call_name(&self) -> &str {
    self.call_name.as_deref().unwrap_or(UNKNOWN_CALL_NAME)
  }
}
