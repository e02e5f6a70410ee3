use super::config::ChannelConfig;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::proxy::matcher::Matcher;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tonic::transport::Uri;
use tower::Service;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Connecting = Pin<Box<dyn Future<Output = Result<TokioIo<TcpStream>, BoxError>> + Send>>;

/// TCP connector, optionally tunnelling through an HTTP CONNECT proxy
pub(crate) enum BaseConnector {
  Direct(HttpConnector),
  Proxied(Tunnel<HttpConnector>),
}

impl BaseConnector {
  /// Pick a proxy for `target` from `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
  ///
  /// Proxies are ignored entirely unless `enable_http_proxy` is set.
  pub(crate) fn new(target: &Uri, config: &ChannelConfig) -> Self {
    let http = http_connector(config);

    if !config.enable_http_proxy {
      return BaseConnector::Direct(http);
    }

    match Matcher::from_env().intercept(target) {
      Some(intercept) => {
        tracing::debug!(
          target: "grpc_client",
          %target,
          proxy = %intercept.uri(),
          "Routing gRPC channel through HTTP proxy"
        );
        let mut tunnel = Tunnel::new(intercept.uri().clone(), http);
        if let Some(auth) = intercept.basic_auth() {
          tunnel = tunnel.with_auth(auth.clone());
        }
        BaseConnector::Proxied(tunnel)
      }
      None => BaseConnector::Direct(http),
    }
  }

  pub(crate) fn is_proxied(&self) -> bool {
    matches!(self, BaseConnector::Proxied(_))
  }
}

fn http_connector(config: &ChannelConfig) -> HttpConnector {
  let mut http = HttpConnector::new();
  http.enforce_http(false);
  http.set_nodelay(config.tcp_nodelay);
  http.set_keepalive(config.tcp_keepalive);
  http.set_connect_timeout(Some(config.connect_timeout));
  http
}

impl Service<Uri> for BaseConnector {
  type Response = TokioIo<TcpStream>;
  type Error = BoxError;
  type Future = Connecting;

  fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    match self {
      BaseConnector::Direct(http) => http.poll_ready(cx).map_err(Into::into),
      BaseConnector::Proxied(tunnel) => tunnel.poll_ready(cx).map_err(Into::into),
    }
  }

  fn call(&mut self, uri: Uri) -> Self::Future {
    match self {
      BaseConnector::Direct(http) => {
        let connecting = http.call(uri);
        Box::pin(async move { connecting.await.map_err(Into::into) })
      }
      BaseConnector::Proxied(tunnel) => {
        let connecting = tunnel.call(uri);
        Box::pin(async move { connecting.await.map_err(Into::into) })
      }
    }
  }
}
