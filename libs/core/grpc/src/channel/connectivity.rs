//! Connectivity state derived from the transports a channel opens.
//!
//! tonic does not expose the state of a `Channel`, so every transport the
//! channel creates goes through [`TrackingConnector`] and carries a guard that
//! reports back when it closes.

use super::proxy::BaseConnector;
use hyper::rt;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tonic::transport::Uri;
use tower::Service;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connectivity of a [`Connection`](super::Connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
  /// No transport open and none being opened
  #[default]
  Idle,
  Connecting,
  /// At least one transport is open
  Ready,
  /// The last connect attempt failed; the next call retries
  TransientFailure,
  /// Terminal
  Shutdown,
}

#[derive(Debug, Default)]
struct TrackerState {
  state: ConnectivityState,
  live: usize,
  /// A peer answered on the current set of transports
  confirmed: bool,
  active_calls: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectivityTracker {
  inner: Mutex<TrackerState>,
}

impl ConnectivityTracker {
  pub(crate) fn state(&self) -> ConnectivityState {
    self.lock().state
  }

  pub(crate) fn is_shutdown(&self) -> bool {
    self.state() == ConnectivityState::Shutdown
  }

  pub(crate) fn shutdown(&self) {
    self.lock().state = ConnectivityState::Shutdown;
  }

  /// Held for the lifetime of one call; transports never go idle under it
  pub(crate) fn begin_call(self: &Arc<Self>) -> ActiveCall {
    self.lock().active_calls += 1;
    ActiveCall {
      tracker: Arc::clone(self),
    }
  }

  /// The peer produced a real response, so the open transports work
  pub(crate) fn confirm(&self) {
    let mut inner = self.lock();
    if inner.live > 0 {
      inner.confirmed = true;
    }
  }

  fn active_calls(&self) -> usize {
    self.lock().active_calls
  }

  fn connecting(&self) {
    let mut inner = self.lock();
    if inner.live == 0 && inner.state != ConnectivityState::Shutdown {
      inner.state = ConnectivityState::Connecting;
    }
  }

  fn connected(self: &Arc<Self>) -> TransportGuard {
    let mut inner = self.lock();
    if inner.live == 0 {
      inner.confirmed = false;
    }
    inner.live += 1;
    if inner.state != ConnectivityState::Shutdown {
      inner.state = ConnectivityState::Ready;
    }
    TransportGuard {
      tracker: Arc::clone(self),
    }
  }

  fn failed(&self) {
    let mut inner = self.lock();
    if inner.live == 0 && inner.state != ConnectivityState::Shutdown {
      inner.state = ConnectivityState::TransientFailure;
    }
  }

  fn closed(&self) {
    let mut inner = self.lock();
    inner.live = inner.live.saturating_sub(1);
    if inner.live == 0 && inner.state == ConnectivityState::Ready {
      // a transport that never got an answer (e.g. a failed TLS handshake)
      inner.state = if inner.confirmed {
        ConnectivityState::Idle
      } else {
        ConnectivityState::TransientFailure
      };
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// One call in progress on a connection
#[derive(Debug)]
pub(crate) struct ActiveCall {
  tracker: Arc<ConnectivityTracker>,
}

impl ActiveCall {
  pub(crate) fn confirm(&self) {
    self.tracker.confirm();
  }
}

impl Drop for ActiveCall {
  fn drop(&mut self) {
    let mut inner = self.tracker.lock();
    inner.active_calls = inner.active_calls.saturating_sub(1);
  }
}

/// Held by an open transport; dropping it marks the transport closed
#[derive(Debug)]
struct TransportGuard {
  tracker: Arc<ConnectivityTracker>,
}

impl Drop for TransportGuard {
  fn drop(&mut self) {
    self.tracker.closed();
  }
}

/// Marks a connect attempt failed unless it completes
struct ConnectAttempt {
  tracker: Arc<ConnectivityTracker>,
  settled: bool,
}

impl Drop for ConnectAttempt {
  fn drop(&mut self) {
    if !self.settled {
      self.tracker.failed();
    }
  }
}

#[derive(Debug)]
struct IdleTimer {
  timeout: Duration,
  last_activity: Instant,
  sleep: Pin<Box<Sleep>>,
  expired: bool,
}

impl IdleTimer {
  fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      last_activity: Instant::now(),
      sleep: Box::pin(tokio::time::sleep(timeout)),
      expired: false,
    }
  }

  /// True once the transport has been quiet for `timeout` with no call open
  fn poll_expired(&mut self, cx: &mut Context<'_>, tracker: &ConnectivityTracker) -> bool {
    while !self.expired {
      if self.sleep.as_mut().poll(cx).is_pending() {
        return false;
      }
      let now = Instant::now();
      let quiet_until = self.last_activity + self.timeout;
      if now >= quiet_until && tracker.active_calls() == 0 {
        self.expired = true;
      } else {
        let next = if now >= quiet_until { now + self.timeout } else { quiet_until };
        self.sleep.as_mut().reset(next);
      }
    }
    true
  }
}

/// A transport that reports to its tracker when dropped.
///
/// With an idle timeout it also ends itself (reads report EOF) once it has
/// carried no traffic and no call for that long.
#[derive(Debug)]
pub struct TrackedIo<T> {
  inner: T,
  guard: TransportGuard,
  idle: Option<IdleTimer>,
}

impl<T> TrackedIo<T> {
  fn touch(&mut self) {
    if let Some(idle) = &mut self.idle {
      idle.last_activity = Instant::now();
    }
  }
}

impl<T: rt::Read + Unpin> rt::Read for TrackedIo<T> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: rt::ReadBufCursor<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if this.idle.as_ref().is_some_and(|idle| idle.expired) {
      return Poll::Ready(Ok(()));
    }

    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.touch();
        Poll::Ready(result)
      }
      Poll::Pending => {
        let tracker = &this.guard.tracker;
        match this.idle.as_mut().map(|idle| idle.poll_expired(cx, tracker)) {
          Some(true) => {
            tracing::debug!(target: "grpc_client", "Closing idle transport");
            Poll::Ready(Ok(()))
          }
          _ => Poll::Pending,
        }
      }
    }
  }
}

impl<T: rt::Write + Unpin> rt::Write for TrackedIo<T> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    let written = Pin::new(&mut this.inner).poll_write(cx, buf);
    if written.is_ready() {
      this.touch();
    }
    written
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }

  fn poll_write_vectored(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    let written = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
    if written.is_ready() {
      this.touch();
    }
    written
  }
}

/// Connector handed to tonic. Every transport it opens is tracked.
pub(crate) struct TrackingConnector {
  base: BaseConnector,
  tracker: Arc<ConnectivityTracker>,
  idle_timeout: Option<Duration>,
}

impl TrackingConnector {
  pub(crate) fn new(
    base: BaseConnector,
    tracker: Arc<ConnectivityTracker>,
    idle_timeout: Option<Duration>,
  ) -> Self {
    Self {
      base,
      tracker,
      idle_timeout,
    }
  }
}

impl Service<Uri> for TrackingConnector {
  type Response = TrackedIo<TokioIo<TcpStream>>;
  type Error = BoxError;
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    self.base.poll_ready(cx)
  }

  fn call(&mut self, uri: Uri) -> Self::Future {
    if self.tracker.is_shutdown() {
      return Box::pin(async { Err("connection is shut down".into()) });
    }

    self.tracker.connecting();
    let mut attempt = ConnectAttempt {
      tracker: Arc::clone(&self.tracker),
      settled: false,
    };
    let idle_timeout = self.idle_timeout;
    let connecting = self.base.call(uri.clone());

    Box::pin(async move {
      match connecting.await {
        Ok(io) => {
          attempt.settled = true;
          tracing::debug!(target: "grpc_client", %uri, "Transport connected");
          Ok(TrackedIo {
            inner: io,
            guard: attempt.tracker.connected(),
            idle: idle_timeout.map(IdleTimer::new),
          })
        }
        Err(e) => {
          tracing::debug!(target: "grpc_client", %uri, error = %e, "Transport connect failed");
          Err(e)
        }
      }
    })
  }
}
