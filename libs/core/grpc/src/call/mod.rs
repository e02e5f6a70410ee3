//! Call origination and completion delivery.
//!
//! A [`ClientCallManager`] starts each call on its Tokio runtime and delivers
//! the result to the caller's callback on its [`EventLoop`]. The per-call
//! state lives in a `ClientCall`, which owns the callback and can only hand
//! it out once.

pub mod event_loop;
pub mod manager;
pub mod stats;

pub use event_loop::EventLoop;
pub use manager::{CallManagerConfig, ClientCallManager, InFlightCall, MAX_CALL_TIMEOUT};
pub use stats::CallStatsSnapshot;

use crate::status::RpcStatus;
use manager::Shared;
use std::sync::Arc;
use std::time::Instant;

/// Completion callback. Runs exactly once, on the manager's event loop.
pub type ClientCallback<Reply> = Box<dyn FnOnce(RpcStatus, Reply) + Send + 'static>;

/// Identifies a call that was successfully originated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandle {
  id: u64,
  call_name: Arc<str>,
}

impl CallHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn call_name(&self) -> &str {
    &self.call_name
  }
}

/// State of one in-flight invocation.
///
/// `complete` consumes the call; if the call is dropped first (its task was
/// cancelled or the runtime shut down) the callback receives `Cancelled`.
pub(crate) struct ClientCall<Reply: Default + Send + 'static> {
  id: u64,
  call_name: Arc<str>,
  started: Instant,
  callback: Option<ClientCallback<Reply>>,
  shared: Arc<Shared>,
}

impl<Reply: Default + Send + 'static> ClientCall<Reply> {
  pub(crate) fn new(
    id: u64,
    call_name: Arc<str>,
    callback: ClientCallback<Reply>,
    shared: Arc<Shared>,
  ) -> Self {
    Self {
      id,
      call_name,
      started: Instant::now(),
      callback: Some(callback),
      shared,
    }
  }

  pub(crate) fn handle(&self) -> CallHandle {
    CallHandle {
      id: self.id,
      call_name: Arc::clone(&self.call_name),
    }
  }

  pub(crate) fn complete(mut self, status: RpcStatus, reply: Reply) {
    if let Some(callback) = self.callback.take() {
      self.deliver(callback, status, reply);
    }
  }

  fn deliver(&self, callback: ClientCallback<Reply>, status: RpcStatus, reply: Reply) {
    let elapsed = self.started.elapsed();
    self.shared.finish(self.id, &self.call_name, &status, elapsed);

    if status.is_ok() {
      tracing::debug!(
        target: "grpc_client",
        call_id = self.id,
        call_name = %self.call_name,
        elapsed_ms = elapsed.as_millis() as u64,
        "Call finished"
      );
    } else {
      tracing::debug!(
        target: "grpc_client",
        call_id = self.id,
        call_name = %self.call_name,
        code = ?status.code(),
        message = status.message(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Call failed"
      );
    }

    self
      .shared
      .event_loop
      .post(self.call_name.to_string(), move || callback(status, reply));
  }
}

impl<Reply: Default + Send + 'static> Drop for ClientCall<Reply> {
  fn drop(&mut self) {
    if let Some(callback) = self.callback.take() {
      tracing::warn!(
        target: "grpc_client",
        call_id = self.id,
        call_name = %self.call_name,
        "Call dropped before completion"
      );
      self.deliver(
        callback,
        RpcStatus::cancelled("call dropped before completion"),
        Reply::default(),
      );
    }
  }
}
