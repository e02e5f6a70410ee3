//! Outcome of a single call as seen by its callback.

use std::time::Duration;
use thiserror::Error;
use tonic::Code;

/// Message carried by failures injected through [`RpcChaos`](crate::RpcChaos).
///
/// Matches what a real transport reports for an unreachable peer so that
/// callers cannot tell the two apart.
pub const UNAVAILABLE_MESSAGE: &str = "Unavailable";

/// Status delivered alongside every reply.
///
/// `code == Code::Ok` means the reply came from the peer. Any other code means
/// the reply is `Default::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc failed with {code:?}: {message}")]
pub struct RpcStatus {
  code: Code,
  message: String,
}

impl RpcStatus {
  pub fn new(code: Code, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }

  pub fn ok() -> Self {
    Self::new(Code::Ok, "")
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::new(Code::Unavailable, message)
  }

  /// A call whose deadline passed before the transport answered
  pub fn deadline_exceeded(timeout: Duration) -> Self {
    Self::new(
      Code::DeadlineExceeded,
      format!("call timed out after {}ms", timeout.as_millis()),
    )
  }

  pub fn cancelled(message: impl Into<String>) -> Self {
    Self::new(Code::Cancelled, message)
  }

  pub fn code(&self) -> Code {
    self.code
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn is_ok(&self) -> bool {
    self.code == Code::Ok
  }

  pub fn is_unavailable(&self) -> bool {
    self.code == Code::Unavailable
  }

  pub fn is_deadline_exceeded(&self) -> bool {
    self.code == Code::DeadlineExceeded
  }

  /// Pair the status with its reply the way most call sites want it
  pub fn into_result<T>(self, reply: T) -> Result<T, RpcStatus> {
    if self.is_ok() {
      Ok(reply)
    } else {
      Err(self)
    }
  }
}

impl From<tonic::Status> for RpcStatus {
  fn from(status: tonic::Status) -> Self {
    Self::new(status.code(), status.message())
  }
}
