//! Per-call-name counters.
//!
//! Every update is mirrored to the `metrics` facade; without an installed
//! recorder those calls are no-ops.

use crate::status::RpcStatus;
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Counters for one call name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatsSnapshot {
  pub started: u64,
  pub succeeded: u64,
  /// Failed with any status other than a deadline
  pub failed: u64,
  pub timed_out: u64,
  /// Failures injected by chaos rules. Injected before send they are also
  /// counted in `failed`; injected after receive the call is counted by its
  /// real transport outcome
  pub injected: u64,
  pub in_flight: u64,
  /// Sum of the latency of every finished call
  pub total_latency: Duration,
}

impl CallStatsSnapshot {
  pub fn finished(&self) -> u64 {
    self.succeeded + self.failed + self.timed_out
  }

  pub fn mean_latency(&self) -> Option<Duration> {
    let finished = u32::try_from(self.finished()).ok().filter(|n| *n > 0)?;
    Some(self.total_latency / finished)
  }
}

#[derive(Debug, Default)]
pub(crate) struct CallStats {
  by_name: Mutex<HashMap<String, CallStatsSnapshot>>,
}

impl CallStats {
  pub(crate) fn started(&self, call_name: &str) {
    counter!("grpc_client_calls_started_total", "call" => call_name.to_string()).increment(1);
    gauge!("grpc_client_calls_in_flight", "call" => call_name.to_string()).increment(1.0);

    self.update(call_name, |s| {
      s.started += 1;
      s.in_flight += 1;
    });
  }

  pub(crate) fn finished(&self, call_name: &str, status: &RpcStatus, elapsed: Duration) {
    let outcome = if status.is_ok() {
      "ok"
    } else if status.is_deadline_exceeded() {
      "deadline_exceeded"
    } else {
      "error"
    };

    counter!(
      "grpc_client_calls_finished_total",
      "call" => call_name.to_string(),
      "status" => outcome
    )
    .increment(1);
    gauge!("grpc_client_calls_in_flight", "call" => call_name.to_string()).decrement(1.0);
    histogram!("grpc_client_call_duration_seconds", "call" => call_name.to_string())
      .record(elapsed.as_secs_f64());

    self.update(call_name, |s| {
      s.in_flight = s.in_flight.saturating_sub(1);
      s.total_latency += elapsed;
      if status.is_ok() {
        s.succeeded += 1;
      } else if status.is_deadline_exceeded() {
        s.timed_out += 1;
      } else {
        s.failed += 1;
      }
    });
  }

  /// A failure injected before anything was sent
  pub(crate) fn injected(&self, call_name: &str) {
    counter!("grpc_client_chaos_injected_total", "call" => call_name.to_string()).increment(1);

    self.update(call_name, |s| {
      s.started += 1;
      s.failed += 1;
      s.injected += 1;
    });
  }

  /// A failure injected over a real reply; the call itself is already counted
  pub(crate) fn injected_after_receive(&self, call_name: &str) {
    counter!("grpc_client_chaos_injected_total", "call" => call_name.to_string()).increment(1);
    self.update(call_name, |s| s.injected += 1);
  }

  pub(crate) fn get(&self, call_name: &str) -> CallStatsSnapshot {
    self.lock().get(call_name).cloned().unwrap_or_default()
  }

  pub(crate) fn snapshot(&self) -> HashMap<String, CallStatsSnapshot> {
    self.lock().clone()
  }

  fn update(&self, call_name: &str, f: impl FnOnce(&mut CallStatsSnapshot)) {
    let mut by_name = self.lock();
    match by_name.get_mut(call_name) {
      Some(stats) => f(stats),
      None => {
        let mut stats = CallStatsSnapshot::default();
        f(&mut stats);
        by_name.insert(call_name.to_string(), stats);
      }
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CallStatsSnapshot>> {
    self.by_name.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
