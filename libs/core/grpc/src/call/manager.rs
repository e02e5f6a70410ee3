use super::event_loop::EventLoop;
use super::stats::{CallStats, CallStatsSnapshot};
use super::{CallHandle, ClientCall};
use crate::chaos::RpcChaos;
use crate::client::ServiceStub;
use crate::error::{GrpcError, GrpcResult};
use crate::method::{MethodDescriptor, RpcService};
use crate::status::RpcStatus;
use core_config::rpc::RpcConfig;
use http::uri::PathAndQuery;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tonic::GrpcMethod;
use tonic::metadata::{AsciiMetadataValue, MetadataValue};
use tonic_prost::ProstCodec;

static EVENT_LOOP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Largest deadline a `grpc-timeout` header can carry (99999999 hours).
/// Longer timeouts are clamped to it.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(99_999_999 * 60 * 60);

/// Settings for a [`ClientCallManager`]
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
  /// Used when neither the call nor its method sets a timeout
  pub default_timeout: Duration,
  pub chaos: Arc<RpcChaos>,
  /// Sent as `x-cluster-id` on every call
  pub cluster_id: Option<String>,
  /// Name of the callback thread; generated when unset
  pub thread_name: Option<String>,
}

impl Default for CallManagerConfig {
  fn default() -> Self {
    Self {
      default_timeout: Duration::from_millis(core_config::rpc::DEFAULT_CLIENT_CALL_TIMEOUT_MS),
      chaos: Arc::new(RpcChaos::new()),
      cluster_id: None,
      thread_name: None,
    }
  }
}

impl CallManagerConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Timeout, chaos rules and cluster id from the shared runtime config.
  ///
  /// Fails if `testing_rpc_failure` cannot be parsed.
  pub fn from_rpc_config(rpc: &RpcConfig) -> GrpcResult<Self> {
    let chaos = match rpc.testing_rpc_failure.as_deref() {
      Some(spec) => {
        let chaos = RpcChaos::from_spec(spec)?;
        tracing::warn!(target: "grpc_client", rules = spec, "RPC failure injection enabled");
        chaos
      }
      None => RpcChaos::new(),
    };

    Ok(Self {
      default_timeout: Duration::from_millis(rpc.client_call_timeout_ms),
      chaos: Arc::new(chaos),
      cluster_id: rpc.cluster_id.clone(),
      thread_name: None,
    })
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout;
    self
  }

  pub fn with_chaos(mut self, chaos: Arc<RpcChaos>) -> Self {
    self.chaos = chaos;
    self
  }

  pub fn with_cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
    self.cluster_id = Some(cluster_id.into());
    self
  }

  pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = Some(name.into());
    self
  }
}

/// A call that has been started and not yet completed
#[derive(Debug, Clone)]
pub struct InFlightCall {
  pub id: u64,
  pub call_name: String,
  pub target: String,
  pub started_at: Instant,
  pub timeout: Duration,
}

pub(crate) struct Shared {
  runtime: Handle,
  pub(crate) event_loop: EventLoop,
  chaos: Arc<RpcChaos>,
  default_timeout: Duration,
  cluster_id: Option<AsciiMetadataValue>,
  in_flight: Mutex<HashMap<u64, InFlightCall>>,
  pub(crate) stats: CallStats,
  next_id: AtomicU64,
}

impl Shared {
  pub(crate) fn finish(&self, id: u64, call_name: &str, status: &RpcStatus, elapsed: Duration) {
    self.in_flight().remove(&id);
    self.stats.finished(call_name, status, elapsed);
  }

  fn in_flight(&self) -> MutexGuard<'_, HashMap<u64, InFlightCall>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Starts calls and delivers their results.
///
/// Transport work runs on the Tokio runtime passed to [`ClientCallManager::new`];
/// callbacks run one at a time on a dedicated thread, so callbacks from one
/// manager never race each other. Cloning is cheap and clones share
/// everything.
///
/// ## Example
/// ```ignore
/// let manager = ClientCallManager::new(Handle::current(), CallManagerConfig::from_rpc_config(&rpc)?)?;
/// let client = GrpcClient::<EchoService>::new("127.0.0.1", 50051, manager.clone(), false, ChannelConfig::default())?;
/// ```
#[derive(Clone)]
pub struct ClientCallManager {
  shared: Arc<Shared>,
}

impl ClientCallManager {
  pub fn new(runtime: Handle, config: CallManagerConfig) -> GrpcResult<Self> {
    let cluster_id = config
      .cluster_id
      .as_deref()
      .map(|id| {
        MetadataValue::try_from(id)
          .map_err(|_| GrpcError::InvalidConfig(format!("cluster id '{id}' is not valid ASCII metadata")))
      })
      .transpose()?;

    let thread_name = config.thread_name.unwrap_or_else(|| {
      format!("grpc-client-cb-{}", EVENT_LOOP_SEQ.fetch_add(1, Ordering::Relaxed))
    });
    let event_loop = EventLoop::start(thread_name).map_err(GrpcError::EventLoop)?;

    tracing::debug!(
      target: "grpc_client",
      thread = event_loop.thread_name(),
      default_timeout_ms = config.default_timeout.as_millis() as u64,
      "Call manager started"
    );

    Ok(Self {
      shared: Arc::new(Shared {
        runtime,
        event_loop,
        chaos: config.chaos,
        default_timeout: config.default_timeout,
        cluster_id,
        in_flight: Mutex::new(HashMap::new()),
        stats: CallStats::default(),
        next_id: AtomicU64::new(1),
      }),
    })
  }

  /// Start `method` on `stub` and arrange for `callback` to run once with
  /// the outcome.
  ///
  /// `timeout` falls back to the method's default, then to the manager's.
  /// Returns `None` without calling `callback` if the stub's connection has
  /// been shut down.
  pub fn create_call<S, Req, Reply, F>(
    &self,
    stub: &ServiceStub<S>,
    method: &MethodDescriptor<S, Req, Reply>,
    request: Req,
    callback: F,
    call_name: &str,
    timeout: Option<Duration>,
  ) -> Option<CallHandle>
  where
    S: RpcService,
    Req: prost::Message + Send + Sync + 'static,
    Reply: prost::Message + Default + Send + Sync + 'static,
    F: FnOnce(RpcStatus, Reply) + Send + 'static,
  {
    let connection = stub.connection();
    if connection.is_shutdown() {
      tracing::error!(
        target: "grpc_client",
        call_name,
        target_uri = connection.target(),
        "Cannot start call on a shut down connection"
      );
      return None;
    }

    let timeout = resolve_timeout(timeout, method.default_timeout(), self.shared.default_timeout);
    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
    let call_name: Arc<str> = Arc::from(call_name);

    let mut request = tonic::Request::new(request);
    request.set_timeout(timeout);
    request
      .extensions_mut()
      .insert(GrpcMethod::new(method.service(), method.method()));
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Ok(value) = MetadataValue::try_from(request_id.as_str()) {
      request.metadata_mut().insert("x-request-id", value);
    }
    if let Some(cluster_id) = &self.shared.cluster_id {
      request.metadata_mut().insert("x-cluster-id", cluster_id.clone());
    }

    self.shared.in_flight().insert(
      id,
      InFlightCall {
        id,
        call_name: call_name.to_string(),
        target: connection.target().to_string(),
        started_at: Instant::now(),
        timeout,
      },
    );
    self.shared.stats.started(&call_name);

    let call = ClientCall::new(id, call_name, Box::new(callback), Arc::clone(&self.shared));
    let handle = call.handle();

    tracing::debug!(
      target: "grpc_client",
      call_id = id,
      call_name = handle.call_name(),
      %request_id,
      path = method.path(),
      timeout_ms = timeout.as_millis() as u64,
      "Starting call"
    );

    let mut grpc = stub.grpc().clone();
    let path = PathAndQuery::from_static(method.path());
    let active = connection.begin_call();

    self.shared.runtime.spawn(async move {
      let sent_at = Instant::now();
      let outcome = tokio::time::timeout(timeout, async move {
        grpc
          .ready()
          .await
          .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {e}")))?;
        grpc
          .unary(request, path, ProstCodec::<Req, Reply>::default())
          .await
      })
      .await;

      match &outcome {
        Ok(Ok(_)) => active.confirm(),
        Ok(Err(status)) if answered_by_peer(status) => active.confirm(),
        _ => {}
      }
      drop(active);

      match outcome {
        Ok(Ok(response)) => call.complete(RpcStatus::ok(), response.into_inner()),
        // the channel enforces grpc-timeout too and reports it as Cancelled
        Ok(Err(status)) if status.code() == tonic::Code::Cancelled && sent_at.elapsed() >= timeout => {
          call.complete(RpcStatus::deadline_exceeded(timeout), Reply::default())
        }
        Ok(Err(status)) => call.complete(status.into(), Reply::default()),
        Err(_) => call.complete(RpcStatus::deadline_exceeded(timeout), Reply::default()),
      }
    });

    Some(handle)
  }

  /// Run `job` on the callback thread, after everything already queued
  pub fn post(&self, name: impl Into<String>, job: impl FnOnce() + Send + 'static) -> bool {
    self.shared.event_loop.post(name, job)
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.shared.event_loop
  }

  /// Runtime that drives transport futures
  pub fn runtime(&self) -> &Handle {
    &self.shared.runtime
  }

  pub fn chaos(&self) -> &Arc<RpcChaos> {
    &self.shared.chaos
  }

  pub fn default_timeout(&self) -> Duration {
    self.shared.default_timeout
  }

  pub fn in_flight_count(&self) -> usize {
    self.shared.in_flight().len()
  }

  /// Calls started and not yet completed, oldest first
  pub fn in_flight_calls(&self) -> Vec<InFlightCall> {
    let mut calls: Vec<_> = self.shared.in_flight().values().cloned().collect();
    calls.sort_by_key(|call| call.id);
    calls
  }

  pub fn stats(&self, call_name: &str) -> CallStatsSnapshot {
    self.shared.stats.get(call_name)
  }

  pub fn all_stats(&self) -> HashMap<String, CallStatsSnapshot> {
    self.shared.stats.snapshot()
  }

  pub(crate) fn record_injected(&self, call_name: &str) {
    self.shared.stats.injected(call_name);
  }

  pub(crate) fn record_injected_after_receive(&self, call_name: &str) {
    self.shared.stats.injected_after_receive(call_name);
  }
}

/// Explicit timeout, then the method default, then the manager default
fn resolve_timeout(explicit: Option<Duration>, method: Option<Duration>, default: Duration) -> Duration {
  explicit.or(method).unwrap_or(default).min(MAX_CALL_TIMEOUT)
}

/// Statuses a transport failure can't produce on its own
fn answered_by_peer(status: &tonic::Status) -> bool {
  !matches!(
    status.code(),
    tonic::Code::Unavailable | tonic::Code::Unknown | tonic::Code::Cancelled | tonic::Code::Internal
  )
}

impl std::fmt::Debug for ClientCallManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientCallManager")
      .field("event_loop", &self.shared.event_loop)
      .field("default_timeout", &self.shared.default_timeout)
      .field("in_flight", &self.in_flight_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chaos::RpcFailure;
  use crate::method::CallOptions;

  #[test]
  fn test_config_from_rpc_config() {
    let rpc = RpcConfig {
      client_call_timeout_ms: 1500,
      testing_rpc_failure: Some("Echo=fail_before_send".into()),
      cluster_id: Some("cluster-a".into()),
      ..RpcConfig::default()
    };

    let config = CallManagerConfig::from_rpc_config(&rpc).unwrap();
    assert_eq!(config.default_timeout, Duration::from_millis(1500));
    assert_eq!(config.chaos.get_failure("Echo"), RpcFailure::FailBeforeSend);
    assert_eq!(config.cluster_id.as_deref(), Some("cluster-a"));
  }

  #[test]
  fn test_config_rejects_bad_failure_spec() {
    let rpc = RpcConfig {
      testing_rpc_failure: Some("Echo=sometimes".into()),
      ..RpcConfig::default()
    };
    assert!(matches!(
      CallManagerConfig::from_rpc_config(&rpc),
      Err(GrpcError::InvalidConfig(_))
    ));
  }

  #[test]
  fn test_timeout_resolution_order() {
    let default = Duration::from_secs(60);
    let method = Some(Duration::from_secs(5));
    let explicit = Some(Duration::from_millis(50));

    assert_eq!(resolve_timeout(explicit, method, default), Duration::from_millis(50));
    assert_eq!(resolve_timeout(None, method, default), Duration::from_secs(5));
    assert_eq!(resolve_timeout(None, None, default), default);
  }

  #[test]
  fn test_huge_timeouts_are_clamped() {
    let huge = CallOptions::new().with_timeout_ms(i64::MAX).timeout;
    assert_eq!(resolve_timeout(huge, None, Duration::from_secs(60)), MAX_CALL_TIMEOUT);
    assert_eq!(
      resolve_timeout(Some(Duration::MAX), None, Duration::from_secs(60)),
      MAX_CALL_TIMEOUT
    );
    // tonic accepts the clamped value as a grpc-timeout
    let mut request = tonic::Request::new(());
    request.set_timeout(MAX_CALL_TIMEOUT);
    assert!(request.metadata().get("grpc-timeout").is_some());
  }

  #[test]
  fn test_default_timeout_is_sixty_seconds() {
    assert_eq!(CallManagerConfig::default().default_timeout, Duration::from_secs(60));
  }

  #[tokio::test]
  async fn test_invalid_cluster_id_is_rejected() {
    let config = CallManagerConfig::new().with_cluster_id("cluster\nid");
    let result = ClientCallManager::new(Handle::current(), config);
    assert!(matches!(result, Err(GrpcError::InvalidConfig(_))));
  }

  #[tokio::test]
  async fn test_post_runs_on_event_loop() {
    let manager = ClientCallManager::new(
      Handle::current(),
      CallManagerConfig::new().with_thread_name("manager-post-test"),
    )
    .unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let event_loop = manager.event_loop().clone();
    assert!(manager.post("check-thread", move || {
      let _ = tx.send(event_loop.is_current());
    }));

    assert!(rx.await.unwrap());
    assert_eq!(manager.in_flight_count(), 0);
    assert!(manager.all_stats().is_empty());
  }
}
