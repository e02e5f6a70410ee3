use crate::call::{CallHandle, ClientCallManager};
use crate::channel::{ChannelConfig, Connection, ConnectivityState, build_channel};
use crate::chaos::RpcFailure;
use crate::error::{GrpcError, GrpcResult};
use crate::method::{CallOptions, MethodDescriptor, RpcService};
use crate::status::{RpcStatus, UNAVAILABLE_MESSAGE};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tonic::client::Grpc;
use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;

/// Untyped gRPC client for service `S`, bound to one connection.
pub struct ServiceStub<S> {
  connection: Connection,
  grpc: Grpc<Channel>,
  _service: PhantomData<fn() -> S>,
}

impl<S: RpcService> ServiceStub<S> {
  pub fn new(connection: Connection) -> Self {
    let limit = connection.max_message_size();
    let grpc = Grpc::new(connection.channel().clone())
      .accept_compressed(CompressionEncoding::Zstd)
      .max_decoding_message_size(limit)
      .max_encoding_message_size(limit);

    Self {
      connection,
      grpc,
      _service: PhantomData,
    }
  }

  pub fn connection(&self) -> &Connection {
    &self.connection
  }

  pub(crate) fn grpc(&self) -> &Grpc<Channel> {
    &self.grpc
  }
}

impl<S> Clone for ServiceStub<S> {
  fn clone(&self) -> Self {
    Self {
      connection: self.connection.clone(),
      grpc: self.grpc.clone(),
      _service: PhantomData,
    }
  }
}

/// Client for every method of service `S`.
///
/// All calls go through [`GrpcClient::call_method`]; per-service client types
/// are thin wrappers that pass their own method descriptors.
///
/// ## Example
/// ```ignore
/// let client = GrpcClient::<EchoService>::new("127.0.0.1", 50051, manager, false, ChannelConfig::default())?;
///
/// client.call_method(&ECHO, EchoRequest { message: "hello".into() }, |status, reply| {
///   if status.is_ok() {
///     println!("{}", reply.message);
///   }
/// }, CallOptions::named("Echo"));
/// ```
pub struct GrpcClient<S> {
  call_manager: ClientCallManager,
  stub: ServiceStub<S>,
  call_method_invoked: AtomicBool,
  use_tls: bool,
}

impl<S: RpcService> GrpcClient<S> {
  /// Build a new connection to `address:port` and bind to it
  pub fn new(
    address: &str,
    port: u16,
    call_manager: ClientCallManager,
    use_tls: bool,
    channel_config: ChannelConfig,
  ) -> GrpcResult<Self> {
    // the lazy channel spawns its worker on the manager's runtime
    let _runtime = call_manager.runtime().enter();
    let connection = build_channel(address, port, use_tls, &channel_config)?;
    Ok(Self::with_connection(connection, call_manager, use_tls))
  }

  /// Bind to a connection shared with other clients
  pub fn with_connection(connection: Connection, call_manager: ClientCallManager, use_tls: bool) -> Self {
    Self {
      call_manager,
      stub: ServiceStub::new(connection),
      call_method_invoked: AtomicBool::new(false),
      use_tls,
    }
  }

  /// Invoke `method` and run `callback` exactly once with the outcome.
  ///
  /// Never blocks. The callback runs on the call manager's event loop. A
  /// chaos rule for the call name can replace the outcome with an
  /// `Unavailable` status and a default reply, either without sending the
  /// request or after the real reply arrives.
  ///
  /// # Panics
  ///
  /// If the connection has been shut down. Use [`GrpcClient::try_call_method`]
  /// to get an error instead.
  pub fn call_method<Req, Reply, F>(
    &self,
    method: &MethodDescriptor<S, Req, Reply>,
    request: Req,
    callback: F,
    options: CallOptions,
  ) where
    Req: prost::Message + Send + Sync + 'static,
    Reply: prost::Message + Default + Send + Sync + 'static,
    F: FnOnce(RpcStatus, Reply) + Send + 'static,
  {
    if let Err(e) = self.try_call_method(method, request, callback, options) {
      panic!("{e}");
    }
  }

  /// Like [`GrpcClient::call_method`], but reports a call that could not be
  /// started as [`GrpcError::CallNotScheduled`]. The callback is not run in
  /// that case.
  pub fn try_call_method<Req, Reply, F>(
    &self,
    method: &MethodDescriptor<S, Req, Reply>,
    request: Req,
    callback: F,
    options: CallOptions,
  ) -> GrpcResult<()>
  where
    Req: prost::Message + Send + Sync + 'static,
    Reply: prost::Message + Default + Send + Sync + 'static,
    F: FnOnce(RpcStatus, Reply) + Send + 'static,
  {
    let call_name = options.call_name();
    let result = match self.call_manager.chaos().take_failure(call_name) {
      RpcFailure::FailBeforeSend => {
        tracing::info!(target: "grpc_client", call_name, "Inject RPC request failure for {call_name}");
        self.call_manager.record_injected(call_name);
        self.call_manager.post(call_name, move || {
          callback(RpcStatus::unavailable(UNAVAILABLE_MESSAGE), Reply::default())
        });
        Ok(())
      }
      RpcFailure::FailAfterReceive => {
        let manager = self.call_manager.clone();
        let name = call_name.to_string();
        let handle = self.call_manager.create_call(
          &self.stub,
          method,
          request,
          move |_status: RpcStatus, _reply: Reply| {
            tracing::info!(target: "grpc_client", call_name = %name, "Inject RPC response failure for {name}");
            manager.record_injected_after_receive(&name);
            callback(RpcStatus::unavailable(UNAVAILABLE_MESSAGE), Reply::default())
          },
          call_name,
          options.timeout,
        );
        self.scheduled(handle, call_name)
      }
      RpcFailure::None => {
        let handle =
          self
            .call_manager
            .create_call(&self.stub, method, request, callback, call_name, options.timeout);
        self.scheduled(handle, call_name)
      }
    };

    self.call_method_invoked.store(true, Ordering::Relaxed);
    result
  }

  /// Invoke `method` and wait for the outcome
  pub async fn call<Req, Reply>(
    &self,
    method: &MethodDescriptor<S, Req, Reply>,
    request: Req,
    options: CallOptions,
  ) -> Result<Reply, RpcStatus>
  where
    Req: prost::Message + Send + Sync + 'static,
    Reply: prost::Message + Default + Send + Sync + 'static,
  {
    let (tx, rx) = tokio::sync::oneshot::channel();
    self
      .try_call_method(
        method,
        request,
        move |status, reply| {
          let _ = tx.send(status.into_result(reply));
        },
        options,
      )
      .map_err(|e| RpcStatus::unavailable(e.to_string()))?;

    rx.await
      .unwrap_or_else(|_| Err(RpcStatus::cancelled("callback dropped before completion")))
  }

  pub fn connection(&self) -> &Connection {
    self.stub.connection()
  }

  /// True once at least one call has gone through this client and the
  /// connection has since gone idle
  pub fn is_channel_idle_after_rpcs(&self) -> bool {
    self.connection().state() == ConnectivityState::Idle
      && self.call_method_invoked.load(Ordering::Relaxed)
  }

  pub fn use_tls(&self) -> bool {
    self.use_tls
  }

  pub fn call_manager(&self) -> &ClientCallManager {
    &self.call_manager
  }

  fn scheduled(&self, handle: Option<CallHandle>, call_name: &str) -> GrpcResult<()> {
    match handle {
      Some(_) => Ok(()),
      None => Err(GrpcError::CallNotScheduled {
        call_name: call_name.to_string(),
        target: self.connection().target().to_string(),
      }),
    }
  }
}

impl<S: RpcService> std::fmt::Debug for GrpcClient<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GrpcClient")
      .field("service", &S::NAME)
      .field("target", &self.connection().target())
      .field("use_tls", &self.use_tls)
      .finish()
  }
}
