use crate::echo::{echo_service_server, EchoRequest, EchoResponse, SlowEchoRequest};
use grpc_client::{
    CallOptions, ChannelConfig, ClientCallManager, Connection, GrpcClient, GrpcResult, MethodDescriptor,
    RpcService, RpcStatus,
};

/// Marker for `echo.v1.EchoService`
#[derive(Debug, Clone, Copy)]
pub struct EchoService;

impl RpcService for EchoService {
    const NAME: &'static str = echo_service_server::SERVICE_NAME;
}

pub const ECHO: MethodDescriptor<EchoService, EchoRequest, EchoResponse> =
    MethodDescriptor::new("Echo", "/echo.v1.EchoService/Echo");

pub const SLOW_ECHO: MethodDescriptor<EchoService, SlowEchoRequest, EchoResponse> =
    MethodDescriptor::new("SlowEcho", "/echo.v1.EchoService/SlowEcho");

/// Typed client for `echo.v1.EchoService`.
///
/// Calls are named after their method (`Echo`, `SlowEcho`), which is also the
/// key chaos rules match on. `timeout_ms < 0` uses the default timeout.
#[derive(Debug)]
pub struct EchoServiceClient {
    inner: GrpcClient<EchoService>,
}

impl EchoServiceClient {
    pub fn new(
        address: &str,
        port: u16,
        call_manager: ClientCallManager,
        use_tls: bool,
        channel_config: ChannelConfig,
    ) -> GrpcResult<Self> {
        Ok(Self {
            inner: GrpcClient::new(address, port, call_manager, use_tls, channel_config)?,
        })
    }

    pub fn with_connection(connection: Connection, call_manager: ClientCallManager, use_tls: bool) -> Self {
        Self {
            inner: GrpcClient::with_connection(connection, call_manager, use_tls),
        }
    }

    pub fn echo<F>(&self, request: EchoRequest, callback: F, timeout_ms: i64)
    where
        F: FnOnce(RpcStatus, EchoResponse) + Send + 'static,
    {
        self.inner.call_method(
            &ECHO,
            request,
            callback,
            CallOptions::named(ECHO.method()).with_timeout_ms(timeout_ms),
        );
    }

    pub fn slow_echo<F>(&self, request: SlowEchoRequest, callback: F, timeout_ms: i64)
    where
        F: FnOnce(RpcStatus, EchoResponse) + Send + 'static,
    {
        self.inner.call_method(
            &SLOW_ECHO,
            request,
            callback,
            CallOptions::named(SLOW_ECHO.method()).with_timeout_ms(timeout_ms),
        );
    }

    /// Awaitable form of [`EchoServiceClient::echo`]
    pub async fn echo_message(&self, message: impl Into<String>, timeout_ms: i64) -> Result<String, RpcStatus> {
        let request = EchoRequest {
            message: message.into(),
        };
        let options = CallOptions::named(ECHO.method()).with_timeout_ms(timeout_ms);
        self.inner.call(&ECHO, request, options).await.map(|reply| reply.message)
    }

    pub fn is_channel_idle_after_rpcs(&self) -> bool {
        self.inner.is_channel_idle_after_rpcs()
    }

    pub fn inner(&self) -> &GrpcClient<EchoService> {
        &self.inner
    }
}
