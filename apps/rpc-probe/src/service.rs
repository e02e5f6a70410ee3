use rpc::echo::echo_service_server::EchoService;
use rpc::echo::{EchoRequest, EchoResponse, SlowEchoRequest};
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Echo implementation that logs what it answers
#[derive(Debug, Default)]
pub struct ProbeEcho;

fn request_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

#[tonic::async_trait]
impl EchoService for ProbeEcho {
    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        let request_id = request_id(&request);
        let message = request.into_inner().message;
        debug!(%request_id, len = message.len(), "Echo");
        Ok(Response::new(EchoResponse { message }))
    }

    async fn slow_echo(
        &self,
        request: Request<SlowEchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let request_id = request_id(&request);
        let SlowEchoRequest { message, delay_ms } = request.into_inner();
        debug!(%request_id, delay_ms, "SlowEcho");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Response::new(EchoResponse { message }))
    }
}
