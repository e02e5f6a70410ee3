use crate::service::ProbeEcho;
use eyre::{Result, WrapErr};
use rpc::echo::echo_service_server::EchoServiceServer;
use std::net::SocketAddr;
use tracing::info;

/// Serve `echo.v1.EchoService` on `addr` until Ctrl-C
pub async fn serve(addr: SocketAddr) -> Result<()> {
    info!(%addr, "Echo server listening");

    tonic::transport::Server::builder()
        .add_service(EchoServiceServer::new(ProbeEcho))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down echo server");
        })
        .await
        .wrap_err_with(|| format!("echo server on {addr} failed"))?;

    Ok(())
}
