//! Local `echo.v1.EchoService` endpoint for client tests
//!
//! Binds `127.0.0.1:0`, so tests can run in parallel, and records the payload
//! of every request it receives.

use rpc::echo::echo_service_server::{EchoService, EchoServiceServer};
use rpc::echo::{EchoRequest, EchoResponse, SlowEchoRequest};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

/// One request as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub message: String,
    pub request_id: Option<String>,
    pub cluster_id: Option<String>,
}

#[derive(Default)]
struct RecordingEcho {
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    /// Never answer, for timeout tests
    unresponsive: bool,
}

impl RecordingEcho {
    fn record<T>(&self, request: &Request<T>, message: &str) {
        let header = |key: &str| {
            request
                .metadata()
                .get(key)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let received = ReceivedRequest {
            message: message.to_string(),
            request_id: header("x-request-id"),
            cluster_id: header("x-cluster-id"),
        };
        self.received
            .lock()
            .expect("received lock poisoned")
            .push(received);
    }

    async fn hang_if_unresponsive(&self) {
        if self.unresponsive {
            std::future::pending::<()>().await;
        }
    }
}

#[tonic::async_trait]
impl EchoService for RecordingEcho {
    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoResponse>, Status> {
        self.record(&request, &request.get_ref().message);
        let message = request.into_inner().message;
        self.hang_if_unresponsive().await;
        Ok(Response::new(EchoResponse { message }))
    }

    async fn slow_echo(
        &self,
        request: Request<SlowEchoRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        self.record(&request, &request.get_ref().message);
        let SlowEchoRequest { message, delay_ms } = request.into_inner();
        self.hang_if_unresponsive().await;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(Response::new(EchoResponse { message }))
    }
}

/// Running echo server
///
/// Stopped by [`TestEchoServer::shutdown`] or, less gracefully, on drop.
///
/// # Example
///
/// ```rust,ignore
/// use test_utils::TestEchoServer;
///
/// #[tokio::test]
/// async fn my_client_test() {
///     let server = TestEchoServer::start().await;
///     // point a client at server.address() / server.port()
///     assert!(server.received().is_empty());
///     server.shutdown().await;
/// }
/// ```
pub struct TestEchoServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestEchoServer {
    /// Start a server that echoes every request
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// Start a server that records requests and never answers them
    pub async fn start_unresponsive() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(unresponsive: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test echo server");
        let addr = listener.local_addr().expect("Failed to read local address");

        let received = Arc::new(Mutex::new(Vec::new()));
        let service = RecordingEcho {
            received: received.clone(),
            unresponsive,
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(EchoServiceServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(%addr, error = %e, "Test echo server failed");
            }
        });

        tracing::debug!(%addr, unresponsive, "Test echo server listening");

        Self {
            addr,
            received,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn address(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Payloads received so far, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.message).collect()
    }

    /// Everything recorded about the requests received so far
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.received
            .lock()
            .expect("received lock poisoned")
            .clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().expect("received lock poisoned").len()
    }

    /// Wait until at least `count` requests arrived. Returns false on timeout.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.received_count() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop accepting requests and close connections.
    ///
    /// Waits up to five seconds for in-flight requests, then aborts.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}

impl Drop for TestEchoServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
