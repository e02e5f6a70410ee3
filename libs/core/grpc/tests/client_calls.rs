//! End-to-end calls against a local echo server.

use grpc_client::{
  CallManagerConfig, CallOptions, ChannelConfig, ClientCallManager, ConnectivityState, GrpcClient, GrpcError,
  RpcChaos, RpcFailure, RpcStatus, UNAVAILABLE_MESSAGE,
};
use test_utils::TestDataBuilder;
use rpc::echo::{EchoRequest, EchoResponse, SlowEchoRequest};
use rpc::{ECHO, EchoService, SLOW_ECHO};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use test_utils::TestEchoServer;
use test_utils::assertions::{assert_deadline_exceeded, assert_ok, assert_some, assert_unavailable};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

struct Outcome {
  status: RpcStatus,
  reply: EchoResponse,
  thread: Option<String>,
  at: Instant,
}

fn manager(chaos: Arc<RpcChaos>) -> ClientCallManager {
  ClientCallManager::new(Handle::current(), CallManagerConfig::new().with_chaos(chaos)).unwrap()
}

fn client_for(server: &TestEchoServer, manager: ClientCallManager) -> GrpcClient<EchoService> {
  client_with(server, manager, ChannelConfig::default())
}

fn client_with(server: &TestEchoServer, manager: ClientCallManager, config: ChannelConfig) -> GrpcClient<EchoService> {
  GrpcClient::new(&server.address(), server.port(), manager, false, config).unwrap()
}

/// Poll the connection until it reports `expected`
async fn wait_for_state(client: &GrpcClient<EchoService>, expected: ConnectivityState) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while client.connection().state() != expected {
    assert!(
      Instant::now() < deadline,
      "connection stuck in {:?}, expected {expected:?}",
      client.connection().state()
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

/// Callback that forwards its outcome to `tx`
fn forward(tx: mpsc::UnboundedSender<Outcome>) -> impl FnOnce(RpcStatus, EchoResponse) + Send + 'static {
  move |status, reply| {
    let _ = tx.send(Outcome {
      status,
      reply,
      thread: std::thread::current().name().map(str::to_string),
      at: Instant::now(),
    });
  }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
  tokio::time::timeout(Duration::from_secs(10), rx.recv())
    .await
    .expect("callback did not fire")
    .expect("callback channel closed")
}

fn echo(message: &str) -> EchoRequest {
  EchoRequest {
    message: message.to_string(),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
  let server = TestEchoServer::start().await;
  let manager = manager(Arc::new(RpcChaos::new()));
  let client = client_for(&server, manager.clone());
  let (tx, mut rx) = mpsc::unbounded_channel();

  client.call_method(&ECHO, echo("hello"), forward(tx), CallOptions::named("Echo"));

  let outcome = next(&mut rx).await;
  assert_ok(&outcome.status, "echo");
  assert_eq!(outcome.reply.message, "hello");
  assert_eq!(outcome.thread.as_deref(), Some(manager.event_loop().thread_name()));
  assert_eq!(server.received(), vec!["hello".to_string()]);

  let stats = manager.stats("Echo");
  assert_eq!(stats.started, 1);
  assert_eq!(stats.succeeded, 1);
  assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_before_send_skips_transport() {
  let data = TestDataBuilder::from_test_name("test_fail_before_send_skips_transport");
  let call_name = data.call_name("Echo");
  let server = TestEchoServer::start().await;
  let chaos = Arc::new(RpcChaos::new());
  chaos.set_failure(call_name.as_str(), RpcFailure::FailBeforeSend);
  let client = client_for(&server, manager(chaos));
  let (tx, mut rx) = mpsc::unbounded_channel();

  client.call_method(&ECHO, echo(&data.message("dropped")), forward(tx), CallOptions::named(call_name));

  let outcome = next(&mut rx).await;
  assert_unavailable(&outcome.status, "injected before send");
  assert_eq!(outcome.status.message(), UNAVAILABLE_MESSAGE);
  assert_eq!(outcome.reply, EchoResponse::default());

  assert!(!server.wait_for_requests(1, Duration::from_millis(100)).await);
  assert_eq!(client.connection().state(), ConnectivityState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_after_receive_reaches_peer() {
  let data = TestDataBuilder::from_test_name("test_fail_after_receive_reaches_peer");
  let call_name = data.call_name("Echo");
  let message = data.message("hi");
  let server = TestEchoServer::start().await;
  let chaos = Arc::new(RpcChaos::new());
  chaos.set_failure(call_name.as_str(), RpcFailure::FailAfterReceive);
  let manager = manager(chaos);
  let client = client_for(&server, manager.clone());
  let (tx, mut rx) = mpsc::unbounded_channel();

  client.call_method(&ECHO, echo(&message), forward(tx), CallOptions::named(call_name.as_str()));

  let outcome = next(&mut rx).await;
  assert_unavailable(&outcome.status, "injected after receive");
  assert_eq!(outcome.reply, EchoResponse::default());
  assert_eq!(server.received(), vec![message]);
  assert_eq!(manager.stats(&call_name).injected, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fail_after_receive_over_timeout_fires_once() {
  let data = TestDataBuilder::from_test_name("test_fail_after_receive_over_timeout_fires_once");
  let call_name = data.call_name("Echo");
  let server = TestEchoServer::start_unresponsive().await;
  let chaos = Arc::new(RpcChaos::new());
  chaos.set_failure(call_name.as_str(), RpcFailure::FailAfterReceive);
  let manager = manager(chaos);
  let client = client_for(&server, manager.clone());
  let fired = Arc::new(AtomicUsize::new(0));
  let (tx, mut rx) = mpsc::unbounded_channel();

  let counter = fired.clone();
  let callback = forward(tx);
  client.call_method(
    &ECHO,
    echo(&data.message("unanswered")),
    move |status, reply| {
      counter.fetch_add(1, Ordering::SeqCst);
      callback(status, reply);
    },
    CallOptions::named(call_name.as_str()).with_timeout_ms(50),
  );

  // the real outcome is a timeout; the caller still only sees the injected failure
  let outcome = next(&mut rx).await;
  assert_unavailable(&outcome.status, "injected over a timeout");
  assert_eq!(outcome.status.message(), UNAVAILABLE_MESSAGE);
  assert_eq!(outcome.reply, EchoResponse::default());

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(rx.try_recv().is_err());
  assert_eq!(fired.load(Ordering::SeqCst), 1);

  let stats = manager.stats(&call_name);
  assert_eq!(stats.injected, 1);
  assert_eq!(stats.timed_out, 1);
  assert_eq!(manager.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unanswered_call_times_out_once() {
  let server = TestEchoServer::start_unresponsive().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));
  let fired = Arc::new(AtomicUsize::new(0));
  let (tx, mut rx) = mpsc::unbounded_channel();

  let started = Instant::now();
  let counter = fired.clone();
  let callback = forward(tx);
  client.call_method(
    &ECHO,
    echo("anyone there?"),
    move |status, reply| {
      counter.fetch_add(1, Ordering::SeqCst);
      callback(status, reply);
    },
    CallOptions::named("Echo").with_timeout_ms(50),
  );

  let outcome = next(&mut rx).await;
  assert_deadline_exceeded(&outcome.status, "unresponsive peer");
  let elapsed = outcome.at - started;
  assert!(elapsed >= Duration::from_millis(50), "fired early after {elapsed:?}");
  assert!(elapsed < Duration::from_secs(2), "fired late after {elapsed:?}");

  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(fired.load(Ordering::SeqCst), 1);
  assert_eq!(client.call_manager().stats("Echo").timed_out, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fast_call_not_blocked_by_slow_call() {
  let server = TestEchoServer::start().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));
  let (slow_tx, mut slow_rx) = mpsc::unbounded_channel();
  let (fast_tx, mut fast_rx) = mpsc::unbounded_channel();

  let started = Instant::now();
  client.call_method(
    &SLOW_ECHO,
    SlowEchoRequest {
      message: "slow".into(),
      delay_ms: 800,
    },
    forward(slow_tx),
    CallOptions::named("SlowEcho"),
  );
  client.call_method(&ECHO, echo("fast"), forward(fast_tx), CallOptions::named("Echo"));

  let fast = next(&mut fast_rx).await;
  let slow = next(&mut slow_rx).await;

  assert_ok(&fast.status, "fast call");
  assert_ok(&slow.status, "slow call");
  assert_eq!(fast.reply.message, "fast");
  assert_eq!(slow.reply.message, "slow");
  assert!(fast.at < slow.at);
  assert!(fast.at - started < Duration::from_millis(700));

  tokio::time::sleep(Duration::from_millis(100)).await;
  assert!(fast_rx.try_recv().is_err());
  assert!(slow_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exactly_once_when_timeout_races_reply() {
  let server = TestEchoServer::start().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));
  let calls = 20;
  let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..calls).map(|_| AtomicUsize::new(0)).collect());
  let (tx, mut rx) = mpsc::unbounded_channel();

  for i in 0..calls {
    let counts = counts.clone();
    let tx = tx.clone();
    client.call_method(
      &SLOW_ECHO,
      SlowEchoRequest {
        message: format!("race-{i}"),
        delay_ms: 40,
      },
      move |status: RpcStatus, _reply: EchoResponse| {
        counts[i].fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(status);
      },
      CallOptions::named("SlowEcho").with_timeout(Duration::from_millis(40)),
    );
  }
  drop(tx);

  let mut delivered = 0;
  while let Ok(Some(status)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
    assert!(status.is_ok() || status.is_deadline_exceeded(), "unexpected {status:?}");
    delivered += 1;
  }

  assert_eq!(delivered, calls);
  for count in counts.iter() {
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
  assert_eq!(client.call_manager().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_only_after_activity() {
  let server = TestEchoServer::start().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));
  assert!(!client.is_channel_idle_after_rpcs());

  let reply = client.call(&ECHO, echo("ping"), CallOptions::named("Echo")).await.unwrap();
  assert_eq!(reply.message, "ping");
  assert_eq!(client.connection().state(), ConnectivityState::Ready);
  assert!(!client.is_channel_idle_after_rpcs());

  server.shutdown().await;

  let deadline = Instant::now() + Duration::from_secs(5);
  while !client.is_channel_idle_after_rpcs() {
    assert!(Instant::now() < deadline, "connection never went idle");
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quiet_connection_goes_idle_and_reconnects() {
  let data = TestDataBuilder::from_test_name("test_quiet_connection_goes_idle_and_reconnects");
  let server = TestEchoServer::start().await;
  let config = ChannelConfig::new().with_idle_timeout(Duration::from_millis(200));
  let client = client_with(&server, manager(Arc::new(RpcChaos::new())), config);

  let first = data.message("first");
  let reply = client.call(&ECHO, echo(&first), CallOptions::named("Echo")).await.unwrap();
  assert_eq!(reply.message, first);
  assert_eq!(client.connection().state(), ConnectivityState::Ready);

  // the server stays up; only the client's idle timer closes the transport
  wait_for_state(&client, ConnectivityState::Idle).await;
  assert!(client.is_channel_idle_after_rpcs());

  let second = data.message("second");
  let reply = client.call(&ECHO, echo(&second), CallOptions::named("Echo")).await.unwrap();
  assert_eq!(reply.message, second);
  assert_eq!(client.connection().state(), ConnectivityState::Ready);
  assert_eq!(server.received(), vec![first, second]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_timeout_does_not_cut_open_call() {
  let server = TestEchoServer::start().await;
  let config = ChannelConfig::new().with_idle_timeout(Duration::from_millis(100));
  let client = client_with(&server, manager(Arc::new(RpcChaos::new())), config);

  let reply = client
    .call(
      &SLOW_ECHO,
      SlowEchoRequest {
        message: "long".into(),
        delay_ms: 500,
      },
      CallOptions::named("SlowEcho"),
    )
    .await
    .unwrap();
  assert_eq!(reply.message, "long");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transport_dropped_before_answer_is_transient_failure() {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let acceptor = tokio::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      drop(socket);
    }
  });

  let client = GrpcClient::<EchoService>::new(
    "127.0.0.1",
    port,
    manager(Arc::new(RpcChaos::new())),
    false,
    ChannelConfig::default(),
  )
  .unwrap();

  let status = client
    .call(&ECHO, echo("nobody answers"), CallOptions::named("Echo").with_timeout_ms(2_000))
    .await
    .unwrap_err();
  assert!(!status.is_ok());

  wait_for_state(&client, ConnectivityState::TransientFailure).await;
  assert!(!client.is_channel_idle_after_rpcs());
  acceptor.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_huge_timeout_is_clamped() {
  let server = TestEchoServer::start().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));

  let reply = client
    .call(&ECHO, echo("patient"), CallOptions::named("Echo").with_timeout_ms(i64::MAX))
    .await
    .unwrap();
  assert_eq!(reply.message, "patient");
  assert_eq!(client.call_manager().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bounded_failure_then_recovery() {
  let data = TestDataBuilder::from_test_name("test_bounded_failure_then_recovery");
  let call_name = data.call_name("Echo");
  let server = TestEchoServer::start().await;
  let chaos = Arc::new(RpcChaos::new());
  chaos.set_failure_times(call_name.as_str(), RpcFailure::FailBeforeSend, 1);
  let client = client_for(&server, manager(chaos.clone()));

  let first = client.call(&ECHO, echo(&data.message("one")), CallOptions::named(call_name.as_str())).await;
  assert_unavailable(&first.unwrap_err(), "first call");

  let two = data.message("two");
  let second = client.call(&ECHO, echo(&two), CallOptions::named(call_name.as_str())).await;
  assert_eq!(second.unwrap().message, two);
  assert_eq!(server.received(), vec![two]);
  assert_eq!(chaos.get_failure(&call_name), RpcFailure::None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rule_only_matches_its_call_name() {
  let server = TestEchoServer::start().await;
  let chaos = Arc::new(RpcChaos::new());
  chaos.set_failure("Other", RpcFailure::FailBeforeSend);
  let client = client_for(&server, manager(chaos));

  let reply = client.call(&ECHO, echo("clean"), CallOptions::named("Echo")).await.unwrap();
  assert_eq!(reply.message, "clean");

  // unnamed calls fall back to "UNKNOWN"
  let reply = client.call(&ECHO, echo("anon"), CallOptions::new()).await.unwrap();
  assert_eq!(reply.message, "anon");
  assert_eq!(client.call_manager().stats("UNKNOWN").succeeded, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_is_attached() {
  let data = TestDataBuilder::from_test_name("test_metadata_is_attached");
  let cluster_id = data.cluster_id().to_string();
  let server = TestEchoServer::start().await;
  let manager = ClientCallManager::new(
    Handle::current(),
    CallManagerConfig::new().with_cluster_id(cluster_id.as_str()),
  )
  .unwrap();
  let client = client_for(&server, manager);

  let message = data.message("tagged");
  client.call(&ECHO, echo(&message), CallOptions::named("Echo")).await.unwrap();
  client.call(&ECHO, echo(&message), CallOptions::named("Echo")).await.unwrap();

  let requests = server.requests();
  assert_eq!(requests.len(), 2);
  assert_eq!(requests[0].cluster_id.as_deref(), Some(cluster_id.as_str()));
  let first_id = assert_some(requests[0].request_id.clone(), "first request id");
  let second_id = assert_some(requests[1].request_id.clone(), "second request id");
  assert_ne!(first_id, second_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clients_share_one_connection() {
  let server = TestEchoServer::start().await;
  let manager = manager(Arc::new(RpcChaos::new()));
  let first = client_for(&server, manager.clone());
  let second = GrpcClient::<EchoService>::with_connection(first.connection().clone(), manager, false);

  assert_eq!(first.call(&ECHO, echo("a"), CallOptions::named("Echo")).await.unwrap().message, "a");
  assert_eq!(second.call(&ECHO, echo("b"), CallOptions::named("Echo")).await.unwrap().message, "b");

  first.connection().shutdown();
  assert!(second.connection().is_shutdown());
  let err = second
    .try_call_method(&ECHO, echo("c"), |_, _| {}, CallOptions::named("Echo"))
    .unwrap_err();
  assert!(matches!(err, GrpcError::CallNotScheduled { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tls_with_unreadable_certificates() {
  let manager = manager(Arc::new(RpcChaos::new()));
  let config = ChannelConfig::new().with_tls_files(
    "/nonexistent/grpc-client/server.crt",
    "/nonexistent/grpc-client/server.key",
    "/nonexistent/grpc-client/ca.crt",
  );

  let err = GrpcClient::<EchoService>::new("127.0.0.1", 50051, manager, true, config).unwrap_err();
  assert!(matches!(err, GrpcError::CertificateRead { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_callback_does_not_stop_later_callbacks() {
  let server = TestEchoServer::start().await;
  let client = client_for(&server, manager(Arc::new(RpcChaos::new())));
  let (tx, mut rx) = mpsc::unbounded_channel();

  let reply = client.call(&ECHO, echo("warmup"), CallOptions::named("Echo")).await;
  assert!(reply.is_ok());

  client.call_method(
    &ECHO,
    echo("boom"),
    |_: RpcStatus, _: EchoResponse| panic!("callback failure"),
    CallOptions::named("Echo"),
  );
  client.call_method(&ECHO, echo("after"), forward(tx), CallOptions::named("Echo"));

  let outcome = next(&mut rx).await;
  assert_ok(&outcome.status, "callback after a panicking one");
  assert_eq!(outcome.reply.message, "after");
}
