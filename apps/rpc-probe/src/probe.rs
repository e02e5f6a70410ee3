//! Client side of the probe: fire a batch of calls and tally the outcomes.

use crate::config::Config;
use eyre::Result;
use grpc_client::{
    CallManagerConfig, CallStatsSnapshot, ChannelConfig, ClientCallManager, RpcChaos, RpcStatus,
};
use rpc::echo::{EchoRequest, EchoResponse, SlowEchoRequest};
use rpc::EchoServiceClient;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tonic::Code;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub address: String,
    pub port: u16,
    pub message: String,
    pub count: usize,
    /// Negative uses the configured default
    pub timeout_ms: i64,
    /// Call `SlowEcho` with this delay instead of `Echo`
    pub delay_ms: Option<u64>,
    /// Failure rules, overriding `GRPC_TESTING_RPC_FAILURE`
    pub chaos: Option<String>,
}

#[derive(Debug, Default)]
pub struct ProbeReport {
    pub ok: usize,
    pub unavailable: usize,
    pub deadline_exceeded: usize,
    pub other: usize,
    pub idle_after_rpcs: bool,
    pub stats: HashMap<String, CallStatsSnapshot>,
}

impl ProbeReport {
    fn record(&mut self, status: &RpcStatus) {
        match status.code() {
            Code::Ok => self.ok += 1,
            Code::Unavailable => self.unavailable += 1,
            Code::DeadlineExceeded => self.deadline_exceeded += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.ok + self.unavailable + self.deadline_exceeded + self.other
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "calls: {} ok: {} unavailable: {} deadline_exceeded: {} other: {}",
            self.total(),
            self.ok,
            self.unavailable,
            self.deadline_exceeded,
            self.other
        )?;
        let mut names: Vec<_> = self.stats.keys().collect();
        names.sort();
        for name in names {
            let s = &self.stats[name];
            writeln!(
                f,
                "  {name}: started={} succeeded={} failed={} timed_out={} injected={} mean={:?}",
                s.started,
                s.succeeded,
                s.failed,
                s.timed_out,
                s.injected,
                s.mean_latency()
            )?;
        }
        write!(f, "idle after rpcs: {}", self.idle_after_rpcs)
    }
}

pub async fn run(config: &Config, options: ProbeOptions) -> Result<ProbeReport> {
    let mut manager_config = CallManagerConfig::from_rpc_config(&config.rpc)?;
    if let Some(spec) = options.chaos.as_deref() {
        manager_config = manager_config.with_chaos(Arc::new(RpcChaos::from_spec(spec)?));
    }
    let manager = ClientCallManager::new(Handle::current(), manager_config)?;

    let client = EchoServiceClient::new(
        &options.address,
        options.port,
        manager.clone(),
        config.rpc.use_tls,
        ChannelConfig::from_rpc_config(&config.rpc),
    )?;

    info!(
        address = %options.address,
        port = options.port,
        count = options.count,
        "Starting probe"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, RpcStatus, EchoResponse)>();
    for i in 0..options.count {
        let tx = tx.clone();
        let callback = move |status: RpcStatus, reply: EchoResponse| {
            let _ = tx.send((i, status, reply));
        };
        let message = format!("{}-{}", options.message, i);
        match options.delay_ms {
            Some(delay_ms) => client.slow_echo(
                SlowEchoRequest { message, delay_ms },
                callback,
                options.timeout_ms,
            ),
            None => client.echo(EchoRequest { message }, callback, options.timeout_ms),
        }
    }
    drop(tx);

    let mut report = ProbeReport::default();
    while let Some((i, status, reply)) = rx.recv().await {
        if status.is_ok() {
            info!(call = i, reply = %reply.message, "Call succeeded");
        } else {
            warn!(call = i, code = ?status.code(), message = status.message(), "Call failed");
        }
        report.record(&status);
    }

    report.idle_after_rpcs = client.is_channel_idle_after_rpcs();
    report.stats = manager.all_stats();
    Ok(report)
}
