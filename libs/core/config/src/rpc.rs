use crate::{env_bool, env_optional, env_parse, ConfigError, FromEnv};
use std::path::PathBuf;

/// Default cap on a single gRPC message in either direction (512 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024 * 1024;

/// Default HTTP/2 per-stream buffer (4 MiB)
pub const DEFAULT_STREAM_BUFFER_SIZE: u32 = 4 * 1024 * 1024;

/// Default deadline for calls that don't set their own
pub const DEFAULT_CLIENT_CALL_TIMEOUT_MS: u64 = 60_000;

/// Default quiet period after which a client closes its transport (30 min)
pub const DEFAULT_CLIENT_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Runtime settings shared by every RPC client in the process.
///
/// Reads:
/// - `GRPC_ENABLE_HTTP_PROXY` (default: false)
/// - `GRPC_MAX_MESSAGE_SIZE` (default: 536870912 / 512MB)
/// - `GRPC_STREAM_BUFFER_SIZE` (default: 4194304 / 4MB)
/// - `GRPC_USE_TLS` (default: false)
/// - `GRPC_TLS_SERVER_CERT`, `GRPC_TLS_SERVER_KEY`, `GRPC_TLS_CA_CERT`
/// - `GRPC_CLIENT_CALL_TIMEOUT_MS` (default: 60000)
/// - `GRPC_CLIENT_IDLE_TIMEOUT_MS` (default: 1800000, 0 disables)
/// - `GRPC_TESTING_RPC_FAILURE`, e.g. `Echo=fail_before_send,Ping=fail_after_receive:2`
/// - `GRPC_CLUSTER_ID`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// Route connections through the proxy named by `HTTP(S)_PROXY`
    pub enable_http_proxy: bool,
    pub max_message_size: usize,
    pub stream_buffer_size: u32,
    pub use_tls: bool,
    /// PEM certificate chain presented by this process
    pub tls_server_cert: Option<PathBuf>,
    /// PEM private key matching `tls_server_cert`
    pub tls_server_key: Option<PathBuf>,
    /// PEM root used to verify peers
    pub tls_ca_cert: Option<PathBuf>,
    pub client_call_timeout_ms: u64,
    /// Close a transport with no calls and no traffic for this long
    pub client_idle_timeout_ms: u64,
    /// Failure injection rules, test clusters only
    pub testing_rpc_failure: Option<String>,
    /// Attached to every outgoing call as `x-cluster-id`
    pub cluster_id: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enable_http_proxy: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            use_tls: false,
            tls_server_cert: None,
            tls_server_key: None,
            tls_ca_cert: None,
            client_call_timeout_ms: DEFAULT_CLIENT_CALL_TIMEOUT_MS,
            client_idle_timeout_ms: DEFAULT_CLIENT_IDLE_TIMEOUT_MS,
            testing_rpc_failure: None,
            cluster_id: None,
        }
    }
}

impl FromEnv for RpcConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enable_http_proxy: env_bool("GRPC_ENABLE_HTTP_PROXY", false)?,
            max_message_size: env_parse("GRPC_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE)?,
            stream_buffer_size: env_parse("GRPC_STREAM_BUFFER_SIZE", DEFAULT_STREAM_BUFFER_SIZE)?,
            use_tls: env_bool("GRPC_USE_TLS", false)?,
            tls_server_cert: env_optional("GRPC_TLS_SERVER_CERT").map(PathBuf::from),
            tls_server_key: env_optional("GRPC_TLS_SERVER_KEY").map(PathBuf::from),
            tls_ca_cert: env_optional("GRPC_TLS_CA_CERT").map(PathBuf::from),
            client_call_timeout_ms: env_parse(
                "GRPC_CLIENT_CALL_TIMEOUT_MS",
                DEFAULT_CLIENT_CALL_TIMEOUT_MS,
            )?,
            client_idle_timeout_ms: env_parse(
                "GRPC_CLIENT_IDLE_TIMEOUT_MS",
                DEFAULT_CLIENT_IDLE_TIMEOUT_MS,
            )?,
            testing_rpc_failure: env_optional("GRPC_TESTING_RPC_FAILURE"),
            cluster_id: env_optional("GRPC_CLUSTER_ID"),
        })
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all three TLS paths are configured
    pub fn has_tls_files(&self) -> bool {
        self.tls_server_cert.is_some() && self.tls_server_key.is_some() && self.tls_ca_cert.is_some()
    }
}
