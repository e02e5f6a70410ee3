//! Configuration for the probe

use core_config::rpc::RpcConfig;
use core_config::{env_or_default, env_parse, ConfigError, FromEnv};

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc: RpcConfig,
    /// Address `serve` binds and `echo` dials unless overridden on the command line
    pub host: String,
    pub port: u16,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            rpc: RpcConfig::from_env()?,
            host: env_or_default("RPC_PROBE_HOST", "127.0.0.1"),
            port: env_parse("RPC_PROBE_PORT", 50051)?,
        })
    }
}
