//! RPC Probe
//!
//! Runs an echo server, or fires a batch of echo calls at one through the
//! callback-based client and reports how they ended. Failure injection rules
//! come from `GRPC_TESTING_RPC_FAILURE` or `--chaos`.

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::net::SocketAddr;

mod config;
mod probe;
mod server;
mod service;

use config::Config;
use probe::ProbeOptions;

#[derive(Parser)]
#[command(name = "rpc-probe")]
#[command(about = "Exercise the RPC client against an echo server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Address to bind. Defaults to RPC_PROBE_HOST.
        #[arg(long)]
        host: Option<String>,

        /// Port to bind. Defaults to RPC_PROBE_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send echo calls and report the outcomes
    Echo {
        #[arg(long)]
        address: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Number of concurrent calls
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Per-call timeout, negative for the configured default
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        timeout_ms: i64,

        /// Use SlowEcho with this server-side delay
        #[arg(short, long)]
        delay_ms: Option<u64>,

        /// Failure rules, e.g. "Echo=fail_before_send:2"
        #[arg(long)]
        chaos: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let config = Config::from_env()?;
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.host.clone());
            let addr: SocketAddr = format!("{}:{}", host, port.unwrap_or(config.port))
                .parse()
                .wrap_err_with(|| format!("invalid listen address '{}'", host))?;
            server::serve(addr).await?;
        }

        Commands::Echo {
            address,
            port,
            message,
            count,
            timeout_ms,
            delay_ms,
            chaos,
        } => {
            let options = ProbeOptions {
                address: address.unwrap_or_else(|| config.host.clone()),
                port: port.unwrap_or(config.port),
                message,
                count,
                timeout_ms,
                delay_ms,
                chaos,
            };
            let report = probe::run(&config, options)
                .await
                .wrap_err("probe failed")?;
            println!("{report}");
        }
    }

    Ok(())
}
