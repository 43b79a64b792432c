//! ShardKV client side executable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use tokio::runtime::Builder;

use shardkv::{
    logger_init, pf_error, Clerk, ClusterConfig, ServerIdx, ShardKvError,
    ShardRouter, TcpTransport,
};

mod repl;

use crate::repl::ClientRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster configuration TOML string; must match the servers'.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Clerk retry configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    clerk_config: String,

    /// TCP transport configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    transport_config: String,

    /// Base address 'ip:port' of the servers' API; server i is reached at
    /// port + i.
    #[arg(short, long)]
    server_base: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

/// Turns a '+'-separated TOML argument into an optional config string.
fn config_arg(arg: &str) -> Option<String> {
    if arg.is_empty() {
        None
    } else {
        Some(arg.replace('+', "\n"))
    }
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(ShardKvError)` on any error.
    fn sanitize(&self) -> Result<ClusterConfig, ShardKvError> {
        if self.threads < 2 {
            return Err(ShardKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let config = ClusterConfig::parse(config_arg(&self.config).as_deref())?;
        if self.server_base.port() as u32 + config.nservers as u32 > 65536 {
            return Err(ShardKvError::msg(format!(
                "server_base port {} leaves no room for {} servers",
                self.server_base.port(),
                config.nservers
            )));
        }
        Ok(config)
    }

    /// API addresses of all servers.
    fn server_addrs(&self, nservers: u8) -> HashMap<ServerIdx, SocketAddr> {
        (0..nservers)
            .map(|idx| {
                let addr = SocketAddr::new(
                    self.server_base.ip(),
                    self.server_base.port() + idx as u16,
                );
                (idx, addr)
            })
            .collect()
    }
}

/// Actual main function of ShardKV client executable.
fn client_main() -> Result<(), ShardKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    let router = ShardRouter::new(&config)?;
    let transport = Arc::new(TcpTransport::new(
        args.server_addrs(config.nservers),
        config_arg(&args.transport_config).as_deref(),
    )?);
    let clerk = Clerk::new(
        router,
        transport,
        config_arg(&args.clerk_config).as_deref(),
    )?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime and run the interactive loop
    runtime.block_on(async move {
        let mut repl = ClientRepl::new(clerk);
        repl.run().await
    })
}

/// Main function of ShardKV client executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "nservers = 4".into(),
            clerk_config: "".into(),
            transport_config: "".into(),
            server_base: "127.0.0.1:52700".parse()?,
            threads: 2,
        };
        let config = args.sanitize()?;
        assert_eq!(config.nservers, 4);
        let addrs = args.server_addrs(config.nservers);
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[&3], "127.0.0.1:52703".parse()?);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_config() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "nreplicas = 0".into(),
            clerk_config: "".into(),
            transport_config: "".into(),
            server_base: "127.0.0.1:52700".parse()?,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "".into(),
            clerk_config: "".into(),
            transport_config: "".into(),
            server_base: "127.0.0.1:52700".parse()?,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn config_arg_newlines() {
        assert_eq!(config_arg(""), None);
        assert_eq!(
            config_arg("backoff_min_ms = 1+backoff_max_ms = 5"),
            Some("backoff_min_ms = 1\nbackoff_max_ms = 5".into())
        );
    }
}
