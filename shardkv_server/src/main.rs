//! ShardKV server executable. Hosts every node of one cluster in this
//! process and serves each over its own TCP port.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use shardkv::{
    logger_init, pf_error, pf_info, ClusterConfig, ExternalApi, LocalCluster,
    ShardKvError,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Base address 'ip:port' to bind the client-facing API on; server i
    /// listens on port + i.
    /// Ports [port, port + nservers) must be available at process launch.
    #[arg(short, long)]
    bind_base: SocketAddr,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
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
        if self.bind_base.port() <= 1024 {
            return Err(ShardKvError::msg(format!(
                "invalid bind_base port {}",
                self.bind_base.port()
            )));
        }

        let config_str = self.config.replace('+', "\n");
        let config = ClusterConfig::parse(if config_str.is_empty() {
            None
        } else {
            Some(&config_str)
        })?;
        if self.bind_base.port() as u32 + config.nservers as u32 > 65536 {
            return Err(ShardKvError::msg(format!(
                "bind_base port {} leaves no room for {} servers",
                self.bind_base.port(),
                config.nservers
            )));
        }
        Ok(config)
    }
}

/// Actual main function of ShardKV server executable.
fn server_main() -> Result<(), ShardKvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("s"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, set up the cluster and its API listeners, then
        // wait for termination
        runtime.block_on(async move {
            let cluster = LocalCluster::new(config)?;

            let mut apis = Vec::with_capacity(cluster.servers().len());
            for server in cluster.servers() {
                let api_addr = SocketAddr::new(
                    args.bind_base.ip(),
                    args.bind_base.port() + server.id() as u16,
                );
                let mut api = ExternalApi::new(server.id());
                api.setup(server.clone(), api_addr).await?;
                apis.push(api);
            }
            pf_info!(
                "s";
                "cluster of {} servers up, {} replicas per key",
                config.nservers,
                config.nreplicas
            );

            while !*rx_term.borrow() {
                if rx_term.changed().await.is_err() {
                    break;
                }
            }
            pf_info!("s"; "terminating on signal");
            drop(apis);

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ShardKvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of ShardKV server executable.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
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
            config: "nservers = 5+nreplicas = 3".into(),
            bind_base: "127.0.0.1:52700".parse()?,
            threads: 2,
        };
        assert_eq!(
            args.sanitize(),
            Ok(ClusterConfig {
                nservers: 5,
                nreplicas: 3
            })
        );
        Ok(())
    }

    #[test]
    fn sanitize_default_config() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "".into(),
            bind_base: "127.0.0.1:52700".parse()?,
            threads: 2,
        };
        assert_eq!(args.sanitize(), Ok(ClusterConfig::default()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_config() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "nservers = 2+nreplicas = 3".into(),
            bind_base: "127.0.0.1:52700".parse()?,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "".into(),
            bind_base: "127.0.0.1:1023".parse()?,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            config: "".into(),
            bind_base: "127.0.0.1:65534".parse()?,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), ShardKvError> {
        let args = CliArgs {
            config: "".into(),
            bind_base: "127.0.0.1:52700".parse()?,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
