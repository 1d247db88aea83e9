//! StageFS delegator server executable.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;
use env_logger::Env;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;

use stagefs::{
    log_level_filter, pf_error, pf_warn, Delegator, ServerRank,
    StagefsError,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Delegator rank of myself.
    #[arg(short, long)]
    rank: ServerRank,

    /// Port open to clients on this node.
    #[arg(short, long, default_value_t = 47200)]
    api_port: u16,

    /// List of delegator peer addresses, the order of which maps to
    /// delegator ranks. Example: '-d host1:47300 -d host2:47300'.
    #[arg(short, long)]
    delegators: Vec<SocketAddr>,

    /// Log verbosity: FATAL, ERR, WARN, INFO, or DBG.
    #[arg(short, long, default_value_t = String::from("INFO"))]
    log_level: String,

    /// Configuration string in TOML format.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), StagefsError> {
        let mut addr_set = HashSet::new();
        for addr in self.delegators.iter() {
            if addr_set.contains(addr) {
                return Err(StagefsError(format!(
                    "duplicate delegator address '{}' given",
                    addr
                )));
            }
            addr_set.insert(addr);
        }

        if self.delegators.is_empty() {
            Err(StagefsError("empty delegator list given".into()))
        } else if (self.rank as usize) >= self.delegators.len() {
            Err(StagefsError(format!(
                "invalid rank {} / {}",
                self.rank,
                self.delegators.len()
            )))
        } else if self.api_port <= 1024 {
            Err(StagefsError(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(StagefsError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            log_level_filter(&self.log_level)?;
            Ok(())
        }
    }
}

/// Server node executable main entrance.
fn server_main() -> Result<(), StagefsError> {
    let args = CliArgs::parse();
    args.sanitize()?;
    log::set_max_level(log_level_filter(&args.log_level)?);

    let api_addr: SocketAddr =
        format!("127.0.0.1:{}", args.api_port).parse()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-delegator{}", args.rank))
        .build()?;

    runtime.block_on(async move {
        let mut delegator = Delegator::new_and_setup(
            args.rank,
            api_addr,
            args.delegators.clone(),
            args.config.as_deref(),
        )
        .await?;

        // terminate on ctrl-c
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                pf_warn!(args.rank; "interrupt received, terminating");
                let _ = tx_term.send(true);
            }
        });

        delegator.run(rx_term).await?;

        Ok::<(), StagefsError>(())
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), StagefsError> {
        let args = CliArgs {
            rank: 1,
            api_port: 47201,
            delegators: vec![
                "127.0.0.1:47300".parse()?,
                "127.0.0.1:47301".parse()?,
            ],
            log_level: "INFO".into(),
            config: None,
            threads: 4,
        };
        args.sanitize()
    }

    #[test]
    fn sanitize_invalid_rank() -> Result<(), StagefsError> {
        let args = CliArgs {
            rank: 2,
            api_port: 47200,
            delegators: vec!["127.0.0.1:47300".parse()?],
            log_level: "INFO".into(),
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), StagefsError> {
        let args = CliArgs {
            rank: 0,
            api_port: 1023,
            delegators: vec!["127.0.0.1:47300".parse()?],
            log_level: "INFO".into(),
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_duplicate_delegator() -> Result<(), StagefsError> {
        let args = CliArgs {
            rank: 0,
            api_port: 47200,
            delegators: vec![
                "127.0.0.1:47300".parse()?,
                "127.0.0.1:47300".parse()?,
            ],
            log_level: "INFO".into(),
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_log_level() -> Result<(), StagefsError> {
        let args = CliArgs {
            rank: 0,
            api_port: 47200,
            delegators: vec!["127.0.0.1:47300".parse()?],
            log_level: "LOUD".into(),
            config: None,
            threads: 4,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
