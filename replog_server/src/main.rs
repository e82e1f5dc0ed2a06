//! Replog server replica executable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use replog::{
    logger_init, me_init, pf_error, pf_info, ClusterConfig, LogReplica,
    ReplicaId, ReplogError, TransportHub,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the cluster config TOML file.
    #[arg(short, long)]
    config: PathBuf,

    /// My replica ID, indexing the config's replica list.
    #[arg(short, long)]
    id: ReplicaId,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ReplogError)` on any error.
    fn sanitize(&self) -> Result<(), ReplogError> {
        if self.config.as_os_str().is_empty() {
            Err(ReplogError::msg("empty config path"))
        } else if self.threads < 2 {
            Err(ReplogError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of replog server replica.
fn server_main() -> Result<(), ReplogError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    me_init(format!("r{}", args.id));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, setup the replica, and start the main event
        // loop logic
        runtime.block_on(async move {
            let config = ClusterConfig::from_file(&args.config).await?;
            let bind_addr = match config.replica_addr(args.id) {
                Some(addr) => addr,
                None => {
                    return Err(ReplogError::msg(format!(
                        "replica ID {} not in config",
                        args.id
                    )))
                }
            };

            let transport = TransportHub::new_and_setup(bind_addr, &config).await?;
            let mut replica =
                LogReplica::new_and_setup(args.id, config, transport).await?;
            pf_info!("replica {} listening on '{}'", args.id, bind_addr);

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ReplogError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of replog server replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
