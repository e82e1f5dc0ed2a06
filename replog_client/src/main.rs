//! Replog chat client executable. Keeps submitting random five-word lines.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use rand::prelude::*;
use replog::{
    logger_init, me_init, pf_error, pf_info, pf_warn, ClientEndpoint,
    ClientId, ClusterConfig, ReplogError, TransportHub,
};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Vocabulary that chat lines are drawn from.
const WORDS: &[&str] = &[
    "apple", "bridge", "candle", "desert", "engine", "forest", "garden",
    "harbor", "island", "jungle", "kettle", "lantern", "meadow", "needle",
    "orbit", "pepper", "quartz", "river", "saddle", "timber", "umbrella",
    "valley", "window", "yellow", "zephyr",
];

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the cluster config TOML file.
    #[arg(short, long)]
    config: PathBuf,

    /// My client ID, indexing the config's client list.
    #[arg(short, long)]
    id: ClientId,

    /// Number of lines to submit; 0 means until terminated.
    #[arg(short = 'n', long, default_value_t = 0)]
    requests: u64,

    /// Pause between consecutive submissions in millisecs.
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ReplogError)` on any error.
    fn sanitize(&self) -> Result<(), ReplogError> {
        if self.config.as_os_str().is_empty() {
            Err(ReplogError::msg("empty config path"))
        } else if self.interval_ms > 60_000 {
            Err(ReplogError::msg(format!(
                "invalid interval_ms {}",
                self.interval_ms
            )))
        } else {
            Ok(())
        }
    }
}

/// Composes a chat line of five random words and a period.
fn random_line<R: Rng>(rng: &mut R) -> String {
    let words: Vec<&str> = (0..5)
        .filter_map(|_| WORDS.choose(rng).copied())
        .collect();
    format!("{}.", words.join(" "))
}

/// Actual main function of replog client.
fn client_main() -> Result<(), ReplogError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    me_init(format!("c{}", args.id));

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name("tokio-worker-client")
            .build()?;

        runtime.block_on(async move {
            let config = ClusterConfig::from_file(&args.config).await?;
            let bind_addr = match config.client_addr(args.id) {
                Some(addr) => addr,
                None => {
                    return Err(ReplogError::msg(format!(
                        "client ID {} not in config",
                        args.id
                    )))
                }
            };
            let transport = TransportHub::new_and_setup(bind_addr, &config).await?;
            let mut endpoint =
                ClientEndpoint::new_and_setup(args.id, &config, transport)?;

            let mut submitted = 0;
            while args.requests == 0 || submitted < args.requests {
                let line = random_line(&mut thread_rng());
                tokio::select! {
                    res = endpoint.submit(line.clone()) => {
                        let client_seq = res?;
                        pf_info!("committed #{} '{}'", client_seq, line);
                        submitted += 1;
                    },
                    _ = rx_term.changed() => {
                        pf_warn!("client caught termination signal");
                        break;
                    }
                }
                if args.interval_ms > 0 {
                    time::sleep(Duration::from_millis(args.interval_ms)).await;
                }
            }

            log::set_max_level(LevelFilter::Off);
            Ok::<(), ReplogError>(())
        })?;
    }

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of replog client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
