//! Replog cluster manager: generates cluster configs and runs fault-injection
//! experiments by launching replicas and clients as child processes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use log::{self, LevelFilter};
use replog::{
    logger_init, logs_agree, me_init, pf_error, pf_info, pf_warn, read_lines,
    ClusterConfig, ReplicaId, ReplogError,
};
use tokio::process::{Child, Command};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// A replica to kill at a given offset since cluster launch, written as
/// `<id>@<secs>`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct KillAt {
    replica: ReplicaId,
    after_s: f64,
}

impl FromStr for KillAt {
    type Err = ReplogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (replica, after_s) = s.split_once('@').ok_or_else(|| {
            ReplogError::msg(format!("invalid kill schedule '{}'", s))
        })?;
        let replica = replica.trim().parse()?;
        let after_s: f64 = after_s.trim().parse()?;
        if !after_s.is_finite() || after_s < 0.0 {
            return Err(ReplogError::msg(format!(
                "invalid kill offset '{}'",
                after_s
            )));
        }
        Ok(KillAt { replica, after_s })
    }
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Write an all-on-localhost cluster config file.
    Genconfig {
        /// Number of tolerated crash failures.
        #[arg(short, long, default_value_t = 1)]
        f: u8,

        /// Number of clients.
        #[arg(short, long, default_value_t = 1)]
        clients: u16,

        /// First port; clients take the first ones, replicas the rest.
        #[arg(short, long, default_value_t = 54550)]
        base_port: u16,

        /// Probability of dropping any outbound send.
        #[arg(long, default_value_t = 0.0)]
        loss_rate: f64,

        /// Let the leader randomly skip slots.
        #[arg(long)]
        skip_slot: bool,

        /// Output file path.
        #[arg(short, long, default_value = "cluster.toml")]
        output: PathBuf,
    },

    /// Launch the cluster, inject crashes, then check the commit logs.
    Run {
        /// Path to the cluster config TOML file.
        #[arg(short, long)]
        config: PathBuf,

        /// Total experiment duration in secs.
        #[arg(short, long, default_value_t = 40)]
        duration_s: u64,

        /// Replicas to kill, e.g. '--kill 0@2 --kill 1@10'.
        #[arg(short, long)]
        kill: Vec<KillAt>,

        /// Directory holding the replog_server and replog_client binaries;
        /// defaults to the directory of this executable.
        #[arg(long)]
        bin_dir: Option<PathBuf>,
    },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ReplogError)` on any error.
    fn sanitize(&self) -> Result<(), ReplogError> {
        match &self.mode {
            Mode::Genconfig {
                base_port,
                loss_rate,
                ..
            } => {
                if *base_port <= 1024 {
                    Err(ReplogError::msg(format!(
                        "invalid base_port {}",
                        base_port
                    )))
                } else if !(0.0..=1.0).contains(loss_rate) {
                    Err(ReplogError::msg(format!(
                        "invalid loss_rate {}",
                        loss_rate
                    )))
                } else {
                    Ok(())
                }
            }
            Mode::Run {
                duration_s, kill, ..
            } => {
                if *duration_s == 0 {
                    Err(ReplogError::msg("invalid duration_s 0"))
                } else if let Some(k) =
                    kill.iter().find(|k| k.after_s >= *duration_s as f64)
                {
                    Err(ReplogError::msg(format!(
                        "kill of replica {} at {}s is past the end",
                        k.replica, k.after_s
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Writes a generated localhost cluster config.
async fn genconfig(
    config: &ClusterConfig,
    output: &Path,
) -> Result<(), ReplogError> {
    config.validate()?;
    tokio::fs::write(output, config.to_toml_string()?).await?;
    pf_info!(
        "wrote config of {} replicas {} clients to '{}'",
        config.population(),
        config.clients.len(),
        output.display()
    );
    Ok(())
}

/// Spawns one child process of a replog binary.
fn spawn_child(
    bin_dir: &Path,
    bin: &str,
    config: &Path,
    id: u64,
) -> Result<Child, ReplogError> {
    let child = Command::new(bin_dir.join(bin))
        .arg("--config")
        .arg(config)
        .arg("--id")
        .arg(id.to_string())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Runs one experiment. Returns true if all commit logs agree.
async fn run_experiment(
    config_path: &Path,
    duration: Duration,
    mut kills: Vec<KillAt>,
    bin_dir: &Path,
    mut rx_term: watch::Receiver<bool>,
) -> Result<bool, ReplogError> {
    let config = ClusterConfig::from_file(config_path).await?;
    tokio::fs::create_dir_all(&config.log_dir).await?;
    for id in 0..config.population() {
        let _ = tokio::fs::remove_file(config.log_path(id)).await;
    }

    let start = Instant::now();
    let mut replicas = vec![];
    for id in 0..config.population() {
        replicas.push(Some(spawn_child(
            bin_dir,
            "replog_server",
            config_path,
            id as u64,
        )?));
    }
    pf_info!("launched {} replicas", replicas.len());

    time::sleep(Duration::from_secs(1)).await;
    let mut clients = vec![];
    for id in 0..config.clients.len() {
        clients.push(spawn_child(bin_dir, "replog_client", config_path, id as u64)?);
    }
    pf_info!("launched {} clients", clients.len());

    kills.sort_by(|a, b| a.after_s.total_cmp(&b.after_s));
    let mut kills = kills.into_iter().peekable();
    let end = start + duration;
    loop {
        let next_kill = kills
            .peek()
            .map(|k| start + Duration::from_secs_f64(k.after_s));
        let wake = next_kill.map_or(end, |t| t.min(end));

        tokio::select! {
            _ = time::sleep_until(wake) => {
                if wake >= end {
                    break;
                }
                if let Some(k) = kills.next() {
                    match replicas.get_mut(k.replica as usize).and_then(Option::take) {
                        Some(mut child) => {
                            pf_warn!("killing replica {} at {:.1}s", k.replica, k.after_s);
                            child.kill().await?;
                        }
                        None => pf_warn!("replica {} not running", k.replica),
                    }
                }
            },
            _ = rx_term.changed() => {
                pf_warn!("manager caught termination signal");
                break;
            }
        }
    }

    for mut child in clients.into_iter().chain(replicas.into_iter().flatten()) {
        let _ = child.kill().await;
    }
    pf_info!("stopped all processes after {:?}", start.elapsed());

    let mut logs = vec![];
    for id in 0..config.population() {
        let lines = read_lines(&config.log_path(id)).await?;
        pf_info!("replica {} committed {} lines", id, lines.len());
        logs.push(lines);
    }
    Ok(logs_agree(&logs))
}

/// Actual main function of replog manager.
fn manager_main() -> Result<bool, ReplogError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    me_init("m");

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    let agreed = {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name("tokio-worker-manager")
            .build()?;

        runtime.block_on(async move {
            match args.mode {
                Mode::Genconfig {
                    f,
                    clients,
                    base_port,
                    loss_rate,
                    skip_slot,
                    output,
                } => {
                    let mut config = ClusterConfig::localhost(f, clients, base_port)?;
                    config.loss_rate = loss_rate;
                    config.skip_slot = skip_slot;
                    genconfig(&config, &output).await?;
                    Ok::<bool, ReplogError>(true)
                }
                Mode::Run {
                    config,
                    duration_s,
                    kill,
                    bin_dir,
                } => {
                    let bin_dir = match bin_dir {
                        Some(dir) => dir,
                        None => std::env::current_exe()?
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_default(),
                    };
                    let agreed = run_experiment(
                        &config,
                        Duration::from_secs(duration_s),
                        kill,
                        &bin_dir,
                        rx_term,
                    )
                    .await?;
                    if agreed {
                        pf_info!("commit logs agree");
                    } else {
                        pf_error!("commit logs DISAGREE");
                    }
                    log::set_max_level(LevelFilter::Off);
                    Ok(agreed)
                }
            }
        })?
    };

    log::set_max_level(log_level);
    Ok(agreed)
}

/// Main function of replog manager.
fn main() -> ExitCode {
    logger_init();

    match manager_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(ref e) => {
            pf_error!("manager_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn run_args(duration_s: u64, kill: Vec<KillAt>) -> CliArgs {
        CliArgs {
            mode: Mode::Run {
                config: "cluster.toml".into(),
                duration_s,
                kill,
                bin_dir: None,
            },
        }
    }

    #[test]
    fn parse_kill_schedule() -> Result<(), ReplogError> {
        assert_eq!(
            "0@2".parse::<KillAt>()?,
            KillAt {
                replica: 0,
                after_s: 2.0
            }
        );
        assert_eq!("2@7.5".parse::<KillAt>()?.after_s, 7.5);
        assert!("2".parse::<KillAt>().is_err());
        assert!("x@1".parse::<KillAt>().is_err());
        assert!("1@-3".parse::<KillAt>().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_run() {
        assert!(run_args(40, vec![KillAt { replica: 0, after_s: 2.0 }])
            .sanitize()
            .is_ok());
        assert!(run_args(0, vec![]).sanitize().is_err());
        assert!(run_args(10, vec![KillAt { replica: 1, after_s: 10.0 }])
            .sanitize()
            .is_err());
    }

    #[test]
    fn sanitize_genconfig() {
        let args = |base_port, loss_rate| CliArgs {
            mode: Mode::Genconfig {
                f: 1,
                clients: 1,
                base_port,
                loss_rate,
                skip_slot: false,
                output: "cluster.toml".into(),
            },
        };
        assert!(args(54550, 0.1).sanitize().is_ok());
        assert!(args(80, 0.1).sanitize().is_err());
        assert!(args(54550, 1.5).sanitize().is_err());
    }
}
