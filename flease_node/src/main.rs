//! Flease lease manager node over TCP.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use flease::{
    logger_init, pf_error, pf_info, pf_warn, CellId, FileEpochStore,
    FleaseConfig, FleaseError, FleaseStage, Lease, StatusListener,
    TcpCommunicator,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// TOML file with lease manager configuration; defaults if absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address for peer connections.
    #[arg(short, long)]
    bind: SocketAddr,

    /// Listen address of a peer acceptor (repeatable).
    #[arg(short, long)]
    peer: Vec<SocketAddr>,

    /// Cell to open (repeatable).
    #[arg(long)]
    cell: Vec<String>,

    /// Request master epochs for opened cells.
    #[arg(long, default_value_t = false)]
    master_epoch: bool,

    /// File backing the master-epoch store; required with `--master-epoch`.
    #[arg(long)]
    epoch_file: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(FleaseError)` on any error.
    fn sanitize(&self) -> Result<(), FleaseError> {
        if self.bind.port() <= 1024 {
            Err(FleaseError::msg(format!("invalid bind port {}", self.bind)))
        } else if self.peer.contains(&self.bind) {
            Err(FleaseError::msg(format!(
                "own address {} given as peer",
                self.bind
            )))
        } else if self.cell.iter().any(|c| c.is_empty()) {
            Err(FleaseError::msg("empty cell name"))
        } else if self.master_epoch && self.epoch_file.is_none() {
            Err(FleaseError::msg("--master-epoch needs an --epoch-file"))
        } else if self.threads < 2 {
            Err(FleaseError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    /// Loads the configuration file, if any. A node left with the default
    /// identity is named after its bind address.
    fn load_config(&self) -> Result<FleaseConfig, FleaseError> {
        let mut config = match &self.config {
            Some(path) => {
                let config_str = fs::read_to_string(path)?;
                FleaseConfig::from_toml(Some(&config_str))?
            }
            None => FleaseConfig::from_toml(None)?,
        };
        if config.identity == FleaseConfig::default().identity {
            config.identity = self.bind.to_string();
        }
        Ok(config)
    }
}

/// Status listener that only logs.
struct LoggingListener;

impl StatusListener for LoggingListener {
    fn status_changed(&self, cell: &CellId, lease: &Lease) {
        pf_info!("cell {} lease {}", cell, lease);
    }

    fn lease_failed(&self, cell: &CellId, error: &FleaseError) {
        pf_warn!("cell {} lease failed: {}", cell, error);
    }
}

/// Actual main function of a Flease node.
fn node_main() -> Result<(), FleaseError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = args.load_config()?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(|e| FleaseError::msg(format!("error setting handler: {}", e)))?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-flease")
            .build()?;

        // enter tokio runtime, set up transport and stage, open cells and
        // run until terminated
        runtime.block_on(async move {
            let comm =
                Arc::new(TcpCommunicator::new_and_setup(args.bind).await?);
            let mut stage = FleaseStage::new(
                config,
                comm.clone(),
                Arc::new(LoggingListener),
            )?;
            if let Some(path) = &args.epoch_file {
                let store = FileEpochStore::new_and_setup(path).await?;
                stage = stage.with_epoch_handler(Arc::new(store));
            }
            comm.start_receiving(stage.message_inlet())?;
            stage.start().await?;

            let cells = args.cell.iter().map(|c| CellId::from(c.as_str()));
            let futs = stage
                .batch_open_cells(
                    cells.collect(),
                    args.peer.clone(),
                    args.master_epoch,
                )
                .await;
            for fut in futs {
                tokio::spawn(async move {
                    match fut.wait().await {
                        Ok(lease) => pf_info!("cell opened with {}", lease),
                        Err(e) => pf_warn!("open cell failed: {}", e),
                    }
                });
            }

            let mut rx_state = stage.subscribe_state();
            loop {
                tokio::select! {
                    _ = rx_term.changed() => break,
                    _ = rx_state.changed() => {
                        let state = rx_state.borrow().clone();
                        if state.is_terminal() {
                            return Err(FleaseError::msg(format!(
                                "stage ended as {}",
                                state
                            )));
                        }
                    },
                }
            }

            stage.stop().await?;
            comm.shutdown();

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), FleaseError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Flease node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
