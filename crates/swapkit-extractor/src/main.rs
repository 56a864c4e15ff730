//! Extractor helper for Swapkit updates.
//!
//! The host application stages the update archive, starts this helper and
//! exits. The helper then:
//! 1. Waits for every running instance of the executable to stop
//! 2. Extracts the archive into the installation directory, retrying locked files
//! 3. Deletes the archive
//! 4. Relaunches the executable with the host's original arguments
//!
//! The run log is appended to `swapkit-extractor.log` next to the helper
//! when the process exits.

use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use swapkit_extractor::cli::Cli;
use swapkit_extractor::logging::{LogConfig, init_logging};
use swapkit_extractor::run::{apply, exit_code, orchestrator_for};
use swapkit_updater::{CancellationToken, UpdateOutcome};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let started = Local::now();
    let args: Vec<String> = std::env::args().collect();
    let cli = Cli::parse();

    let log_config = LogConfig::default()
        .with_level_filter(cli.verbosity.tracing_level_filter())
        .with_env_filter(!cli.verbosity.is_present())
        .with_log_file(cli.log_file.clone());
    let log = init_logging(&log_config);

    let code = run(&cli);

    if let Err(e) = log.append_to(&log_config.log_file, started, &args) {
        eprintln!(
            "error: could not write log file {}: {e}",
            log_config.log_file.display()
        );
    }
    code
}

fn run(cli: &Cli) -> ExitCode {
    let Some(job) = cli.job() else {
        info!("Archive, destination and executable are required; nothing to do");
        return ExitCode::SUCCESS;
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!("Could not install the Ctrl-C handler: {}", e);
    }

    match apply(&job, orchestrator_for(&job, cli), &cancel) {
        Ok(outcome) => {
            if matches!(outcome, UpdateOutcome::Failed { .. }) {
                error!("{}", outcome.user_summary());
            } else {
                info!("{}", outcome.user_summary());
            }
            exit_code(&outcome)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
