//! One helper run: configure the orchestrator and apply the staged archive.

use std::process::ExitCode;

use anyhow::{Result, bail, ensure};
use swapkit_updater::lock::AlwaysRetry;
use swapkit_updater::{
    ArtifactDescriptor, ArtifactKind, CancellationToken, StopPolicy, UpdateEvent,
    UpdateOrchestrator, UpdateOutcome, UpdaterConfig,
};
use tracing::{debug, info};

use crate::cli::{Cli, Job};
use crate::prompt::{ConsolePrompt, is_interactive};

/// Updater configuration for `job` with the CLI's options applied.
pub fn config_for(job: &Job, cli: &Cli) -> UpdaterConfig {
    UpdaterConfig::new(&job.destination, &job.executable)
        .with_relaunch_args(job.caller_args.iter().cloned())
        .with_elevate(cli.elevate)
        .with_stop_policy(StopPolicy::default().with_timeout(cli.stop_timeout()))
}

/// Orchestrator with the system collaborators and a prompt fit for the session.
pub fn orchestrator_for(job: &Job, cli: &Cli) -> UpdateOrchestrator {
    let orchestrator = UpdateOrchestrator::new(config_for(job, cli));
    if is_interactive(cli.unattended) {
        orchestrator.with_prompt(ConsolePrompt)
    } else {
        orchestrator.with_prompt(AlwaysRetry)
    }
}

/// Stops the application, extracts the archive and relaunches.
///
/// Errors are returned only for jobs that cannot start at all; everything
/// after that is reported through the outcome.
pub fn apply(
    job: &Job,
    orchestrator: UpdateOrchestrator,
    cancel: &CancellationToken,
) -> Result<UpdateOutcome> {
    ensure!(
        job.archive.is_file(),
        "archive not found: {}",
        job.archive.display()
    );
    let ArtifactKind::Archive(format) = ArtifactKind::from_path(&job.archive) else {
        bail!("not a supported archive: {}", job.archive.display());
    };

    info!(
        "Applying {} archive {} to {}",
        format,
        job.archive.display(),
        job.destination.display()
    );
    let artifact = ArtifactDescriptor {
        local_path: job.archive.clone(),
        expected_checksum: None,
        original_download_url: None,
    };
    let sink = |event: UpdateEvent| {
        if let UpdateEvent::State(state) = event {
            debug!("State: {:?}", state);
        }
    };

    Ok(orchestrator.run_staged(artifact, &sink, cancel))
}

/// Process exit code for an outcome. Cancelling is not a failure.
pub fn exit_code(outcome: &UpdateOutcome) -> ExitCode {
    match outcome {
        UpdateOutcome::Succeeded | UpdateOutcome::CancelledByUser => ExitCode::SUCCESS,
        UpdateOutcome::Failed { .. } => ExitCode::FAILURE,
    }
}
