//! The update pipeline: verify, stop, extract, relaunch.
//!
//! ```text
//! AwaitingArtifact -> Verifying -> StoppingOldProcess -> Extracting -> Relaunching
//!                                                                       |
//!                                          Succeeded | Failed | Cancelled
//! ```
//!
//! [`UpdateOrchestrator::run`] consumes the orchestrator and returns one
//! [`UpdateOutcome`]; [`UpdateOrchestrator::spawn`] does the same on a
//! background thread and streams [`UpdateEvent`]s to the caller.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactDescriptor, ArtifactKind, CompletedDownload, stage_artifact};
use crate::cancel::CancellationToken;
use crate::checksum::verify_expected;
use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::extract::{ArchiveExtractor, ExtractStatus, ExtractionProgress, ProgressSink};
use crate::launch::{LaunchRequest, LaunchStatus, Launcher, SystemLauncher};
use crate::lock::{AlwaysRetry, LockPrompt, LockResolver, platform_resolver};
use crate::process::{ProcessStopper, SystemStopper};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Waiting for the downloader's result.
    AwaitingArtifact,
    /// Checking the artifact digest.
    Verifying,
    /// Stopping the running application.
    StoppingOldProcess,
    /// Writing files into the installation directory.
    Extracting,
    /// Starting the updated application or installer.
    Relaunching,
    /// Terminal: the update was applied.
    Succeeded,
    /// Terminal: the update failed.
    Failed,
    /// Terminal: the user cancelled.
    Cancelled,
}

impl UpdateState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AwaitingArtifact => "Waiting for download",
            Self::Verifying => "Verifying",
            Self::StoppingOldProcess => "Closing application",
            Self::Extracting => "Installing",
            Self::Relaunching => "Restarting",
            Self::Succeeded => "Complete",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Terminal value of one update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied and the application started.
    Succeeded,
    /// The user cancelled; not an error.
    CancelledByUser,
    /// The update stopped on an error.
    Failed {
        /// Stable error category.
        category: &'static str,
        /// Text for the user.
        message: String,
        /// Full error chain for logs.
        reason: String,
    },
}

impl UpdateOutcome {
    fn failed(error: &UpdateError) -> Self {
        Self::Failed {
            category: error.category(),
            message: error.user_message().to_string(),
            reason: error.to_string(),
        }
    }

    /// Whether the update was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// One line for the user. Cancellation never reads as a failure.
    #[must_use]
    pub fn user_summary(&self) -> String {
        match self {
            Self::Succeeded => "The update was installed.".to_string(),
            Self::CancelledByUser => "The update was cancelled.".to_string(),
            Self::Failed {
                category,
                message,
                reason,
            } => format!("{message} [{category}: {reason}]"),
        }
    }
}

/// Something the pipeline reports while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A stage was entered.
    State(UpdateState),
    /// Extraction progressed.
    Extraction(ExtractionProgress),
    /// A best-effort step had something worth showing.
    Notice(String),
}

/// Receives pipeline events.
pub trait EventSink {
    /// Called once per event, in order.
    fn on_event(&self, event: UpdateEvent);
}

impl<F> EventSink for F
where
    F: Fn(UpdateEvent),
{
    fn on_event(&self, event: UpdateEvent) {
        self(event);
    }
}

impl EventSink for Sender<UpdateEvent> {
    fn on_event(&self, event: UpdateEvent) {
        let _ = self.send(event);
    }
}

/// Forwards extraction progress into the pipeline's event stream.
struct ExtractionEvents<'a>(&'a dyn EventSink);

impl ProgressSink for ExtractionEvents<'_> {
    fn report(&self, progress: &ExtractionProgress) {
        self.0.on_event(UpdateEvent::Extraction(progress.clone()));
    }
}

/// Runs the update pipeline for one artifact.
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    resolver: Box<dyn LockResolver>,
    prompt: Box<dyn LockPrompt>,
    launcher: Box<dyn Launcher>,
    stopper: Box<dyn ProcessStopper>,
}

impl UpdateOrchestrator {
    /// Orchestrator with the platform's collaborators.
    #[must_use]
    pub fn new(config: UpdaterConfig) -> Self {
        Self {
            config,
            resolver: platform_resolver(),
            prompt: Box::new(AlwaysRetry),
            launcher: Box::new(SystemLauncher),
            stopper: Box::new(SystemStopper),
        }
    }

    /// Set the lock-holder resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl LockResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Set the retry/abort decision point for locked files.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl LockPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Set the process launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    /// Set the process stopper.
    #[must_use]
    pub fn with_stopper(mut self, stopper: impl ProcessStopper + 'static) -> Self {
        self.stopper = Box::new(stopper);
        self
    }

    /// The configuration this orchestrator applies.
    #[must_use]
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Runs the whole pipeline for a finished download.
    pub fn run(
        self,
        mut download: CompletedDownload,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        let mut run = Run::new(sink);
        run.enter(UpdateState::AwaitingArtifact);

        if download.cancelled {
            info!("Download was cancelled");
            return run.cancelled();
        }
        if let Some(err) = download.error.take() {
            return run.fail(&UpdateError::Download(err));
        }

        match stage_artifact(&download, &self.config.staging_dir()) {
            Ok(artifact) => self.apply(artifact, &mut run, cancel),
            Err(e) => run.fail(&e),
        }
    }

    /// Runs the pipeline for an artifact that is already staged.
    ///
    /// Verification is skipped when the artifact carries no checksum.
    pub fn run_staged(
        self,
        artifact: ArtifactDescriptor,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        let mut run = Run::new(sink);
        self.apply(artifact, &mut run, cancel)
    }

    /// Runs [`run`](Self::run) on a background thread.
    pub fn spawn(self, download: CompletedDownload) -> io::Result<UpdateHandle> {
        let (events_tx, events_rx) = mpsc::channel();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name("swapkit-update".to_string())
            .spawn(move || self.run(download, &events_tx, &worker_cancel))?;

        Ok(UpdateHandle {
            cancel,
            events: events_rx,
            worker,
        })
    }

    fn apply(
        self,
        artifact: ArtifactDescriptor,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        // Mandatory updates cannot be cancelled once they start.
        let ignored;
        let cancel = if self.config.mandatory {
            ignored = CancellationToken::new();
            &ignored
        } else {
            cancel
        };

        run.enter(UpdateState::Verifying);
        match &artifact.expected_checksum {
            Some(expected) => {
                if let Err(e) = verify_expected(&artifact.local_path, expected) {
                    return run.fail(&UpdateError::from(e));
                }
                info!("Checksum verified for {}", artifact.local_path.display());
            }
            None => run.notice("No checksum supplied; verification skipped"),
        }

        if cancel.is_cancelled() {
            discard(&artifact.local_path);
            return run.cancelled();
        }

        let kind = artifact.kind();
        let installer_args = self.config.installer_arguments();
        let request = match kind {
            ArtifactKind::Archive(format) => {
                debug!("Applying {} archive", format);
                return self.replace_installation(&artifact, run, cancel);
            }
            ArtifactKind::WindowsInstaller => {
                LaunchRequest::msiexec(&artifact.local_path, installer_args)
            }
            ArtifactKind::Executable => {
                LaunchRequest::new(&artifact.local_path).with_args(installer_args)
            }
        };

        run.enter(UpdateState::Relaunching);
        self.launch(&request.with_elevate(self.config.elevate), run)
    }

    fn replace_installation(
        &self,
        artifact: &ArtifactDescriptor,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        run.enter(UpdateState::StoppingOldProcess);
        let report = self
            .stopper
            .stop_and_wait(&self.config.executable, &self.config.stop);
        for failure in &report.failures {
            run.notice(&format!("Could not confirm the application stopped: {failure}"));
        }

        run.enter(UpdateState::Extracting);
        let extractor = ArchiveExtractor::new()
            .with_retry(self.config.retry)
            .with_resolver(self.resolver.as_ref())
            .with_prompt(self.prompt.as_ref());
        let progress = ExtractionEvents(run.sink);
        match extractor.extract(
            &artifact.local_path,
            &self.config.install_dir,
            &progress,
            cancel,
        ) {
            Ok(ExtractStatus::Completed { processed }) => {
                info!("Extracted {} entries", processed);
            }
            Ok(ExtractStatus::Cancelled { .. }) => return run.cancelled(),
            Err(e) => return run.fail(&UpdateError::from(e)),
        }

        run.enter(UpdateState::Relaunching);
        let request = LaunchRequest::new(&self.config.executable)
            .with_args(self.config.relaunch_args.iter().cloned())
            .with_elevate(self.config.elevate)
            .with_working_dir(&self.config.install_dir);
        self.launch(&request, run)
    }

    fn launch(&self, request: &LaunchRequest, run: &mut Run<'_>) -> UpdateOutcome {
        match self.launcher.launch(request) {
            Ok(LaunchStatus::Started { pid }) => {
                info!(
                    "Started {} (pid {})",
                    request.executable_path.display(),
                    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                );
                run.succeeded()
            }
            Ok(LaunchStatus::Declined) => {
                run.notice("Elevation was declined");
                run.cancelled()
            }
            Err(e) => run.fail(&UpdateError::from(e)),
        }
    }
}

/// Tracks the current stage and reports transitions.
struct Run<'a> {
    sink: &'a dyn EventSink,
    state: Option<UpdateState>,
}

impl<'a> Run<'a> {
    fn new(sink: &'a dyn EventSink) -> Self {
        Self { sink, state: None }
    }

    fn enter(&mut self, state: UpdateState) {
        debug_assert!(
            !self.state.is_some_and(|s| s.is_terminal()),
            "transition out of a terminal state"
        );
        info!("Update stage: {}", state);
        self.state = Some(state);
        self.sink.on_event(UpdateEvent::State(state));
    }

    fn notice(&self, message: &str) {
        warn!("{}", message);
        self.sink.on_event(UpdateEvent::Notice(message.to_string()));
    }

    fn succeeded(&mut self) -> UpdateOutcome {
        self.enter(UpdateState::Succeeded);
        UpdateOutcome::Succeeded
    }

    fn cancelled(&mut self) -> UpdateOutcome {
        info!("Update cancelled");
        self.enter(UpdateState::Cancelled);
        UpdateOutcome::CancelledByUser
    }

    fn fail(&mut self, err: &UpdateError) -> UpdateOutcome {
        error!("Update failed during {:?}: {}", self.state, err);
        self.enter(UpdateState::Failed);
        UpdateOutcome::failed(err)
    }
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Discarded {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// Handle on a pipeline running in the background.
pub struct UpdateHandle {
    cancel: CancellationToken,
    events: Receiver<UpdateEvent>,
    worker: JoinHandle<UpdateOutcome>,
}

impl UpdateHandle {
    /// Requests cancellation; observed between stages and archive entries.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token sharing this run's cancellation flag.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Events in the order the pipeline produced them.
    #[must_use]
    pub fn events(&self) -> &Receiver<UpdateEvent> {
        &self.events
    }

    /// Whether the worker has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the outcome.
    pub fn join(self) -> UpdateOutcome {
        self.worker.join().unwrap_or_else(|_| UpdateOutcome::Failed {
            category: "internal",
            message: "The updater stopped unexpectedly.".to_string(),
            reason: "update worker panicked".to_string(),
        })
    }
}
