//! Applying a downloaded update to an installed desktop application.
//!
//! This crate takes over once the update has been downloaded: it verifies
//! the artifact, stops the running application, replaces the installed files
//! and starts the new version with the original arguments.
//!
//! # Overview
//!
//! - Checksum verification (MD5, SHA-1, SHA-2 family; SHA-256 by default)
//! - Graceful-then-forced termination of processes running the target executable
//! - ZIP and tar.gz extraction with retry on locked files
//! - Lock-holder diagnosis (Restart Manager, `/proc`, `lsof`)
//! - Relaunch, with elevation where the platform offers it
//!
//! The HTTP transfer is not part of this crate. The host's downloader hands
//! over a [`CompletedDownload`] and the [`UpdateOrchestrator`] does the rest.
//!
//! # Architecture
//!
//! Each stage is usable on its own:
//!
//! - [`checksum::verify`] - streamed digest check
//! - [`process::stop_and_wait`] - best-effort termination sweep
//! - [`ArchiveExtractor::extract`] - per-entry delete-then-write with retries
//! - [`SystemLauncher`] - detached process start
//!
//! [`UpdateOrchestrator`] sequences them on one worker thread and reports
//! [`UpdateEvent`]s. A host that cannot overwrite its own files starts the
//! `swapkit-extractor` helper instead, using [`HandoffCommand`].
//!
//! # Example
//!
//! ```no_run
//! use swapkit_updater::{CompletedDownload, UpdateEvent, UpdateOrchestrator, UpdaterConfig};
//!
//! let config = UpdaterConfig::new("/opt/app", "/opt/app/app")
//!     .with_relaunch_args(swapkit_updater::handoff::current_process_args());
//! let download = CompletedDownload::new("/tmp/download.part")
//!     .with_response_url("https://example.com/releases/app-2.0.zip");
//!
//! let handle = UpdateOrchestrator::new(config).spawn(download)?;
//! for event in handle.events() {
//!     if let UpdateEvent::Extraction(progress) = event {
//!         println!("{}% {}", progress.percentage(), progress.current_entry_name);
//!     }
//! }
//! println!("{}", handle.join().user_summary());
//! # Ok::<(), std::io::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod cancel;
pub mod config;
pub mod error;

// Pipeline stages
pub mod artifact;
pub mod checksum;
pub mod extract;
pub mod launch;
pub mod lock;
pub mod process;

// Sequencing
pub mod handoff;
pub mod orchestrator;

// Re-export main types for convenience
pub use artifact::{ArtifactDescriptor, ArtifactKind, CompletedDownload, format_bytes};
pub use cancel::CancellationToken;
pub use checksum::{ExpectedChecksum, HashAlgorithm};
pub use config::UpdaterConfig;
pub use error::{
    ChecksumError, DownloadError, ExtractionError, PlatformError, ProcessStopError, RelaunchError,
    UpdateError,
};
pub use extract::{
    ArchiveEntry, ArchiveExtractor, ArchiveFormat, ExtractStatus, ExtractionProgress,
    ProgressSink, RetryPolicy,
};
pub use handoff::HandoffCommand;
pub use launch::{LaunchRequest, LaunchStatus, Launcher, SystemLauncher};
pub use lock::{LockDecision, LockDiagnosis, LockPrompt, LockResolver, LockingProcess};
pub use orchestrator::{
    EventSink, UpdateEvent, UpdateHandle, UpdateOrchestrator, UpdateOutcome, UpdateState,
};
pub use process::{ProcessStopper, StopPolicy, StopReport};

/// Current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
