//! Error types for the update-application pipeline.
//!
//! Each stage has its own error enum so callers can match on exactly the
//! failures that stage can produce. [`UpdateError`] wraps them all for the
//! orchestrator.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::lock::LockingProcess;

/// Failures while verifying a downloaded artifact.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChecksumError {
    /// Digest of the file differs from the expected one.
    #[error("checksum verification failed: expected {expected}, got {actual}")]
    Mismatch {
        /// Expected digest (lowercase hex).
        expected: String,
        /// Actual digest of the file (lowercase hex).
        actual: String,
    },

    /// The named digest algorithm is not implemented.
    #[error("hash algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),

    /// The expected digest is not a hex string of the algorithm's length.
    #[error("malformed {algorithm} digest: {digest:?}")]
    MalformedDigest {
        /// Algorithm the digest was supplied for.
        algorithm: &'static str,
        /// The digest as supplied.
        digest: String,
    },

    /// Reading the artifact failed.
    #[error("I/O error while hashing {path}: {source}")]
    Io {
        /// File being hashed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// A platform facility needed for diagnosis is unavailable or failed.
#[derive(Debug, Error)]
#[error("{operation} failed: {message}")]
pub struct PlatformError {
    /// What was being attempted.
    pub operation: &'static str,
    /// Platform-specific detail.
    pub message: String,
}

impl PlatformError {
    pub(crate) fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Failures while stopping the previous application instance.
///
/// These are never fatal to an update; the orchestrator logs them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessStopError {
    /// The termination request for a process was rejected.
    #[error("failed to terminate process {pid}")]
    TerminateFailed {
        /// Process id.
        pid: u32,
    },

    /// The process did not exit within the configured timeout.
    #[error("process {pid} still running after {waited_ms} ms")]
    Timeout {
        /// Process id.
        pid: u32,
        /// How long we waited.
        waited_ms: u128,
    },
}

/// Failures while extracting an archive into the installation directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtractionError {
    /// A destination file stayed locked past the retry budget, or the
    /// decision point chose to abort.
    #[error("file is locked by another process: {}", describe_lock(.path, .locking_processes))]
    LockedFile {
        /// Destination file that could not be replaced.
        path: PathBuf,
        /// Processes known to hold the file, when diagnosis succeeded.
        locking_processes: Option<Vec<LockingProcess>>,
    },

    /// An archive entry would resolve outside the destination directory.
    #[error("archive entry escapes the destination directory: {entry}")]
    PathTraversalRejected {
        /// Entry name as stored in the archive.
        entry: String,
    },

    /// The archive itself could not be read.
    #[error("archive error: {0}")]
    Archive(String),

    /// Any other I/O failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

fn describe_lock(path: &std::path::Path, processes: &Option<Vec<LockingProcess>>) -> String {
    match processes.as_deref() {
        Some(list) if !list.is_empty() => {
            let names: Vec<String> = list.iter().map(ToString::to_string).collect();
            format!("{} (held by {})", path.display(), names.join(", "))
        }
        _ => path.display().to_string(),
    }
}

impl From<zip::result::ZipError> for ExtractionError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

/// Failures while starting the updated application.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelaunchError {
    /// The OS refused to start the process.
    #[error("failed to launch {path}: {message}")]
    LaunchFailed {
        /// Executable that was being started.
        path: PathBuf,
        /// OS error text.
        message: String,
    },
}

/// Failure reported by the external downloader.
#[derive(Debug, Error)]
#[error("download failed: {0}")]
pub struct DownloadError(pub String);

/// Errors that end an update run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateError {
    /// The download did not complete.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Artifact verification failed.
    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    /// Extraction into the installation directory failed.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// The updated application could not be started.
    #[error(transparent)]
    Relaunch(#[from] RelaunchError),

    /// Staging the downloaded file failed.
    #[error("could not stage artifact {path}: {source}")]
    Staging {
        /// Path being moved or created.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    /// Short stable label for the error category, shown next to the message.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Download(_) => "download",
            Self::Checksum(_) => "checksum",
            Self::Extraction(_) => "extraction",
            Self::Relaunch(_) => "relaunch",
            Self::Staging { .. } => "staging",
        }
    }

    /// Returns a user-friendly error message suitable for display in the UI.
    #[must_use]
    pub fn user_message(&self) -> &str {
        match self {
            Self::Download(_) => "The update could not be downloaded.",
            Self::Checksum(ChecksumError::UnsupportedAlgorithm(_)) => {
                "The update uses an unsupported checksum algorithm."
            }
            Self::Checksum(ChecksumError::Io { .. }) => "The downloaded update could not be read.",
            Self::Checksum(_) => {
                "File integrity check failed. The download may be corrupt or tampered with."
            }
            Self::Extraction(ExtractionError::LockedFile { .. }) => {
                "A file of the application is still in use. Close it and try again."
            }
            Self::Extraction(ExtractionError::PathTraversalRejected { .. }) => {
                "The update package is unsafe and was rejected."
            }
            Self::Extraction(_) => "Could not extract the update package.",
            Self::Relaunch(_) => "The update was installed but the application could not be restarted.",
            Self::Staging { .. } => "Could not prepare the downloaded update.",
        }
    }
}
