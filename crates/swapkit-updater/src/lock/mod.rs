//! Lock-holder diagnosis.
//!
//! When a destination file cannot be replaced because another process has
//! it open, the extractor asks a [`LockResolver`] who that is, then hands the
//! answer to a [`LockPrompt`] that decides whether to retry or abort.
//!
//! Diagnosis is best effort: a resolver that fails or has no implementation
//! for the current OS only makes the message less specific.
//!
//! - **Windows**: Restart Manager session over the locked path
//! - **Linux**: scan of `/proc/<pid>/fd`
//! - **macOS**: `lsof`

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

/// A process holding an open handle on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingProcess {
    /// Process id.
    pub pid: u32,
    /// Executable or application name.
    pub name: String,
}

impl fmt::Display for LockingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

/// Who holds a given file, computed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDiagnosis {
    /// The locked file.
    pub file_path: PathBuf,
    /// Holders in enumeration order; empty when unknown.
    pub locking_processes: Vec<LockingProcess>,
}

impl LockDiagnosis {
    /// A diagnosis that names nobody.
    #[must_use]
    pub fn unknown(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            locking_processes: Vec::new(),
        }
    }

    /// Whether any holder was identified.
    #[must_use]
    pub fn is_known(&self) -> bool {
        !self.locking_processes.is_empty()
    }
}

/// Identifies which processes hold a lock on a path.
pub trait LockResolver: Send + Sync {
    /// Processes with an open handle on `path`, one entry per pid.
    fn who_is_locking(&self, path: &Path) -> Result<Vec<LockingProcess>, PlatformError>;
}

/// Resolver for platforms without a diagnosis facility.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl LockResolver for NoopResolver {
    fn who_is_locking(&self, _path: &Path) -> Result<Vec<LockingProcess>, PlatformError> {
        Ok(Vec::new())
    }
}

/// Returns the resolver for the current OS.
#[must_use]
pub fn platform_resolver() -> Box<dyn LockResolver> {
    #[cfg(windows)]
    {
        Box::new(windows::RestartManagerResolver)
    }
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::ProcFdResolver::default())
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::LsofResolver)
    }
    #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
    {
        Box::new(NoopResolver)
    }
}

/// Runs a resolver and never fails: errors degrade to an empty diagnosis.
pub fn diagnose(resolver: &dyn LockResolver, path: &Path) -> LockDiagnosis {
    match resolver.who_is_locking(path) {
        Ok(mut processes) => {
            processes.sort_by_key(|p| p.pid);
            processes.dedup_by_key(|p| p.pid);
            LockDiagnosis {
                file_path: path.to_path_buf(),
                locking_processes: processes,
            }
        }
        Err(e) => {
            tracing::warn!("Lock diagnosis for {} failed: {}", path.display(), e);
            LockDiagnosis::unknown(path)
        }
    }
}

/// Answer from the retry/abort decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// Try the write again.
    Retry,
    /// Give up on the whole extraction.
    Abort,
}

/// External decision point consulted when a lock holder has been identified.
pub trait LockPrompt: Send + Sync {
    /// Decide what to do about one identified holder of `diagnosis.file_path`.
    fn on_locked(&self, diagnosis: &LockDiagnosis, holder: &LockingProcess) -> LockDecision;
}

/// Prompt that always retries, for unattended runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl LockPrompt for AlwaysRetry {
    fn on_locked(&self, _diagnosis: &LockDiagnosis, _holder: &LockingProcess) -> LockDecision {
        LockDecision::Retry
    }
}

impl<F> LockPrompt for F
where
    F: Fn(&LockDiagnosis, &LockingProcess) -> LockDecision + Send + Sync,
{
    fn on_locked(&self, diagnosis: &LockDiagnosis, holder: &LockingProcess) -> LockDecision {
        self(diagnosis, holder)
    }
}
