//! Archive extraction into a live installation directory.
//!
//! Entries are written one file at a time in index order. An existing file
//! is deleted and then rewritten; there is no merge. When the OS reports a
//! sharing or lock violation the write is retried a bounded number of times,
//! consulting a [`LockResolver`] and a [`LockPrompt`] before later retries.
//!
//! The source archive is deleted when extraction ends, whatever the result.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, MAIN_SEPARATOR_STR, Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::ExtractionError;
use crate::lock::{
    AlwaysRetry, LockDecision, LockPrompt, LockResolver, LockingProcess, NoopResolver, diagnose,
};
use crate::process::duration_millis;

/// Archive container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// ZIP archive.
    Zip,
    /// gzip-compressed tar archive.
    TarGz,
}

impl ArchiveFormat {
    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Zip => "ZIP",
            Self::TarGz => "tar.gz",
        }
    }

    /// Detects the format from a file name.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let name_lower = name.to_lowercase();
        if name_lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if name_lower.ends_with(".tar.gz") || name_lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    /// Detects the format from the file name, falling back to magic bytes.
    pub fn detect(path: &Path) -> io::Result<Self> {
        if let Some(format) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_file_name)
        {
            return Ok(format);
        }

        let mut magic = [0u8; 4];
        let read = File::open(path)?.read(&mut magic)?;
        match &magic[..read] {
            [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => Ok(Self::Zip),
            [0x1f, 0x8b, ..] => Ok(Self::TarGz),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognised archive format: {}", path.display()),
            )),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One item of the archive's entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive, as stored.
    pub relative_path: String,
    /// Uncompressed size.
    pub size_bytes: u64,
    /// Position among the entries that are extracted.
    pub index: usize,
    /// Directory entries are created, not written.
    pub is_dir: bool,
    /// Unix permission bits, when the archive records them.
    pub unix_mode: Option<u32>,
}

/// Whether a progress event announces or completes an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Sent before the entry is written.
    Starting,
    /// Sent after the entry was written.
    Finished,
}

/// Progress of one extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionProgress {
    /// Entries completed so far.
    pub processed_count: usize,
    /// Entries in the archive.
    pub total_count: usize,
    /// Entry being worked on.
    pub current_entry_name: String,
    /// Announcement or completion.
    pub phase: EntryPhase,
}

impl ExtractionProgress {
    /// Returns the progress as a percentage (0 to 100).
    #[must_use]
    pub fn percentage(&self) -> u8 {
        if self.total_count == 0 {
            return 100;
        }
        let pct = self.processed_count.saturating_mul(100) / self.total_count;
        pct.min(100) as u8
    }
}

/// Receives progress events. The core never depends on a UI type.
pub trait ProgressSink {
    /// Called once per event, in order.
    fn report(&self, progress: &ExtractionProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&ExtractionProgress),
{
    fn report(&self, progress: &ExtractionProgress) {
        self(progress);
    }
}

impl ProgressSink for Sender<ExtractionProgress> {
    fn report(&self, progress: &ExtractionProgress) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(progress.clone());
    }
}

/// Sink that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _progress: &ExtractionProgress) {}
}

/// Retry behaviour for sharing/lock violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before an automatic retry when no holder was identified.
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
    /// First retry (1-based) before which the lock holder is diagnosed.
    pub diagnose_from_retry: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_secs(5),
            diagnose_from_retry: 2,
        }
    }
}

impl RetryPolicy {
    /// Set the backoff delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// How extraction ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStatus {
    /// Every entry was written.
    Completed {
        /// Number of entries processed.
        processed: usize,
    },
    /// Cancellation was observed before entry `processed` started.
    Cancelled {
        /// Number of entries processed before stopping.
        processed: usize,
    },
}

/// Writes one destination file from an entry's bytes.
pub trait FileReplacer: Send + Sync {
    /// Replace `path` with the bytes of `contents`, returning bytes written.
    fn replace(&self, path: &Path, contents: &mut dyn Read) -> io::Result<u64>;
}

/// Deletes the existing file, then writes the new one in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReplacer;

impl FileReplacer for FsReplacer {
    fn replace(&self, path: &Path, contents: &mut dyn Read) -> io::Result<u64> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut file = File::create(path)?;
        let written = io::copy(contents, &mut file)?;
        file.sync_all()?;
        Ok(written)
    }
}

/// Windows error codes for a sharing and a lock violation.
#[cfg(windows)]
const WINDOWS_LOCK_ERRORS: [i32; 2] = [32, 33];

/// Whether an I/O error means another process holds the file.
#[must_use]
pub fn is_lock_violation(error: &io::Error) -> bool {
    #[cfg(windows)]
    if error
        .raw_os_error()
        .is_some_and(|code| WINDOWS_LOCK_ERRORS.contains(&code))
    {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::ExecutableFileBusy
    )
}

/// Returns `dir` with a guaranteed trailing separator.
#[must_use]
pub fn normalize_root(dir: &Path) -> PathBuf {
    let mut root: OsString = dir.as_os_str().to_owned();
    let text = dir.to_string_lossy();
    if !(text.ends_with('/') || text.ends_with(MAIN_SEPARATOR_STR)) {
        root.push(MAIN_SEPARATOR_STR);
    }
    PathBuf::from(root)
}

/// Resolves an entry name under `root`, rejecting anything that could escape it.
pub fn resolve_entry_path(root: &Path, name: &str) -> Result<PathBuf, ExtractionError> {
    let reject = || ExtractionError::PathTraversalRejected {
        entry: name.to_string(),
    };

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(reject());
    }

    let mut resolved = root.to_path_buf();
    for part in name.split(['/', '\\']) {
        if part.is_empty() {
            continue;
        }
        let mut components = Path::new(part).components();
        match (components.next(), components.next()) {
            (Some(Component::CurDir), None) => {}
            (Some(Component::Normal(segment)), None) => resolved.push(segment),
            _ => return Err(reject()),
        }
    }
    Ok(resolved)
}

/// Open archive, addressable by entry index.
enum ArchiveReader {
    /// `positions[i]` is the zip index of extracted entry `i`.
    Zip {
        archive: zip::ZipArchive<BufReader<File>>,
        positions: Vec<usize>,
    },
    /// tar has no central directory; file entries are spooled to disk once.
    TarGz(TarSpool),
}

/// Scratch directory holding one file per spooled tar entry.
struct TarSpool {
    dir: TempDir,
}

impl TarSpool {
    fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("swapkit-tar-").tempdir()?;
        Ok(Self { dir })
    }

    fn entry_path(&self, index: usize) -> PathBuf {
        self.dir.path().join(format!("{index}.entry"))
    }
}

impl ArchiveReader {
    fn open(path: &Path) -> Result<(Self, Vec<ArchiveEntry>), ExtractionError> {
        let io_err = |source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        };
        let format = ArchiveFormat::detect(path).map_err(io_err)?;
        debug!("Opening {} archive {}", format, path.display());
        let file = File::open(path).map_err(io_err)?;

        match format {
            ArchiveFormat::Zip => {
                let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
                let mut entries = Vec::with_capacity(archive.len());
                let mut positions = Vec::with_capacity(archive.len());
                for position in 0..archive.len() {
                    let entry = archive.by_index(position)?;
                    if entry.is_symlink() {
                        warn!("Skipping symbolic link {}", entry.name());
                        continue;
                    }
                    entries.push(ArchiveEntry {
                        relative_path: entry.name().to_string(),
                        size_bytes: entry.size(),
                        index: entries.len(),
                        is_dir: entry.is_dir(),
                        unix_mode: entry.unix_mode(),
                    });
                    positions.push(position);
                }
                Ok((Self::Zip { archive, positions }, entries))
            }
            ArchiveFormat::TarGz => {
                let spool = TarSpool::new().map_err(|source| ExtractionError::Io {
                    path: std::env::temp_dir(),
                    source,
                })?;
                let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
                let archive_err = |e: io::Error| ExtractionError::Archive(e.to_string());
                let mut entries = Vec::new();
                for entry in archive.entries().map_err(archive_err)? {
                    let mut entry = entry.map_err(archive_err)?;
                    let entry_type = entry.header().entry_type();
                    let name = entry.path().map_err(archive_err)?.to_string_lossy().into_owned();
                    if !(entry_type.is_file() || entry_type.is_dir()) {
                        warn!("Skipping unsupported tar entry {} ({:?})", name, entry_type);
                        continue;
                    }

                    let index = entries.len();
                    if entry_type.is_file() {
                        let spooled = spool.entry_path(index);
                        let mut out = File::create(&spooled).map_err(|source| {
                            ExtractionError::Io {
                                path: spooled.clone(),
                                source,
                            }
                        })?;
                        io::copy(&mut entry, &mut out).map_err(archive_err)?;
                    }
                    entries.push(ArchiveEntry {
                        relative_path: name,
                        size_bytes: entry.size(),
                        index,
                        is_dir: entry_type.is_dir(),
                        unix_mode: entry.header().mode().ok(),
                    });
                }
                Ok((Self::TarGz(spool), entries))
            }
        }
    }

    /// Hands a fresh reader over entry `index` to `f`.
    fn with_entry<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn Read) -> R,
    ) -> Result<R, ExtractionError> {
        match self {
            Self::Zip { archive, positions } => {
                let position = positions.get(index).copied().ok_or_else(|| {
                    ExtractionError::Archive(format!("no entry at index {index}"))
                })?;
                let mut entry = archive.by_index(position)?;
                Ok(f(&mut entry))
            }
            Self::TarGz(spool) => {
                let path = spool.entry_path(index);
                let file = File::open(&path).map_err(|source| ExtractionError::Io { path, source })?;
                Ok(f(&mut BufReader::new(file)))
            }
        }
    }
}

/// Streams archive entries into a destination directory.
pub struct ArchiveExtractor<'a> {
    retry: RetryPolicy,
    resolver: &'a dyn LockResolver,
    prompt: &'a dyn LockPrompt,
    replacer: &'a dyn FileReplacer,
}

impl Default for ArchiveExtractor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ArchiveExtractor<'a> {
    /// Extractor with the default retry policy, no diagnosis and in-place writes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::default(),
            resolver: &NoopResolver,
            prompt: &AlwaysRetry,
            replacer: &FsReplacer,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the lock-holder resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: &'a dyn LockResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Set the retry/abort decision point.
    #[must_use]
    pub fn with_prompt(mut self, prompt: &'a dyn LockPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Set how destination files are written.
    #[must_use]
    pub fn with_replacer(mut self, replacer: &'a dyn FileReplacer) -> Self {
        self.replacer = replacer;
        self
    }

    /// Extracts `archive_path` into `destination_dir`.
    ///
    /// The archive file is deleted afterwards on every path, including
    /// failure and cancellation.
    pub fn extract(
        &self,
        archive_path: &Path,
        destination_dir: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExtractStatus, ExtractionError> {
        let result = self.extract_entries(archive_path, destination_dir, sink, cancel);

        match fs::remove_file(archive_path) {
            Ok(()) => debug!("Deleted archive {}", archive_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete archive {}: {}", archive_path.display(), e),
        }

        result
    }

    fn extract_entries(
        &self,
        archive_path: &Path,
        destination_dir: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExtractStatus, ExtractionError> {
        let root = normalize_root(destination_dir);
        // The reader is dropped before the caller deletes the archive.
        let (mut reader, entries) = ArchiveReader::open(archive_path)?;
        let total_count = entries.len();
        info!(
            "Found total of {} files and folders inside {}",
            total_count,
            archive_path.display()
        );

        let targets = entries
            .iter()
            .map(|entry| {
                let target = resolve_entry_path(&root, &entry.relative_path)?;
                if !entry.is_dir && target == root {
                    return Err(ExtractionError::PathTraversalRejected {
                        entry: entry.relative_path.clone(),
                    });
                }
                Ok(target)
            })
            .collect::<Result<Vec<_>, _>>()?;

        fs::create_dir_all(&root).map_err(|source| ExtractionError::Io {
            path: root.clone(),
            source,
        })?;

        for (entry, target) in entries.iter().zip(&targets) {
            if cancel.is_cancelled() {
                info!("Extraction cancelled after {} entries", entry.index);
                return Ok(ExtractStatus::Cancelled {
                    processed: entry.index,
                });
            }

            let mut progress = ExtractionProgress {
                processed_count: entry.index,
                total_count,
                current_entry_name: entry.relative_path.clone(),
                phase: EntryPhase::Starting,
            };
            sink.report(&progress);

            if entry.is_dir {
                fs::create_dir_all(target).map_err(|source| ExtractionError::Io {
                    path: target.clone(),
                    source,
                })?;
            } else {
                self.write_with_retry(&mut reader, entry, target)?;
            }

            progress.processed_count = entry.index + 1;
            progress.phase = EntryPhase::Finished;
            sink.report(&progress);
            info!("Extracted {} [{}%]", entry.relative_path, progress.percentage());
        }

        Ok(ExtractStatus::Completed {
            processed: total_count,
        })
    }

    fn write_with_retry(
        &self,
        reader: &mut ArchiveReader,
        entry: &ArchiveEntry,
        target: &Path,
    ) -> Result<(), ExtractionError> {
        let mut retries: u32 = 0;
        let mut holders: Option<Vec<LockingProcess>> = None;

        loop {
            let attempt = reader.with_entry(entry.index, |contents| {
                self.replacer.replace(target, contents)
            })?;

            let error = match attempt {
                Ok(written) => {
                    debug!("Wrote {} ({} bytes)", target.display(), written);
                    apply_mode(target, entry.unix_mode);
                    return Ok(());
                }
                Err(e) if is_lock_violation(&e) => e,
                Err(source) => {
                    return Err(ExtractionError::Io {
                        path: target.to_path_buf(),
                        source,
                    });
                }
            };

            retries += 1;
            if retries > self.retry.max_retries {
                warn!("Giving up on locked file {}: {}", target.display(), error);
                return Err(ExtractionError::LockedFile {
                    path: target.to_path_buf(),
                    locking_processes: holders,
                });
            }

            let diagnosis = (retries >= self.retry.diagnose_from_retry)
                .then(|| diagnose(self.resolver, target))
                .filter(|d| d.is_known());

            match diagnosis {
                None => {
                    warn!(
                        "{} is locked ({}), retrying in {:?} ({}/{})",
                        target.display(),
                        error,
                        self.retry.backoff,
                        retries,
                        self.retry.max_retries
                    );
                    thread::sleep(self.retry.backoff);
                }
                Some(diagnosis) => {
                    for holder in &diagnosis.locking_processes {
                        warn!("{} is held by {}", target.display(), holder);
                        if self.prompt.on_locked(&diagnosis, holder) == LockDecision::Abort {
                            return Err(ExtractionError::LockedFile {
                                path: target.to_path_buf(),
                                locking_processes: Some(diagnosis.locking_processes),
                            });
                        }
                    }
                    holders = Some(diagnosis.locking_processes);
                    debug!(
                        "Retrying {} in {:?} ({}/{})",
                        target.display(),
                        self.retry.backoff,
                        retries,
                        self.retry.max_retries
                    );
                    thread::sleep(self.retry.backoff);
                }
            }
        }
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode.map(|m| m & 0o7777).filter(|m| *m != 0) {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("Could not set permissions on {}: {}", path.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use crate::error::PlatformError;
    use crate::lock::LockDiagnosis;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default().with_backoff(Duration::from_millis(1))
    }

    /// Fails with a lock violation for the first `failures` writes of `locked`.
    struct FlakyReplacer {
        locked: &'static str,
        failures: u32,
        attempts: AtomicU32,
    }

    impl FlakyReplacer {
        fn new(locked: &'static str, failures: u32) -> Self {
            Self {
                locked,
                failures,
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl FileReplacer for FlakyReplacer {
        fn replace(&self, path: &Path, contents: &mut dyn Read) -> io::Result<u64> {
            if path.ends_with(self.locked) {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    return Err(io::Error::from(io::ErrorKind::ResourceBusy));
                }
            }
            FsReplacer.replace(path, contents)
        }
    }

    struct FixedHolder;

    impl LockResolver for FixedHolder {
        fn who_is_locking(&self, _path: &Path) -> Result<Vec<LockingProcess>, PlatformError> {
            Ok(vec![LockingProcess {
                pid: 4242,
                name: "indexer".to_string(),
            }])
        }
    }

    #[test]
    fn test_normalize_root_adds_separator() {
        let root = normalize_root(Path::new("install"));
        assert!(root.to_string_lossy().ends_with(MAIN_SEPARATOR_STR));
        let again = normalize_root(&root);
        assert_eq!(again, root);
    }

    #[test]
    fn test_resolve_entry_path() {
        let root = normalize_root(Path::new("/opt/app"));
        assert_eq!(
            resolve_entry_path(&root, "bin/app").unwrap(),
            Path::new("/opt/app/bin/app")
        );
        assert_eq!(
            resolve_entry_path(&root, "./lib\\core.so").unwrap(),
            Path::new("/opt/app/lib/core.so")
        );
        for bad in ["../../evil.txt", "a/../../b", "/etc/passwd", "\\evil", "a/.."] {
            assert!(
                matches!(
                    resolve_entry_path(&root, bad),
                    Err(ExtractionError::PathTraversalRejected { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(
            ArchiveFormat::from_file_name("app-1.2.0.ZIP"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(
            ArchiveFormat::from_file_name("app.tgz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_file_name("setup.msi"), None);

        let dir = tempfile::tempdir().unwrap();
        let unnamed = dir.path().join("download.tmp");
        write_zip(&unnamed, &[("a.txt", b"a")]);
        assert_eq!(ArchiveFormat::detect(&unnamed).unwrap(), ArchiveFormat::Zip);
    }

    #[test]
    fn test_lock_violation_classification() {
        assert!(is_lock_violation(&io::Error::from(io::ErrorKind::ResourceBusy)));
        assert!(is_lock_violation(&io::Error::from(
            io::ErrorKind::ExecutableFileBusy
        )));
        assert!(!is_lock_violation(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_transient_lock_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        write_zip(&archive, &[("app.bin", b"new"), ("data.txt", b"data")]);

        let replacer = FlakyReplacer::new("app.bin", 2);
        let extractor = ArchiveExtractor::new()
            .with_retry(fast_retry())
            .with_replacer(&replacer);
        let status = extractor
            .extract(&archive, &dest, &NullSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(status, ExtractStatus::Completed { processed: 2 });
        assert_eq!(replacer.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(dest.join("app.bin")).unwrap(), b"new");
        assert!(!archive.exists());
    }

    #[test]
    fn test_persistent_lock_fails_and_still_deletes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        write_zip(&archive, &[("app.bin", b"new")]);

        let replacer = FlakyReplacer::new("app.bin", u32::MAX);
        let extractor = ArchiveExtractor::new()
            .with_retry(fast_retry())
            .with_replacer(&replacer);
        let result = extractor.extract(&archive, &dest, &NullSink, &CancellationToken::new());

        match result {
            Err(ExtractionError::LockedFile { path, .. }) => assert!(path.ends_with("app.bin")),
            other => panic!("expected LockedFile, got {other:?}"),
        }
        // First attempt plus two retries.
        assert_eq!(replacer.attempts.load(Ordering::SeqCst), 3);
        assert!(!archive.exists());
    }

    #[test]
    fn test_prompt_sees_holder_before_second_retry_and_can_abort() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        write_zip(&archive, &[("app.bin", b"new")]);

        let seen: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        let prompt = |_: &LockDiagnosis, holder: &LockingProcess| {
            seen.lock().unwrap().push(holder.pid);
            LockDecision::Abort
        };
        let replacer = FlakyReplacer::new("app.bin", u32::MAX);
        let extractor = ArchiveExtractor::new()
            .with_retry(fast_retry())
            .with_resolver(&FixedHolder)
            .with_prompt(&prompt)
            .with_replacer(&replacer);
        let result = extractor.extract(&archive, &dest, &NullSink, &CancellationToken::new());

        match result {
            Err(ExtractionError::LockedFile {
                locking_processes: Some(holders),
                ..
            }) => assert_eq!(holders[0].name, "indexer"),
            other => panic!("expected LockedFile with holders, got {other:?}"),
        }
        assert_eq!(*seen.lock().unwrap(), vec![4242]);
        // Diagnosis happens after the second failed attempt, not the first.
        assert_eq!(replacer.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_after_known_holder_still_waits() {
        struct Timed {
            attempts: Mutex<Vec<Instant>>,
        }
        impl FileReplacer for Timed {
            fn replace(&self, path: &Path, contents: &mut dyn Read) -> io::Result<u64> {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                if attempts.len() <= 2 {
                    return Err(io::Error::from(io::ErrorKind::ResourceBusy));
                }
                FsReplacer.replace(path, contents)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        write_zip(&archive, &[("app.bin", b"new")]);

        let backoff = Duration::from_millis(100);
        let replacer = Timed {
            attempts: Mutex::new(Vec::new()),
        };
        let extractor = ArchiveExtractor::new()
            .with_retry(RetryPolicy::default().with_backoff(backoff))
            .with_resolver(&FixedHolder)
            .with_prompt(&AlwaysRetry)
            .with_replacer(&replacer);
        let status = extractor
            .extract(&archive, &dest, &NullSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(status, ExtractStatus::Completed { processed: 1 });
        let attempts = replacer.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= backoff, "retried without waiting");
        }
    }

    #[test]
    fn test_zip_symlinks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");

        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("app.bin", options).unwrap();
        zip.write_all(b"binary").unwrap();
        zip.add_symlink("current", "app.bin", options).unwrap();
        zip.start_file("readme.txt", options).unwrap();
        zip.write_all(b"readme").unwrap();
        zip.finish().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let status = ArchiveExtractor::new()
            .extract(&archive, &dest, &tx, &CancellationToken::new())
            .unwrap();
        drop(tx);

        assert_eq!(status, ExtractStatus::Completed { processed: 2 });
        assert!(!dest.join("current").exists());
        assert_eq!(fs::read(dest.join("readme.txt")).unwrap(), b"readme");
        let names: Vec<String> = rx
            .iter()
            .filter(|p| p.phase == EntryPhase::Finished)
            .map(|p| p.current_entry_name)
            .collect();
        assert_eq!(names, vec!["app.bin", "readme.txt"]);
    }

    #[test]
    fn test_locked_tar_entry_is_read_again_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.tar.gz");
        let dest = dir.path().join("app");

        let encoder = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in [("app.bin", &b"new binary"[..]), ("lib.so", &b"library"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let replacer = FlakyReplacer::new("app.bin", 1);
        let status = ArchiveExtractor::new()
            .with_retry(fast_retry())
            .with_replacer(&replacer)
            .extract(&archive, &dest, &NullSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(status, ExtractStatus::Completed { processed: 2 });
        assert_eq!(replacer.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read(dest.join("app.bin")).unwrap(), b"new binary");
        assert_eq!(fs::read(dest.join("lib.so")).unwrap(), b"library");
    }

    #[test]
    fn test_other_io_errors_are_not_retried() {
        struct Denied(AtomicU32);
        impl FileReplacer for Denied {
            fn replace(&self, _path: &Path, _contents: &mut dyn Read) -> io::Result<u64> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        write_zip(&archive, &[("app.bin", b"new")]);

        let replacer = Denied(AtomicU32::new(0));
        let extractor = ArchiveExtractor::new()
            .with_retry(fast_retry())
            .with_replacer(&replacer);
        let result = extractor.extract(
            &archive,
            &dir.path().join("app"),
            &NullSink,
            &CancellationToken::new(),
        );

        assert!(matches!(result, Err(ExtractionError::Io { .. })));
        assert_eq!(replacer.0.load(Ordering::SeqCst), 1);
        assert!(!archive.exists());
    }

    #[test]
    fn test_existing_file_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("config.ini"), b"old contents that are longer").unwrap();
        write_zip(&archive, &[("config.ini", b"new")]);

        ArchiveExtractor::new()
            .extract(&archive, &dest, &NullSink, &CancellationToken::new())
            .unwrap();
        assert_eq!(fs::read(dest.join("config.ini")).unwrap(), b"new");
    }

    #[test]
    fn test_cancel_before_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        let dest = dir.path().join("app");
        write_zip(&archive, &[("a", b"a"), ("b", b"b")]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let status = ArchiveExtractor::new()
            .extract(&archive, &dest, &NullSink, &cancel)
            .unwrap();

        assert_eq!(status, ExtractStatus::Cancelled { processed: 0 });
        assert!(!dest.join("a").exists());
        assert!(!archive.exists());
    }

    #[test]
    fn test_channel_sink() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        write_zip(&archive, &[("only.txt", b"x")]);

        let (tx, rx) = std::sync::mpsc::channel();
        ArchiveExtractor::new()
            .extract(&archive, &dir.path().join("app"), &tx, &CancellationToken::new())
            .unwrap();
        drop(tx);

        let events: Vec<ExtractionProgress> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].percentage(), 100);
    }
}
