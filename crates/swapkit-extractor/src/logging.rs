//! Logging for the extractor helper.
//!
//! Every formatted line goes to stderr and into an in-memory buffer. The
//! buffer is appended to the log file once, when the helper exits, so a run
//! that is killed halfway leaves the previous log intact.
//!
//! # Log Levels
//!
//! - `error`: the update failed
//! - `warn`: best-effort steps that did not work out, locked files
//! - `info`: stage transitions, one line per extracted entry
//! - `debug`: retries, file sizes, process ids

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log file name, placed next to the helper binary.
pub const LOG_FILE_NAME: &str = "swapkit-extractor.log";

/// Configuration for logging behavior.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level_filter: LevelFilter,
    /// Whether `RUST_LOG` may override `level_filter`.
    pub use_env_filter: bool,
    /// Whether lines are mirrored to stderr.
    pub mirror_to_stderr: bool,
    /// File the run log is appended to.
    pub log_file: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level_filter: LevelFilter::INFO,
            use_env_filter: true,
            mirror_to_stderr: true,
            log_file: default_log_file(),
        }
    }
}

impl LogConfig {
    /// Set the level filter.
    #[must_use]
    pub fn with_level_filter(mut self, level_filter: LevelFilter) -> Self {
        self.level_filter = level_filter;
        self
    }

    /// Allow or forbid `RUST_LOG` overrides.
    #[must_use]
    pub fn with_env_filter(mut self, enable: bool) -> Self {
        self.use_env_filter = enable;
        self
    }

    /// Set the log file, keeping the default when `None`.
    #[must_use]
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.log_file = path;
        }
        self
    }
}

/// `<helper dir>/swapkit-extractor.log`, or the temp directory if the
/// helper's own path is unknown.
pub fn default_log_file() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join(LOG_FILE_NAME)
}

/// Lines logged during this run, shared with the subscriber.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<u8>>>,
    mirror_to_stderr: bool,
}

impl LogBuffer {
    /// Create an empty buffer.
    pub fn new(mirror_to_stderr: bool) -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            mirror_to_stderr,
        }
    }

    /// Copy of everything logged so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Appends the run to `path`: a header, the arguments, then every line.
    pub fn append_to(&self, path: &Path, started: DateTime<Local>, args: &[String]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(
            file,
            "=== swapkit-extractor {} started {} ===",
            env!("CARGO_PKG_VERSION"),
            started.format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        for (index, arg) in args.iter().enumerate() {
            writeln!(file, "[{index}] {arg}")?;
        }
        file.write_all(&self.contents())?;
        writeln!(
            file,
            "=== finished {} ===",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;
        file.flush()
    }
}

/// Writer handed out per event by [`LogBuffer`].
pub struct LogBufferGuard {
    lines: Arc<Mutex<Vec<u8>>>,
    mirror_to_stderr: bool,
}

impl Write for LogBufferGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mirror_to_stderr {
            // stderr failures must not lose the buffered copy.
            let _ = io::stderr().write_all(buf);
        }
        let mut guard = self
            .lines
            .lock()
            .map_err(|_| io::Error::other("log buffer lock poisoned"))?;
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.mirror_to_stderr {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferGuard {
            lines: Arc::clone(&self.lines),
            mirror_to_stderr: self.mirror_to_stderr,
        }
    }
}

/// Initialize the global tracing subscriber and return the run's buffer.
///
/// This should be called once at startup.
pub fn init_logging(config: &LogConfig) -> LogBuffer {
    let buffer = LogBuffer::new(config.mirror_to_stderr);
    init_logging_with_writer(config, buffer.clone());
    buffer
}

/// Initialize logging with a custom writer (useful for testing).
pub fn init_logging_with_writer<W>(config: &LogConfig, writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = build_env_filter(config.level_filter, config.use_env_filter);
    // The same bytes end up in a plain-text file, so no colors.
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();
}

/// Build an `EnvFilter` from the given level, respecting `RUST_LOG` when allowed.
fn build_env_filter(level: LevelFilter, use_env: bool) -> EnvFilter {
    let default_filter = || {
        let level = level.to_string().to_lowercase();
        EnvFilter::new(format!(
            "warn,swapkit_updater={level},swapkit_extractor={level}"
        ))
    };

    if use_env {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter())
    } else {
        default_filter()
    }
}
