//! Command line handed to the `swapkit-extractor` helper.
//!
//! A running application cannot overwrite its own files on every platform,
//! so the host stages the archive and starts the helper, which stops the
//! host, extracts and relaunches it:
//!
//! ```text
//! swapkit-extractor [--elevate] [--stop-timeout SECS] ARCHIVE DESTINATION EXECUTABLE [-- CALLER_ARGS...]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::UpdaterConfig;
use crate::launch::LaunchRequest;

/// Arguments the current process was started with, without the program name.
#[must_use]
pub fn current_process_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

/// Everything the helper needs to finish an update on the host's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffCommand {
    /// Path of the helper binary.
    pub helper_path: PathBuf,
    /// Staged archive.
    pub archive_path: PathBuf,
    /// Installation directory.
    pub destination_dir: PathBuf,
    /// Host executable to stop and relaunch.
    pub executable_path: PathBuf,
    /// Arguments for the relaunched host.
    pub caller_args: Vec<String>,
    /// Relaunch elevated.
    pub elevate: bool,
    /// Bound on the wait for the host to exit.
    pub stop_timeout: Option<Duration>,
}

impl HandoffCommand {
    /// Builds the hand-off for `archive` from the host's configuration.
    #[must_use]
    pub fn from_config(helper: &Path, archive: &Path, config: &UpdaterConfig) -> Self {
        Self {
            helper_path: helper.to_path_buf(),
            archive_path: archive.to_path_buf(),
            destination_dir: config.install_dir.clone(),
            executable_path: config.executable.clone(),
            caller_args: config.relaunch_args.clone(),
            elevate: config.elevate,
            stop_timeout: config.stop.timeout,
        }
    }

    /// Helper arguments, options first, caller arguments after `--`.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.caller_args.len() + 7);
        if self.elevate {
            args.push("--elevate".to_string());
        }
        if let Some(timeout) = self.stop_timeout {
            args.push("--stop-timeout".to_string());
            args.push(timeout.as_secs().max(1).to_string());
        }
        for path in [&self.archive_path, &self.destination_dir, &self.executable_path] {
            args.push(path.to_string_lossy().into_owned());
        }
        if !self.caller_args.is_empty() {
            args.push("--".to_string());
            args.extend(self.caller_args.iter().cloned());
        }
        args
    }

    /// Request that starts the helper.
    ///
    /// The helper itself is elevated when the host asked for elevation, as
    /// it writes into the installation directory.
    #[must_use]
    pub fn to_launch_request(&self) -> LaunchRequest {
        LaunchRequest::new(&self.helper_path)
            .with_args(self.to_args())
            .with_elevate(self.elevate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UpdaterConfig {
        UpdaterConfig::new("/opt/app", "/opt/app/app").with_relaunch_args(["--open", "-x", "a b"])
    }

    #[test]
    fn test_args_layout() {
        let command = HandoffCommand::from_config(
            Path::new("/opt/app/swapkit-extractor"),
            Path::new("/tmp/app.zip"),
            &config(),
        );
        assert_eq!(
            command.to_args(),
            vec![
                "/tmp/app.zip",
                "/opt/app",
                "/opt/app/app",
                "--",
                "--open",
                "-x",
                "a b"
            ]
        );
    }

    #[test]
    fn test_options_precede_positionals() {
        let mut config = config().with_elevate(true).with_relaunch_args(Vec::<String>::new());
        config.stop.timeout = Some(Duration::from_millis(2500));
        let command =
            HandoffCommand::from_config(Path::new("helper"), Path::new("a.zip"), &config);

        assert_eq!(
            command.to_args(),
            vec!["--elevate", "--stop-timeout", "2", "a.zip", "/opt/app", "/opt/app/app"]
        );
        let request = command.to_launch_request();
        assert!(request.elevate);
        assert_eq!(request.executable_path, Path::new("helper"));
    }
}
