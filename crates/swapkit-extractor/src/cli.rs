//! CLI argument definitions for the extractor helper.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Debug, Parser)]
#[command(
    name = "swapkit-extractor",
    version,
    about = "Stop an application, extract its update and start it again",
    long_about = "Stop every running instance of EXECUTABLE, extract ARCHIVE into \
                  DESTINATION and relaunch EXECUTABLE with CALLER_ARGS.\n\n\
                  The archive is deleted when extraction ends. Run without the three \
                  paths, the helper exits without doing anything."
)]
pub struct Cli {
    /// Update archive (.zip, .tar.gz or .tgz).
    #[arg(value_name = "ARCHIVE")]
    pub archive: Option<PathBuf>,

    /// Installation directory the archive is extracted into.
    #[arg(value_name = "DESTINATION")]
    pub destination: Option<PathBuf>,

    /// Application executable to stop and relaunch.
    #[arg(value_name = "EXECUTABLE")]
    pub executable: Option<PathBuf>,

    /// Arguments for the relaunched application.
    #[arg(
        value_name = "CALLER_ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub caller_args: Vec<String>,

    /// Relaunch the application with elevated privileges.
    #[arg(long)]
    pub elevate: bool,

    /// Give up waiting for the application to exit after this many seconds.
    #[arg(long = "stop-timeout", value_name = "SECS")]
    pub stop_timeout: Option<u64>,

    /// Append the run log here instead of next to the helper.
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Never ask what to do about locked files; keep retrying.
    #[arg(long)]
    pub unattended: bool,

    /// Adjust log verbosity (-v for debug, -vv for trace, -q for warnings only).
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

/// The three required paths and the caller's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub archive: PathBuf,
    pub destination: PathBuf,
    pub executable: PathBuf,
    pub caller_args: Vec<String>,
}

impl Cli {
    /// The job to run, or `None` when a required path is missing.
    pub fn job(&self) -> Option<Job> {
        Some(Job {
            archive: self.archive.clone()?,
            destination: self.destination.clone()?,
            executable: self.executable.clone()?,
            caller_args: self.caller_args.clone(),
        })
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use swapkit_updater::{HandoffCommand, UpdaterConfig};

    #[test]
    fn test_missing_paths_is_no_job() {
        let cli = Cli::try_parse_from(["swapkit-extractor", "update.zip", "/opt/app"]).unwrap();
        assert!(cli.job().is_none());

        let cli = Cli::try_parse_from(["swapkit-extractor"]).unwrap();
        assert!(cli.job().is_none());
    }

    #[test]
    fn test_parses_handoff_command() {
        let mut config = UpdaterConfig::new("/opt/app", "/opt/app/app")
            .with_elevate(true)
            .with_relaunch_args(["--open", "-x", "a b"]);
        config.stop.timeout = Some(Duration::from_secs(30));
        let handoff = HandoffCommand::from_config(
            Path::new("/opt/app/swapkit-extractor"),
            Path::new("/tmp/app.zip"),
            &config,
        );

        let mut argv = vec!["swapkit-extractor".to_string()];
        argv.extend(handoff.to_args());
        let cli = Cli::try_parse_from(argv).unwrap();

        assert!(cli.elevate);
        assert_eq!(cli.stop_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            cli.job(),
            Some(Job {
                archive: PathBuf::from("/tmp/app.zip"),
                destination: PathBuf::from("/opt/app"),
                executable: PathBuf::from("/opt/app/app"),
                caller_args: vec!["--open".to_string(), "-x".to_string(), "a b".to_string()],
            })
        );
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
