//! Configuration for one update run.
//!
//! The configuration is built once by the host application and handed to
//! the orchestrator; nothing in the pipeline reads ambient global state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::extract::RetryPolicy;
use crate::launch::split_windows_args;
use crate::process::StopPolicy;

/// Placeholder replaced by the installation directory in installer arguments.
pub const INSTALLER_PATH_PLACEHOLDER: &str = "%path%";

/// Immutable settings for applying an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Installation directory that receives the extracted files.
    pub install_dir: PathBuf,

    /// Executable that is stopped before extraction and relaunched after.
    pub executable: PathBuf,

    /// Arguments passed to the relaunched executable.
    #[serde(default)]
    pub relaunch_args: Vec<String>,

    /// Request elevated privileges when starting processes.
    #[serde(default)]
    pub elevate: bool,

    /// Mandatory updates ignore cancellation requests once started.
    #[serde(default)]
    pub mandatory: bool,

    /// Where downloads are staged; the OS temp directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,

    /// How running instances are stopped.
    #[serde(default)]
    pub stop: StopPolicy,

    /// How locked destination files are retried.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Command line for installer artifacts; `%path%` is the installation directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_args: Option<String>,
}

impl UpdaterConfig {
    /// Creates a configuration with default policies.
    #[must_use]
    pub fn new(install_dir: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            executable: executable.into(),
            relaunch_args: Vec::new(),
            elevate: false,
            mandatory: false,
            download_dir: None,
            stop: StopPolicy::default(),
            retry: RetryPolicy::default(),
            installer_args: None,
        }
    }

    /// Set the relaunch arguments.
    #[must_use]
    pub fn with_relaunch_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relaunch_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether processes are started elevated.
    #[must_use]
    pub fn with_elevate(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Set whether the update is mandatory.
    #[must_use]
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// Set the download staging directory.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    /// Set the stop policy.
    #[must_use]
    pub fn with_stop_policy(mut self, stop: StopPolicy) -> Self {
        self.stop = stop;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the installer argument template.
    #[must_use]
    pub fn with_installer_args(mut self, args: impl Into<String>) -> Self {
        self.installer_args = Some(args.into());
        self
    }

    /// Directory downloads are staged in.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Installer arguments with the placeholder replaced by [`Self::install_dir`].
    ///
    /// The template is split with Windows quoting rules before substitution,
    /// so a quoted value or an installation directory containing spaces
    /// stays a single argument.
    #[must_use]
    pub fn installer_arguments(&self) -> Vec<String> {
        let install_dir = self.install_dir.to_string_lossy();
        self.installer_args
            .as_deref()
            .map(split_windows_args)
            .unwrap_or_default()
            .into_iter()
            .map(|arg| arg.replace(INSTALLER_PATH_PLACEHOLDER, &install_dir))
            .collect()
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the configuration to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = UpdaterConfig::new("/opt/app", "/opt/app/app");
        assert!(!config.elevate);
        assert!(!config.mandatory);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff, Duration::from_secs(5));
        assert_eq!(config.retry.diagnose_from_retry, 2);
        assert_eq!(config.stop.timeout, None);
        assert_eq!(config.staging_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let config =
            UpdaterConfig::from_json(r#"{"install_dir":"/opt/app","executable":"/opt/app/app"}"#)
                .unwrap();
        assert_eq!(config, UpdaterConfig::new("/opt/app", "/opt/app/app"));

        let config = config
            .with_relaunch_args(["--restored"])
            .with_mandatory(true)
            .with_download_dir("/var/tmp");
        let back = UpdaterConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_installer_arguments_point_at_install_dir() {
        let config = UpdaterConfig::new("/opt/my app", "/opt/my app/app")
            .with_installer_args("/D=%path% /log %path%/setup.log /quiet");
        assert_eq!(
            config.installer_arguments(),
            vec!["/D=/opt/my app", "/log", "/opt/my app/setup.log", "/quiet"]
        );

        let config = UpdaterConfig::new("/opt/app", "/opt/app/app");
        assert!(config.installer_arguments().is_empty());
    }

    #[test]
    fn test_installer_arguments_keep_quoted_values_together() {
        let config = UpdaterConfig::new(r"C:\Apps\Tool", r"C:\Apps\Tool\tool.exe")
            .with_installer_args(r#"/DIR="C:\Program Files\App" /SILENT"#);
        assert_eq!(
            config.installer_arguments(),
            vec![r"/DIR=C:\Program Files\App", "/SILENT"]
        );
    }
}
