//! Starting processes: the relaunched application, installers and the helper.
//!
//! Children are detached and never waited on. A successful spawn is the
//! OS confirmation that the process started.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::info;

use crate::error::RelaunchError;

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Program to run.
    pub executable_path: PathBuf,
    /// Arguments in order.
    pub arguments: Vec<String>,
    /// Ask the OS for elevated privileges.
    pub elevate: bool,
    /// Working directory; the executable's directory when unset.
    pub working_dir: Option<PathBuf>,
}

impl LaunchRequest {
    /// Request to start `executable` with no arguments.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable.into(),
            arguments: Vec::new(),
            elevate: false,
            working_dir: None,
        }
    }

    /// Request that runs a Windows Installer package through `msiexec /i`.
    #[must_use]
    pub fn msiexec(package: &Path, extra_args: Vec<String>) -> Self {
        let mut arguments = vec!["/i".to_string(), package.to_string_lossy().into_owned()];
        arguments.extend(extra_args);
        Self {
            arguments,
            ..Self::new("msiexec")
        }
    }

    /// Set the arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether to elevate.
    #[must_use]
    pub fn with_elevate(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn effective_working_dir(&self) -> Option<&Path> {
        self.working_dir
            .as_deref()
            .or_else(|| self.executable_path.parent())
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    fn launch_failed(&self, message: impl Into<String>) -> RelaunchError {
        RelaunchError::LaunchFailed {
            path: self.executable_path.clone(),
            message: message.into(),
        }
    }
}

/// Result of a launch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStatus {
    /// The process is running.
    Started {
        /// Process id, when the OS reported one.
        pid: Option<u32>,
    },
    /// The user dismissed the elevation prompt.
    ///
    /// Only reported on Windows. `pkexec` gives no such signal to a
    /// detached caller, so a dismissed Linux prompt still reads as started.
    Declined,
}

/// Starts processes on behalf of the pipeline.
pub trait Launcher: Send + Sync {
    /// Start the requested process without waiting for it.
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchStatus, RelaunchError>;
}

/// [`Launcher`] backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchStatus, RelaunchError> {
        info!(
            "Launching {} {:?}{}",
            request.executable_path.display(),
            request.arguments,
            if request.elevate { " (elevated)" } else { "" }
        );
        if request.elevate {
            launch_elevated(request)
        } else {
            spawn_detached(request, Command::new(&request.executable_path))
        }
    }
}

fn spawn_detached(request: &LaunchRequest, mut command: Command) -> Result<LaunchStatus, RelaunchError> {
    command
        .args(&request.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = request.effective_working_dir() {
        command.current_dir(dir);
    }
    detach(&mut command);

    let child = command
        .spawn()
        .map_err(|e| request.launch_failed(e.to_string()))?;
    Ok(LaunchStatus::Started {
        pid: Some(child.id()),
    })
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

/// Starts the process through `pkexec`.
///
/// The child is detached, so a dismissed authentication dialog is not
/// observed: the launch is reported as [`LaunchStatus::Started`] even when
/// `pkexec` later exits with 126. Windows reports the same case as
/// [`LaunchStatus::Declined`] through `ERROR_CANCELLED` (1223).
#[cfg(target_os = "linux")]
fn launch_elevated(request: &LaunchRequest) -> Result<LaunchStatus, RelaunchError> {
    match which::which("pkexec") {
        Ok(pkexec) => {
            let mut command = Command::new(pkexec);
            command.arg(&request.executable_path);
            spawn_detached(request, command)
        }
        Err(_) => {
            tracing::warn!("pkexec not found; starting without elevation");
            spawn_detached(request, Command::new(&request.executable_path))
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn launch_elevated(request: &LaunchRequest) -> Result<LaunchStatus, RelaunchError> {
    tracing::warn!("Elevation is not supported on this platform; starting normally");
    spawn_detached(request, Command::new(&request.executable_path))
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn launch_elevated(request: &LaunchRequest) -> Result<LaunchStatus, RelaunchError> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;

    use winapi::shared::winerror::ERROR_CANCELLED;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::GetProcessId;
    use winapi::um::shellapi::{SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW, ShellExecuteExW};
    use winapi::um::winuser::SW_SHOWNORMAL;

    fn wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    let verb = wide(OsStr::new("runas"));
    let file = wide(request.executable_path.as_os_str());
    let params = wide(OsStr::new(&join_windows_args(&request.arguments)));
    let dir = request.effective_working_dir().map(|d| wide(d.as_os_str()));

    // SAFETY: SHELLEXECUTEINFOW is plain data; all-zero is a valid starting value.
    let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
    info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
    info.fMask = SEE_MASK_NOCLOSEPROCESS;
    info.lpVerb = verb.as_ptr();
    info.lpFile = file.as_ptr();
    info.lpParameters = params.as_ptr();
    info.lpDirectory = dir.as_ref().map_or(ptr::null(), |d| d.as_ptr());
    info.nShow = SW_SHOWNORMAL;

    // SAFETY: every pointer in `info` references a buffer alive for the call.
    let ok = unsafe { ShellExecuteExW(&mut info) };
    if ok == 0 {
        // SAFETY: reads the calling thread's last-error value.
        let code = unsafe { GetLastError() };
        if code == ERROR_CANCELLED {
            info!("Elevation prompt was declined");
            return Ok(LaunchStatus::Declined);
        }
        return Err(request.launch_failed(
            std::io::Error::from_raw_os_error(code as i32).to_string(),
        ));
    }

    let mut pid = None;
    if !info.hProcess.is_null() {
        // SAFETY: the handle was returned by ShellExecuteExW and is closed once.
        unsafe {
            pid = Some(GetProcessId(info.hProcess));
            CloseHandle(info.hProcess);
        }
    }
    Ok(LaunchStatus::Started { pid })
}

/// Joins arguments into one command line using the MSVC quoting rules.
#[cfg(any(windows, test))]
fn join_windows_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_windows_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(any(windows, test))]
fn quote_windows_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            other => {
                quoted.extend(std::iter::repeat_n('\\', backslashes));
                quoted.push(other);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

/// Splits a command line into arguments using the MSVC quoting rules.
///
/// Double quotes group and are removed, `""` inside quotes is a literal
/// quote, and backslashes are literal unless they precede a quote.
pub(crate) fn split_windows_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let mut backslashes = 1;
                while chars.next_if_eq(&'\\').is_some() {
                    backslashes += 1;
                }
                in_arg = true;
                if chars.peek() == Some(&'"') {
                    current.extend(std::iter::repeat_n('\\', backslashes / 2));
                    if backslashes % 2 == 1 {
                        chars.next();
                        current.push('"');
                    }
                } else {
                    current.extend(std::iter::repeat_n('\\', backslashes));
                }
            }
            '"' => {
                in_arg = true;
                if quoted && chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = !quoted;
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_quoting() {
        let args = vec![
            "plain".to_string(),
            "with space".to_string(),
            String::new(),
            r#"say "hi""#.to_string(),
            r"C:\Program Files\App\".to_string(),
        ];
        assert_eq!(
            join_windows_args(&args),
            r#"plain "with space" "" "say \"hi\"" "C:\Program Files\App\\""#
        );
    }

    #[test]
    fn test_split_windows_args() {
        assert_eq!(
            split_windows_args(r#"/DIR="C:\Program Files\App" /SILENT"#),
            vec![r"/DIR=C:\Program Files\App", "/SILENT"]
        );
        assert_eq!(
            split_windows_args(r#"  /log C:\Temp\setup.log  "" "a ""b"" c" x\"y"#),
            vec!["/log", r"C:\Temp\setup.log", "", r#"a "b" c"#, r#"x"y"#]
        );
        assert!(split_windows_args("   ").is_empty());

        let args = vec![
            "with space".to_string(),
            r#"say "hi""#.to_string(),
            r"C:\Program Files\App\".to_string(),
        ];
        assert_eq!(split_windows_args(&join_windows_args(&args)), args);
    }

    #[test]
    fn test_msiexec_request() {
        let request = LaunchRequest::msiexec(Path::new("setup.msi"), vec!["/quiet".to_string()]);
        assert_eq!(request.executable_path, Path::new("msiexec"));
        assert_eq!(request.arguments, vec!["/i", "setup.msi", "/quiet"]);
        assert_eq!(request.effective_working_dir(), None);
    }

    #[test]
    fn test_missing_executable_is_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = LaunchRequest::new(dir.path().join("does-not-exist"));
        let err = SystemLauncher.launch(&request).unwrap_err();
        assert!(matches!(err, RelaunchError::LaunchFailed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_is_detached_and_reports_pid() {
        let request = LaunchRequest::new("/bin/sh").with_args(["-c", "exit 0"]);
        match SystemLauncher.launch(&request).unwrap() {
            LaunchStatus::Started { pid } => assert!(pid.is_some_and(|p| p > 0)),
            LaunchStatus::Declined => panic!("plain launch cannot be declined"),
        }
    }
}
