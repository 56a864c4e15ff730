//! Stopping the running application before its files are replaced.
//!
//! Candidates are matched on their full executable path, never on the
//! process name alone, so an unrelated binary with the same file name is
//! left alone. The sweep is best effort: a process that refuses to die is
//! reported and the next one is handled.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::error::ProcessStopError;

/// How often process state is re-read while waiting for an exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How running instances are asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Time a process gets to honour the graceful request before it is killed.
    #[serde(with = "duration_millis")]
    pub grace: Duration,
    /// Upper bound on the wait after the forced kill; `None` waits forever.
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            timeout: None,
        }
    }
}

impl StopPolicy {
    /// Set the hard timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the graceful period.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Outcome of one stop sweep.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Pids whose executable matched.
    pub matched: Vec<u32>,
    /// Pids confirmed exited.
    pub stopped: Vec<u32>,
    /// Per-process failures; logged by the caller, never fatal.
    pub failures: Vec<ProcessStopError>,
}

impl StopReport {
    /// Whether every matched process was confirmed stopped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Stops every running instance of an executable.
pub trait ProcessStopper: Send + Sync {
    /// Terminate all processes whose image is `executable` and wait for them.
    fn stop_and_wait(&self, executable: &Path, policy: &StopPolicy) -> StopReport;
}

/// [`ProcessStopper`] backed by the OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemStopper;

impl ProcessStopper for SystemStopper {
    fn stop_and_wait(&self, executable: &Path, policy: &StopPolicy) -> StopReport {
        stop_and_wait(executable, policy)
    }
}

/// Terminate every process running `executable` and wait for OS confirmation.
///
/// The calling process is never a candidate.
pub fn stop_and_wait(executable: &Path, policy: &StopPolicy) -> StopReport {
    let target = normalize(executable);
    let mut system = System::new();
    refresh(&mut system, ProcessesToUpdate::All);

    let own_pid = std::process::id();
    let mut matched: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, _)| pid.as_u32() != own_pid)
        .filter(|(_, process)| !is_exited(process.status()))
        .filter(|(_, process)| process.exe().is_some_and(|exe| normalize(exe) == target))
        .map(|(pid, _)| *pid)
        .collect();
    matched.sort_unstable();

    let mut report = StopReport {
        matched: matched.iter().map(|p| p.as_u32()).collect(),
        ..StopReport::default()
    };

    if matched.is_empty() {
        debug!("No running instance of {}", executable.display());
        return report;
    }

    for pid in matched {
        info!("Waiting for application process {} to exit", pid);
        match stop_one(&mut system, pid, policy) {
            Ok(()) => report.stopped.push(pid.as_u32()),
            Err(e) => {
                warn!("Could not stop process {}: {}", pid, e);
                report.failures.push(e);
            }
        }
    }

    report
}

fn stop_one(system: &mut System, pid: Pid, policy: &StopPolicy) -> Result<(), ProcessStopError> {
    let Some(process) = system.process(pid) else {
        return Ok(());
    };

    // `None` means the platform has no graceful signal; go straight to kill.
    let graceful = process.kill_with(Signal::Term);
    if graceful == Some(true) && wait_for_exit(system, pid, Some(policy.grace)) {
        return Ok(());
    }

    refresh(system, ProcessesToUpdate::Some(&[pid]));
    if let Some(process) = system.process(pid) {
        if !is_exited(process.status()) && !process.kill() {
            // The process may have exited between refresh and kill.
            refresh(system, ProcessesToUpdate::Some(&[pid]));
            if system.process(pid).is_some_and(|p| !is_exited(p.status())) {
                return Err(ProcessStopError::TerminateFailed { pid: pid.as_u32() });
            }
        }
    }

    let started = Instant::now();
    if wait_for_exit(system, pid, policy.timeout) {
        Ok(())
    } else {
        Err(ProcessStopError::Timeout {
            pid: pid.as_u32(),
            waited_ms: started.elapsed().as_millis(),
        })
    }
}

/// Polls until `pid` is gone or `limit` elapses; `None` never gives up.
fn wait_for_exit(system: &mut System, pid: Pid, limit: Option<Duration>) -> bool {
    let started = Instant::now();
    loop {
        refresh(system, ProcessesToUpdate::Some(&[pid]));
        match system.process(pid) {
            None => return true,
            Some(process) if is_exited(process.status()) => return true,
            Some(_) => {}
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn refresh(system: &mut System, which: ProcessesToUpdate<'_>) {
    system.refresh_processes_specifics(which, true, ProcessRefreshKind::everything());
}

/// A zombie has exited as far as file handles are concerned.
fn is_exited(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_is_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = stop_and_wait(&dir.path().join("not-running"), &StopPolicy::default());
        assert!(report.matched.is_empty());
        assert!(report.is_complete());
    }

    #[test]
    fn test_exited_states() {
        assert!(is_exited(ProcessStatus::Zombie));
        assert!(is_exited(ProcessStatus::Dead));
        assert!(!is_exited(ProcessStatus::Run));
        assert!(!is_exited(ProcessStatus::Sleep));
    }

    #[test]
    fn test_policy_serde() {
        let policy = StopPolicy::default().with_timeout(Some(Duration::from_secs(10)));
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"grace":3000,"timeout":10000}"#);
        let back: StopPolicy = serde_json::from_str(r#"{"grace":500}"#).unwrap();
        assert_eq!(back.grace, Duration::from_millis(500));
        assert_eq!(back.timeout, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_stops_matching_process() {
        use std::process::Command;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app-under-update");
        std::fs::copy("/bin/sleep", &exe).unwrap();

        let mut child = Command::new(&exe).arg("30").spawn().unwrap();
        let pid = child.id();
        // Let the process table pick up the new image.
        thread::sleep(Duration::from_millis(200));
        if child.try_wait().unwrap().is_some() {
            // `sleep` is a multi-call binary here and refused the new name.
            return;
        }

        let policy = StopPolicy::default()
            .with_grace(Duration::from_secs(2))
            .with_timeout(Some(Duration::from_secs(10)));
        let report = stop_and_wait(&exe, &policy);

        assert_eq!(report.matched, vec![pid]);
        assert_eq!(report.stopped, vec![pid]);
        assert!(report.is_complete());
        assert!(child.wait().is_ok());
    }
}
