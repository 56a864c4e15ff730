//! Linux lock diagnosis by scanning open descriptors under `/proc`.

use std::fs;
use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use super::{LockResolver, LockingProcess};
use crate::error::PlatformError;

/// Finds holders by reading every `/proc/<pid>/fd/*` link.
///
/// Processes we are not allowed to inspect are skipped silently.
#[derive(Debug, Clone)]
pub struct ProcFdResolver {
    proc_root: PathBuf,
}

impl Default for ProcFdResolver {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFdResolver {
    fn holds(&self, pid_dir: &Path, target: &Path) -> bool {
        let Ok(fds) = fs::read_dir(pid_dir.join("fd")) else {
            return false;
        };
        fds.filter_map(std::result::Result::ok)
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .any(|link| link == target)
    }
}

impl LockResolver for ProcFdResolver {
    fn who_is_locking(&self, path: &Path) -> Result<Vec<LockingProcess>, PlatformError> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let entries = fs::read_dir(&self.proc_root)
            .map_err(|e| PlatformError::new("read /proc", e.to_string()))?;

        let mut pids: Vec<u32> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
                self.holds(&entry.path(), &target).then_some(pid)
            })
            .collect();
        pids.sort_unstable();

        if pids.is_empty() {
            return Ok(Vec::new());
        }

        let sys_pids: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::nothing(),
        );

        Ok(pids
            .into_iter()
            .map(|pid| LockingProcess {
                pid,
                name: system
                    .process(Pid::from_u32(pid))
                    .map(|p| p.name().to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("pid {pid}")),
            })
            .collect())
    }
}
