//! macOS lock diagnosis through `lsof`.

use std::path::Path;
use std::process::Command;

use super::{LockResolver, LockingProcess};
use crate::error::PlatformError;

/// Asks `lsof` for the processes holding a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofResolver;

impl LockResolver for LsofResolver {
    fn who_is_locking(&self, path: &Path) -> Result<Vec<LockingProcess>, PlatformError> {
        let output = Command::new("lsof")
            .args(["-F", "pc", "--"])
            .arg(path)
            .output()
            .map_err(|e| PlatformError::new("run lsof", e.to_string()))?;

        // lsof exits 1 when nothing holds the file.
        if !output.status.success() && output.stdout.is_empty() {
            return Ok(Vec::new());
        }

        Ok(parse_lsof_fields(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `lsof -F pc` output: `p<pid>` starts a process set, `c<command>` names it.
fn parse_lsof_fields(output: &str) -> Vec<LockingProcess> {
    let mut processes: Vec<LockingProcess> = Vec::new();
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p').and_then(|p| p.parse().ok()) {
            processes.push(LockingProcess {
                pid,
                name: String::new(),
            });
        } else if let (Some(name), Some(last)) = (line.strip_prefix('c'), processes.last_mut()) {
            last.name = name.to_string();
        }
    }
    processes
}
