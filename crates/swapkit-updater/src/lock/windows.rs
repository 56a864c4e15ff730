//! Windows lock diagnosis through the Restart Manager API.

#![allow(unsafe_code)]

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use winapi::shared::minwindef::{DWORD, UINT};
use winapi::shared::winerror::{ERROR_MORE_DATA, ERROR_SUCCESS};
use winapi::um::restartmanager::{
    CCH_RM_SESSION_KEY, RM_PROCESS_INFO, RmEndSession, RmGetList, RmRegisterResources,
    RmStartSession,
};

use super::{LockResolver, LockingProcess};
use crate::error::PlatformError;

/// Upper bound on `RmGetList` growth rounds when holders keep appearing.
const MAX_LIST_ATTEMPTS: usize = 4;

/// Registers the path with a Restart Manager session and lists affected apps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartManagerResolver;

/// Ends the Restart Manager session on drop.
struct Session(DWORD);

impl Drop for Session {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful RmStartSession.
        unsafe {
            RmEndSession(self.0);
        }
    }
}

fn to_wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(std::iter::once(0)).collect()
}

fn check(operation: &'static str, code: DWORD) -> Result<(), PlatformError> {
    if code == ERROR_SUCCESS {
        Ok(())
    } else {
        Err(PlatformError::new(operation, format!("error code {code}")))
    }
}

impl LockResolver for RestartManagerResolver {
    fn who_is_locking(&self, path: &Path) -> Result<Vec<LockingProcess>, PlatformError> {
        let mut handle: DWORD = 0;
        let mut key = [0u16; CCH_RM_SESSION_KEY + 1];
        // SAFETY: out-pointers reference live stack storage of the documented size.
        check("RmStartSession", unsafe {
            RmStartSession(&mut handle, 0, key.as_mut_ptr())
        })?;
        let session = Session(handle);

        let wide_path = to_wide(path.as_os_str());
        let mut resources = [wide_path.as_ptr()];
        // SAFETY: `resources` holds one NUL-terminated UTF-16 path that outlives the call.
        check("RmRegisterResources", unsafe {
            RmRegisterResources(
                session.0,
                1,
                resources.as_mut_ptr(),
                0,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
            )
        })?;

        let mut infos: Vec<RM_PROCESS_INFO> = Vec::new();
        for _ in 0..MAX_LIST_ATTEMPTS {
            let mut needed: UINT = 0;
            let mut count = infos.len() as UINT;
            let mut reasons: DWORD = 0;
            // SAFETY: `infos` has capacity for `count` entries.
            let code = unsafe {
                RmGetList(
                    session.0,
                    &mut needed,
                    &mut count,
                    if infos.is_empty() {
                        ptr::null_mut()
                    } else {
                        infos.as_mut_ptr()
                    },
                    &mut reasons,
                )
            };
            match code {
                ERROR_SUCCESS => {
                    infos.truncate(count as usize);
                    return Ok(infos.iter().map(to_locking_process).collect());
                }
                ERROR_MORE_DATA => {
                    // SAFETY: RM_PROCESS_INFO is plain data; all-zero is a valid value.
                    infos.resize_with(needed as usize, || unsafe { std::mem::zeroed() });
                }
                other => return Err(PlatformError::new("RmGetList", format!("error code {other}"))),
            }
        }

        Err(PlatformError::new(
            "RmGetList",
            "holder list kept changing".to_string(),
        ))
    }
}

fn to_locking_process(info: &RM_PROCESS_INFO) -> LockingProcess {
    let name = &info.strAppName;
    let len = name.iter().position(|c| *c == 0).unwrap_or(name.len());
    LockingProcess {
        pid: info.Process.dwProcessId,
        name: String::from_utf16_lossy(&name[..len]),
    }
}
