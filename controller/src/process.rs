//! Win32 implementation of [`ProcessApi`]: remote `LoadLibraryW` through a remote thread.

use crate::injector::{InjectError, ProcessApi};
use std::path::Path;
use std::time::Duration;

/// The real operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Process;

/// The remote loader address is derived from the local one, which only holds for a target of
/// the controller's own bitness.
#[cfg_attr(not(windows), allow(dead_code))]
fn check_bitness(pid: u32, controller_wow64: bool, target_wow64: bool) -> Result<(), InjectError> {
    if controller_wow64 == target_wow64 {
        Ok(())
    } else {
        Err(InjectError::BitnessMismatch { pid })
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use tracing::{debug, warn};
    use windows::core::{s, w};
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows::Win32::System::Diagnostics::ToolHelp::*;
    use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
    use windows::Win32::System::Memory::*;
    use windows::Win32::System::Threading::*;
    use windows::Win32::UI::WindowsAndMessaging::GetWindowThreadProcessId;

    const LOADER_MODULE: &str = "kernel32.dll";

    struct OwnedHandle(HANDLE);

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            let _ = unsafe { CloseHandle(self.0) };
        }
    }

    /// Memory committed in another process, released on drop.
    struct RemoteBuffer<'a> {
        process: &'a OwnedHandle,
        address: *mut c_void,
    }

    impl<'a> RemoteBuffer<'a> {
        fn alloc(process: &'a OwnedHandle, pid: u32, len: usize) -> Result<Self, InjectError> {
            let address = unsafe {
                VirtualAllocEx(process.0, None, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            };
            if address.is_null() {
                return Err(InjectError::AllocFailed {
                    pid,
                    message: unsafe { GetLastError() }.to_hresult().message(),
                });
            }
            Ok(Self { process, address })
        }

        fn write(&self, pid: u32, bytes: &[u8]) -> Result<(), InjectError> {
            let mut written = 0usize;
            unsafe {
                WriteProcessMemory(
                    self.process.0,
                    self.address,
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                    Some(&mut written),
                )
            }
            .map_err(|e| InjectError::WriteFailed {
                pid,
                message: e.message(),
            })?;

            if written != bytes.len() {
                return Err(InjectError::WriteFailed {
                    pid,
                    message: format!("wrote {written} of {} bytes", bytes.len()),
                });
            }
            Ok(())
        }
    }

    impl Drop for RemoteBuffer<'_> {
        fn drop(&mut self) {
            let _ = unsafe { VirtualFreeEx(self.process.0, self.address, 0, MEM_RELEASE) };
        }
    }

    fn open_process(pid: u32) -> Result<OwnedHandle, InjectError> {
        let access = PROCESS_CREATE_THREAD
            | PROCESS_QUERY_INFORMATION
            | PROCESS_VM_OPERATION
            | PROCESS_VM_WRITE
            | PROCESS_VM_READ;

        match unsafe { OpenProcess(access, false, pid) } {
            Ok(handle) => Ok(OwnedHandle(handle)),
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
                Err(InjectError::ProcessNotFound { pid })
            }
            Err(e) => Err(InjectError::AccessDenied {
                pid,
                message: e.message(),
            }),
        }
    }

    /// Base address of `module` in `pid`, from a module snapshot of that process.
    fn remote_module_base(pid: u32, module: &str) -> Option<usize> {
        let flags = TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32;

        // The snapshot fails transiently while the target is loading modules.
        let snapshot = (0..5).find_map(|attempt| {
            match unsafe { CreateToolhelp32Snapshot(flags, pid) } {
                Ok(snapshot) => Some(OwnedHandle(snapshot)),
                Err(e) if e.code() == ERROR_BAD_LENGTH.to_hresult() => {
                    debug!(pid, attempt, "Module snapshot busy, retrying");
                    None
                }
                Err(_) => None,
            }
        })?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        unsafe {
            if Module32FirstW(snapshot.0, &mut entry).is_err() {
                return None;
            }
            loop {
                if crate::window::utf16_eq(&entry.szModule, module, true) {
                    return Some(entry.modBaseAddr as usize);
                }
                if Module32NextW(snapshot.0, &mut entry).is_err() {
                    return None;
                }
            }
        }
    }

    fn is_wow64(process: HANDLE) -> windows::core::Result<bool> {
        let mut wow64 = Default::default();
        unsafe { IsWow64Process(process, &mut wow64) }?;
        Ok(wow64.as_bool())
    }

    fn ensure_same_bitness(pid: u32, process: &OwnedHandle) -> Result<(), InjectError> {
        let denied = |e: windows::core::Error| InjectError::AccessDenied {
            pid,
            message: e.message(),
        };
        let ours = is_wow64(unsafe { GetCurrentProcess() }).map_err(denied)?;
        let theirs = is_wow64(process.0).map_err(denied)?;
        check_bitness(pid, ours, theirs)
    }

    /// `LoadLibraryW` in the target: its offset inside the local kernel32 applied to the
    /// target's kernel32 base.
    fn remote_load_library(pid: u32) -> Result<usize, InjectError> {
        let not_found = || InjectError::SymbolNotFound {
            pid,
            symbol: "LoadLibraryW",
        };

        let local_base = unsafe { GetModuleHandleW(w!("kernel32.dll")) }.map_err(|_| not_found())?;
        let local_entry = unsafe { GetProcAddress(local_base, s!("LoadLibraryW")) }
            .ok_or_else(not_found)? as usize;
        let offset = local_entry - local_base.0 as usize;

        let remote_base = remote_module_base(pid, LOADER_MODULE).ok_or_else(not_found)?;
        debug!(pid, remote_base = format_args!("{remote_base:#x}"), offset, "Resolved remote loader");
        Ok(remote_base + offset)
    }

    impl ProcessApi for Win32Process {
        fn find_process(&self, name: &str) -> Option<u32> {
            crate::window::find_process(name)
        }

        fn find_window(&self, pid: u32, class: &str) -> Option<isize> {
            crate::window::find_window(pid, class)
        }

        fn is_window(&self, window: isize) -> bool {
            crate::window::is_window(window)
        }

        fn window_pid(&self, window: isize) -> Option<u32> {
            crate::window::window_pid(window)
        }

        fn is_alive(&self, pid: u32) -> bool {
            let Ok(handle) = (unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) })
            else {
                return false;
            };
            let handle = OwnedHandle(handle);

            let mut code = 0u32;
            unsafe { GetExitCodeProcess(handle.0, &mut code) }.is_ok()
                && code == STILL_ACTIVE.0 as u32
        }

        fn load_library(
            &self,
            pid: u32,
            payload: &Path,
            timeout: Duration,
        ) -> Result<(), InjectError> {
            let process = open_process(pid)?;
            ensure_same_bitness(pid, &process)?;

            let path: Vec<u8> = payload
                .as_os_str()
                .encode_wide()
                .chain(std::iter::once(0))
                .flat_map(u16::to_le_bytes)
                .collect();
            let buffer = RemoteBuffer::alloc(&process, pid, path.len())?;
            buffer.write(pid, &path)?;

            let entry = remote_load_library(pid)?;
            // SAFETY: `entry` is LoadLibraryW inside the target, whose signature is
            // compatible with LPTHREAD_START_ROUTINE.
            let start: LPTHREAD_START_ROUTINE = Some(unsafe {
                std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(entry)
            });

            let thread = unsafe {
                CreateRemoteThread(process.0, None, 0, start, Some(buffer.address), 0, None)
            }
            .map(OwnedHandle)
            .map_err(|e| InjectError::ThreadFailed {
                pid,
                message: e.message(),
            })?;

            let timeout_ms = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
            let wait = unsafe { WaitForSingleObject(thread.0, timeout_ms) };
            if wait != WAIT_OBJECT_0 {
                // The loader thread is left running; terminating it mid-load can corrupt the
                // target's loader state.
                warn!(pid, timeout_ms, "Remote loader thread did not finish");
                return Err(InjectError::Timeout {
                    pid,
                    timeout_ms: u64::from(timeout_ms),
                });
            }

            let mut exit_code = 0u32;
            unsafe { GetExitCodeThread(thread.0, &mut exit_code) }.map_err(|_| {
                InjectError::LoadFailed { pid }
            })?;
            // The exit code is the low half of the module handle; zero means the load failed.
            if exit_code == 0 {
                return Err(InjectError::LoadFailed { pid });
            }

            debug!(pid, module = format_args!("{exit_code:#x}"), "Remote load returned");
            Ok(())
        }
    }
}

#[cfg(not(windows))]
impl ProcessApi for Win32Process {
    fn find_process(&self, _name: &str) -> Option<u32> {
        None
    }

    fn find_window(&self, _pid: u32, _class: &str) -> Option<isize> {
        None
    }

    fn is_window(&self, _window: isize) -> bool {
        false
    }

    fn window_pid(&self, _window: isize) -> Option<u32> {
        None
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn load_library(
        &self,
        _pid: u32,
        _payload: &Path,
        _timeout: Duration,
    ) -> Result<(), InjectError> {
        Err(InjectError::Unsupported)
    }
}
