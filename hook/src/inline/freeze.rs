//! Suspension of every other thread of the process while code bytes are rewritten.

use crate::intercept::HookError;
use windows::Win32::Foundation::*;
use windows::Win32::System::Diagnostics::Debug::*;
use windows::Win32::System::Diagnostics::ToolHelp::*;
use windows::Win32::System::Threading::*;

#[cfg(target_arch = "x86_64")]
const CONTROL: CONTEXT_FLAGS = CONTEXT_CONTROL_AMD64;
#[cfg(target_arch = "x86")]
const CONTROL: CONTEXT_FLAGS = CONTEXT_CONTROL_X86;

/// Every other thread of the current process, suspended until drop.
///
/// Nothing may allocate or log while a freeze is held: a suspended thread can own the heap or
/// the subscriber lock.
pub(crate) struct ThreadFreeze {
    threads: Vec<HANDLE>,
}

fn other_thread_ids() -> Result<Vec<u32>, HookError> {
    let pid = unsafe { GetCurrentProcessId() };
    let current = unsafe { GetCurrentThreadId() };

    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
            .map_err(|e| HookError::Threads(e.message()))?;

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        let mut ids = Vec::new();
        if Thread32First(snapshot, &mut entry).is_ok() {
            loop {
                if entry.th32OwnerProcessID == pid && entry.th32ThreadID != current {
                    ids.push(entry.th32ThreadID);
                }
                if Thread32Next(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }

        let _ = CloseHandle(snapshot);
        Ok(ids)
    }
}

impl ThreadFreeze {
    pub(crate) fn others() -> Result<Self, HookError> {
        let ids = other_thread_ids()?;
        let mut threads = Vec::with_capacity(ids.len());

        for id in ids {
            let access = THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT;
            // Threads that exited since the snapshot simply fail to open.
            let Ok(handle) = (unsafe { OpenThread(access, false, id) }) else {
                continue;
            };
            if unsafe { SuspendThread(handle) } == u32::MAX {
                let _ = unsafe { CloseHandle(handle) };
                continue;
            }
            threads.push(handle);
        }

        Ok(Self { threads })
    }

    /// Move the instruction pointer of each frozen thread through `map`.
    pub(crate) fn relocate(&self, map: impl Fn(u64) -> Option<u64>) {
        for &thread in &self.threads {
            let mut context = CONTEXT {
                ContextFlags: CONTROL,
                ..Default::default()
            };
            if unsafe { GetThreadContext(thread, &mut context) }.is_err() {
                continue;
            }

            #[cfg(target_arch = "x86_64")]
            let ip = &mut context.Rip;
            #[cfg(target_arch = "x86")]
            let ip = &mut context.Eip;

            if let Some(moved) = map(u64::from(*ip)) {
                *ip = moved as _;
                let _ = unsafe { SetThreadContext(thread, &context) };
            }
        }
    }
}

impl Drop for ThreadFreeze {
    fn drop(&mut self) {
        for &thread in &self.threads {
            unsafe {
                ResumeThread(thread);
                let _ = CloseHandle(thread);
            }
        }
    }
}
