//! Target discovery: process lookup by executable name, top-level window lookup by class, and
//! the per-thread DPI setting that keeps window coordinates in physical pixels.

/// Compare a NUL-terminated UTF-16 buffer with `wanted`.
pub(crate) fn utf16_eq(buffer: &[u16], wanted: &str, ignore_case: bool) -> bool {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    let found = String::from_utf16_lossy(&buffer[..len]);
    if ignore_case {
        found.eq_ignore_ascii_case(wanted)
    } else {
        found == wanted
    }
}

pub use imp::{enable_dpi_awareness, find_process, find_window, is_window, window_pid};

#[cfg(windows)]
mod imp {
    use super::utf16_eq;
    use tracing::{debug, warn};
    use windows::Win32::Foundation::*;
    use windows::Win32::System::Diagnostics::ToolHelp::*;
    use windows::Win32::UI::HiDpi::*;
    use windows::Win32::UI::WindowsAndMessaging::*;

    /// Pid of the first running process whose executable name matches, ignoring case.
    pub fn find_process(name: &str) -> Option<u32> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0).ok()?;
            let mut entry = PROCESSENTRY32W {
                dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
                ..Default::default()
            };

            let mut found = None;
            if Process32FirstW(snapshot, &mut entry).is_ok() {
                loop {
                    if utf16_eq(&entry.szExeFile, name, true) {
                        found = Some(entry.th32ProcessID);
                        break;
                    }
                    if Process32NextW(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }

            let _ = CloseHandle(snapshot);
            found
        }
    }

    struct WindowQuery<'a> {
        pid: u32,
        class: &'a str,
        found: Option<HWND>,
    }

    unsafe extern "system" fn enum_windows_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let query = &mut *(lparam.0 as *mut WindowQuery);

        let mut pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        if pid != query.pid {
            return TRUE;
        }

        let mut class_name = [0u16; 256];
        if GetClassNameW(hwnd, &mut class_name) > 0 && utf16_eq(&class_name, query.class, false) {
            query.found = Some(hwnd);
            return FALSE;
        }
        TRUE
    }

    /// First top-level window of `pid` whose class name matches exactly.
    pub fn find_window(pid: u32, class: &str) -> Option<isize> {
        let mut query = WindowQuery {
            pid,
            class,
            found: None,
        };
        // EnumWindows reports an error when the callback stops early.
        let _ = unsafe { EnumWindows(Some(enum_windows_proc), LPARAM(&mut query as *mut _ as isize)) };

        let hwnd = query.found?;
        debug!(pid, class, hwnd = ?hwnd, "Window located");
        Some(hwnd.0 as isize)
    }

    pub fn window_pid(window: isize) -> Option<u32> {
        let mut pid = 0u32;
        let thread = unsafe { GetWindowThreadProcessId(HWND(window as *mut _), Some(&mut pid)) };
        (thread != 0 && pid != 0).then_some(pid)
    }

    pub fn is_window(window: isize) -> bool {
        window != 0 && unsafe { IsWindow(Some(HWND(window as *mut _))) }.as_bool()
    }

    /// Per-monitor v2 awareness for the calling thread, so window APIs report physical pixels.
    pub fn enable_dpi_awareness() {
        let previous =
            unsafe { SetThreadDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2) };
        if previous.0.is_null() {
            warn!("Per-monitor DPI awareness unavailable");
        }
    }
}

#[cfg(not(windows))]
mod imp {
    pub fn find_process(_name: &str) -> Option<u32> {
        None
    }

    pub fn find_window(_pid: u32, _class: &str) -> Option<isize> {
        None
    }

    pub fn window_pid(_window: isize) -> Option<u32> {
        None
    }

    pub fn is_window(_window: isize) -> bool {
        false
    }

    pub fn enable_dpi_awareness() {}
}
