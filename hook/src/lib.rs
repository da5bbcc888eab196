//! Payload DLL loaded into the target process.
//!
//! On load it attaches to the control channel and redirects `GetCursorPos`, so the target
//! reads the controller's synthetic pointer position instead of the real cursor.

pub mod cursor;
pub mod inline;
pub mod intercept;
pub mod logging;

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
mod payload;

pub use cursor::{Point, WindowSpace};
pub use intercept::{HookError, HookSession, HookState, Interceptor};

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
mod entry {
    use windows::Win32::Foundation::*;
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    /// # Safety
    /// Called by the Windows loader with valid parameters.
    #[no_mangle]
    pub unsafe extern "system" fn DllMain(
        dll_instance: HINSTANCE,
        reason: u32,
        reserved: *const std::ffi::c_void,
    ) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => {
                let _ = DisableThreadLibraryCalls(HMODULE(dll_instance.0));
                crate::logging::init();
                if crate::payload::initialize() {
                    TRUE
                } else {
                    FALSE
                }
            }
            DLL_PROCESS_DETACH => {
                // A non-null reserved pointer means the process is exiting; the OS reclaims
                // everything and other threads are already gone.
                if reserved.is_null() {
                    crate::payload::cleanup();
                }
                TRUE
            }
            _ => TRUE,
        }
    }
}
