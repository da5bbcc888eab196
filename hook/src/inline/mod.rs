//! Inline entry-point patching: a `jmp rel32` over the first instructions of the target, and a
//! trampoline page holding the relay to the detour and those instructions relocated plus a
//! jump back.

pub mod plan;

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
mod freeze;

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
pub use engine::InlineInterceptor;

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
mod engine {
    use super::freeze::ThreadFreeze;
    use super::plan::{Layout, Prologue, Relocated, MAX_PROLOGUE, NATIVE_BITNESS};
    use crate::intercept::{HookError, Interceptor};
    use std::ffi::c_void;
    use tracing::debug;
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::*;
    use windows::Win32::System::Threading::GetCurrentProcess;

    const TRAMPOLINE_SIZE: usize = 0x1000;

    struct Detour {
        target: usize,
        trampoline: usize,
        has_relay: bool,
        original: Vec<u8>,
        patch: Vec<u8>,
        relocated: Relocated,
        enabled: bool,
    }

    /// [`Interceptor`] that rewrites the target's entry point in place.
    #[derive(Default)]
    pub struct InlineInterceptor {
        detour: Option<Detour>,
    }

    impl InlineInterceptor {
        pub fn new() -> Self {
            Self::default()
        }
    }

    /// Reserve executable memory within rel32 reach of `target`.
    #[cfg(target_arch = "x86_64")]
    unsafe fn alloc_trampoline(target: usize) -> Result<usize, HookError> {
        const GRANULARITY: usize = 0x1_0000;
        const REACH: usize = 0x4000_0000;

        let base = target & !(GRANULARITY - 1);
        for step in 1..REACH / GRANULARITY {
            let delta = step * GRANULARITY;
            for candidate in [base.checked_sub(delta), base.checked_add(delta)]
                .into_iter()
                .flatten()
            {
                let address = VirtualAlloc(
                    Some(candidate as *const c_void),
                    TRAMPOLINE_SIZE,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                );
                if !address.is_null() {
                    return Ok(address as usize);
                }
            }
        }

        Err(HookError::Memory(format!(
            "no free region within reach of {target:#x}"
        )))
    }

    #[cfg(target_arch = "x86")]
    unsafe fn alloc_trampoline(_target: usize) -> Result<usize, HookError> {
        let address = VirtualAlloc(
            None,
            TRAMPOLINE_SIZE,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        );
        if address.is_null() {
            return Err(HookError::Memory("VirtualAlloc failed".into()));
        }
        Ok(address as usize)
    }

    unsafe fn free_trampoline(address: usize) {
        let _ = VirtualFree(address as *mut c_void, 0, MEM_RELEASE);
    }

    /// Overwrite code at `address`. Does not allocate.
    unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<(), HookError> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        VirtualProtect(
            address as *const c_void,
            bytes.len(),
            PAGE_EXECUTE_READWRITE,
            &mut old,
        )
        .map_err(|e| HookError::Memory(e.message()))?;

        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());

        let mut ignored = PAGE_PROTECTION_FLAGS::default();
        let _ = VirtualProtect(address as *const c_void, bytes.len(), old, &mut ignored);
        let _ = FlushInstructionCache(
            GetCurrentProcess(),
            Some(address as *const c_void),
            bytes.len(),
        );
        Ok(())
    }

    impl Interceptor for InlineInterceptor {
        unsafe fn install(&mut self, target: usize, detour: usize) -> Result<usize, HookError> {
            if self.detour.is_some() {
                return Err(HookError::AlreadyInstalled);
            }

            let code = std::slice::from_raw_parts(target as *const u8, MAX_PROLOGUE);
            let prologue = Prologue::decode(code, target as u64, NATIVE_BITNESS)?;

            let trampoline = alloc_trampoline(target)?;
            let planned = Layout::plan(
                NATIVE_BITNESS,
                target as u64,
                trampoline as u64,
                detour as u64,
                prologue.stolen_len(),
            )
            .and_then(|layout| {
                let relocated = Relocated::build(&prologue, layout.original_at, NATIVE_BITNESS)?;
                let end = layout.original_at - trampoline as u64 + relocated.code().len() as u64;
                if end > TRAMPOLINE_SIZE as u64 {
                    return Err(HookError::Relocation("trampoline overflow".into()));
                }
                Ok((layout, relocated))
            });
            let (layout, relocated) = match planned {
                Ok(planned) => planned,
                Err(err) => {
                    free_trampoline(trampoline);
                    return Err(err);
                }
            };

            std::ptr::copy_nonoverlapping(
                layout.relay.as_ptr(),
                trampoline as *mut u8,
                layout.relay.len(),
            );
            std::ptr::copy_nonoverlapping(
                relocated.code().as_ptr(),
                layout.original_at as *mut u8,
                relocated.code().len(),
            );
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(trampoline as *const c_void),
                TRAMPOLINE_SIZE,
            );

            let stolen = prologue.stolen_len();
            debug!(
                target = format_args!("{target:#x}"),
                stolen,
                relay = layout.has_relay(),
                relocated = relocated.code().len(),
                "Trampoline built"
            );

            self.detour = Some(Detour {
                target,
                trampoline,
                has_relay: layout.has_relay(),
                original: code[..stolen].to_vec(),
                patch: layout.patch,
                relocated,
                enabled: false,
            });
            Ok(layout.original_at as usize)
        }

        fn enable(&mut self) -> Result<(), HookError> {
            let detour = self.detour.as_mut().ok_or(HookError::NotInstalled)?;
            if detour.enabled {
                return Ok(());
            }

            let freeze = ThreadFreeze::others()?;
            freeze.relocate(|ip| detour.relocated.to_trampoline(ip));
            unsafe { write_code(detour.target, &detour.patch)? };
            detour.enabled = true;
            drop(freeze);
            Ok(())
        }

        fn disable(&mut self) -> Result<(), HookError> {
            let detour = self.detour.as_mut().ok_or(HookError::NotInstalled)?;
            if !detour.enabled {
                return Ok(());
            }

            let freeze = ThreadFreeze::others()?;
            unsafe { write_code(detour.target, &detour.original)? };
            // A thread about to take the relay goes through the restored entry instead.
            let relay = detour.has_relay.then_some(detour.trampoline as u64);
            let entry = detour.target as u64;
            freeze.relocate(|ip| {
                if Some(ip) == relay {
                    Some(entry)
                } else {
                    detour.relocated.to_original(ip)
                }
            });
            detour.enabled = false;
            drop(freeze);
            Ok(())
        }

        fn remove(&mut self) -> Result<(), HookError> {
            if self.detour.is_none() {
                return Ok(());
            }
            self.disable()?;

            if let Some(detour) = self.detour.take() {
                unsafe { free_trampoline(detour.trampoline) };
            }
            Ok(())
        }
    }
}
