//! Process-wide payload state: the attached channel, the hook session and the detour itself.
//!
//! The detour runs on arbitrary threads of the target, so the state it reads lives in atomics
//! published before the entry point is patched. On teardown the trampoline slot is pointed at
//! the restored entry point before anything is freed.

use crate::cursor::{self, Point, Win32WindowSpace};
use crate::inline::InlineInterceptor;
use crate::intercept::{HookError, HookSession};
use shared::{ChannelError, ChannelReader, CHANNEL_NAME};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use windows::core::*;
use windows::Win32::Foundation::*;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

type GetCursorPosFn = unsafe extern "system" fn(*mut POINT) -> BOOL;

static SESSION: Mutex<Option<HookSession<InlineInterceptor>>> = Mutex::new(None);
static CHANNEL: AtomicPtr<ChannelReader> = AtomicPtr::new(null_mut());
static TRAMPOLINE: AtomicUsize = AtomicUsize::new(0);
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
enum PayloadError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Hook(#[from] HookError),
}

/// Attach to the channel and redirect `GetCursorPos`. Idempotent.
pub fn initialize() -> bool {
    let mut session = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    if session.is_some() {
        return true;
    }

    match try_initialize() {
        Ok(hooked) => {
            *session = Some(hooked);
            info!(pid = std::process::id(), "Payload initialized");
            true
        }
        Err(err) => {
            error!(error = %err, "Payload initialization failed");
            release_channel();
            false
        }
    }
}

fn try_initialize() -> std::result::Result<HookSession<InlineInterceptor>, PayloadError> {
    let channel = Box::new(ChannelReader::attach(CHANNEL_NAME)?);
    CHANNEL.store(Box::into_raw(channel), Ordering::Release);

    let target = unsafe { resolve_get_cursor_pos() }?;
    let mut session = HookSession::new(InlineInterceptor::new());
    unsafe {
        session.hook(target, hooked_get_cursor_pos as usize, |trampoline| {
            TRAMPOLINE.store(trampoline, Ordering::Release)
        })?;
    }
    Ok(session)
}

/// Restore `GetCursorPos` and detach from the channel. Idempotent.
pub fn cleanup() {
    let mut session = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(mut hooked) = session.take() else {
        return;
    };

    // Late callers of the detour call the restored entry point from here on, never the
    // trampoline that is about to be freed.
    let restored = |entry: usize| TRAMPOLINE.store(entry, Ordering::Release);
    if hooked.unhook_with(restored, drain_in_flight) {
        release_channel();
        info!("Payload cleaned up");
    } else {
        // A caller is still inside the detour; its trampoline and channel stay allocated.
        warn!(
            in_flight = IN_FLIGHT.load(Ordering::Acquire),
            "Leaking payload state after drain timeout"
        );
    }
}

fn release_channel() {
    let channel = CHANNEL.swap(null_mut(), Ordering::AcqRel);
    if !channel.is_null() {
        // SAFETY: produced by Box::into_raw in try_initialize and swapped out exactly once.
        drop(unsafe { Box::from_raw(channel) });
    }
}

fn drain_in_flight() -> bool {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while IN_FLIGHT.load(Ordering::Acquire) != 0 {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

unsafe fn resolve_get_cursor_pos() -> std::result::Result<usize, HookError> {
    let user32 = GetModuleHandleW(w!("user32.dll"))
        .map_err(|e| HookError::SymbolNotFound(format!("user32.dll: {}", e.message())))?;
    GetProcAddress(user32, s!("GetCursorPos"))
        .map(|f| f as usize)
        .ok_or_else(|| HookError::SymbolNotFound("GetCursorPos".into()))
}

unsafe extern "system" fn hooked_get_cursor_pos(point: *mut POINT) -> BOOL {
    IN_FLIGHT.fetch_add(1, Ordering::AcqRel);
    let result = dispatch(point);
    IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
    result
}

unsafe fn dispatch(point: *mut POINT) -> BOOL {
    // Published before the detour goes live and only ever replaced by the restored entry.
    let trampoline = TRAMPOLINE.load(Ordering::Acquire);
    let Some(original) = std::mem::transmute::<usize, Option<GetCursorPosFn>>(trampoline) else {
        return FALSE;
    };

    let channel = CHANNEL.load(Ordering::Acquire).as_ref();
    let out = point.cast::<Point>().as_mut();

    let ok = cursor::get_cursor_pos(out, channel, &Win32WindowSpace, |out| {
        let raw = out.map_or(null_mut(), |p| (p as *mut Point).cast::<POINT>());
        original(raw).as_bool()
    });
    BOOL::from(ok)
}
