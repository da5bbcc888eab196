//! Interception seam: the hot-patch primitive behind a trait, and the per-process hook state
//! machine built on top of it.

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("entry point at {address:#x} is too short to patch")]
    TooShort { address: u64 },

    #[error("undecodable instruction at {address:#x}")]
    Undecodable { address: u64 },

    #[error("failed to relocate prologue: {0}")]
    Relocation(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("memory operation failed: {0}")]
    Memory(String),

    #[error("failed to suspend threads: {0}")]
    Threads(String),

    #[error("no detour installed")]
    NotInstalled,

    #[error("a detour is already installed")]
    AlreadyInstalled,
}

/// A hot-patch primitive able to redirect one function entry point.
///
/// Implementations own all patching safety concerns (instruction boundaries, concurrently
/// executing threads, cache coherency). Callers only sequence the four operations.
pub trait Interceptor {
    /// Prepare a detour from `target` to `detour` without activating it.
    ///
    /// Returns the address of a trampoline that behaves like the unpatched `target`.
    ///
    /// # Safety
    /// `target` must be the entry point of a live function and `detour` a function with the
    /// same signature and calling convention.
    unsafe fn install(&mut self, target: usize, detour: usize) -> Result<usize, HookError>;

    /// Redirect every caller of the target to the detour.
    fn enable(&mut self) -> Result<(), HookError>;

    /// Restore the original entry point; the trampoline stays valid.
    fn disable(&mut self) -> Result<(), HookError>;

    /// Disable if needed and release the trampoline. No-op when nothing is installed.
    fn remove(&mut self) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Uninitialized,
    Hooked { target: usize, trampoline: usize },
}

/// Hook lifecycle for the one intercepted function: `Uninitialized -> Hooked -> Uninitialized`.
pub struct HookSession<I: Interceptor> {
    interceptor: I,
    state: HookState,
}

impl<I: Interceptor> HookSession<I> {
    pub fn new(interceptor: I) -> Self {
        Self {
            interceptor,
            state: HookState::Uninitialized,
        }
    }

    pub fn state(&self) -> HookState {
        self.state
    }

    pub fn is_hooked(&self) -> bool {
        matches!(self.state, HookState::Hooked { .. })
    }

    /// Install and enable the detour. Idempotent while hooked.
    ///
    /// `publish` receives the trampoline after installation and before the detour goes live,
    /// so the detour can always reach the original function.
    ///
    /// # Safety
    /// See [`Interceptor::install`].
    pub unsafe fn hook(
        &mut self,
        target: usize,
        detour: usize,
        publish: impl FnOnce(usize),
    ) -> Result<usize, HookError> {
        if let HookState::Hooked { trampoline, .. } = self.state {
            return Ok(trampoline);
        }

        let trampoline = self.interceptor.install(target, detour)?;
        publish(trampoline);

        if let Err(err) = self.interceptor.enable() {
            warn!(error = %err, "Enabling detour failed, removing it");
            if let Err(err) = self.interceptor.remove() {
                warn!(error = %err, "Removing half-installed detour failed");
            }
            return Err(err);
        }

        self.state = HookState::Hooked { target, trampoline };
        info!(target = format_args!("{target:#x}"), trampoline = format_args!("{trampoline:#x}"), "Detour enabled");
        Ok(trampoline)
    }

    /// Tear down the detour. Safe to call in any state, any number of times.
    pub fn unhook(&mut self) -> bool {
        self.unhook_with(|_| {}, || true)
    }

    /// Tear down the detour in three steps: disable it, hand the restored entry point to
    /// `restored` and run `drain`, then release the trampoline.
    ///
    /// From `restored` on, the target entry point is the safe passthrough for late callers of
    /// the detour. `drain` returns false when callers may still be running inside the detour;
    /// the trampoline is then left allocated. If disabling fails the patch stays live and
    /// nothing is released. Returns whether everything was released.
    pub fn unhook_with(
        &mut self,
        restored: impl FnOnce(usize),
        drain: impl FnOnce() -> bool,
    ) -> bool {
        let HookState::Hooked { target, .. } = self.state else {
            return true;
        };
        self.state = HookState::Uninitialized;

        if let Err(err) = self.interceptor.disable() {
            warn!(error = %err, "Disabling detour failed, leaving it in place");
            return false;
        }
        restored(target);

        let drained = drain();
        if drained {
            if let Err(err) = self.interceptor.remove() {
                warn!(error = %err, "Removing detour failed");
            }
        } else {
            warn!("Detour still in use, leaving trampoline in place");
        }

        debug!(drained, "Detour torn down");
        drained
    }
}

impl<I: Interceptor> Drop for HookSession<I> {
    fn drop(&mut self) {
        self.unhook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Script {
        calls: Vec<&'static str>,
        fail_install: bool,
        fail_enable: bool,
        fail_disable: bool,
    }

    struct FakeInterceptor(Rc<RefCell<Script>>);

    impl Interceptor for FakeInterceptor {
        unsafe fn install(&mut self, _target: usize, _detour: usize) -> Result<usize, HookError> {
            let mut script = self.0.borrow_mut();
            script.calls.push("install");
            if script.fail_install {
                return Err(HookError::TooShort { address: 0x1000 });
            }
            Ok(0x2000)
        }

        fn enable(&mut self) -> Result<(), HookError> {
            let mut script = self.0.borrow_mut();
            script.calls.push("enable");
            if script.fail_enable {
                return Err(HookError::Threads("denied".into()));
            }
            Ok(())
        }

        fn disable(&mut self) -> Result<(), HookError> {
            let mut script = self.0.borrow_mut();
            script.calls.push("disable");
            if script.fail_disable {
                return Err(HookError::Threads("denied".into()));
            }
            Ok(())
        }

        fn remove(&mut self) -> Result<(), HookError> {
            self.0.borrow_mut().calls.push("remove");
            Ok(())
        }
    }

    fn session(script: Script) -> (HookSession<FakeInterceptor>, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(script));
        (HookSession::new(FakeInterceptor(script.clone())), script)
    }

    #[test]
    fn hook_publishes_trampoline_before_enable() {
        let (mut session, script) = session(Script::default());
        let published = RefCell::new(None);

        let trampoline = unsafe {
            session.hook(0x1000, 0x3000, |t| {
                assert_eq!(script.borrow().calls, ["install"]);
                *published.borrow_mut() = Some(t);
            })
        }
        .unwrap();

        assert_eq!(trampoline, 0x2000);
        assert_eq!(*published.borrow(), Some(0x2000));
        assert_eq!(
            session.state(),
            HookState::Hooked {
                target: 0x1000,
                trampoline: 0x2000
            }
        );
    }

    #[test]
    fn hook_is_idempotent() {
        let (mut session, script) = session(Script::default());
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();
        assert_eq!(script.borrow().calls, ["install", "enable"]);
    }

    #[test]
    fn failed_enable_removes_and_stays_uninitialized() {
        let (mut session, script) = session(Script {
            fail_enable: true,
            ..Script::default()
        });
        assert!(unsafe { session.hook(0x1000, 0x3000, |_| {}) }.is_err());
        assert_eq!(session.state(), HookState::Uninitialized);
        assert_eq!(script.borrow().calls, ["install", "enable", "remove"]);

        assert!(session.unhook());
        assert_eq!(script.borrow().calls.len(), 3);
    }

    #[test]
    fn failed_install_leaves_nothing_to_tear_down() {
        let (mut session, script) = session(Script {
            fail_install: true,
            ..Script::default()
        });
        let mut published = false;
        assert!(unsafe { session.hook(0x1000, 0x3000, |_| published = true) }.is_err());
        assert!(!published);
        assert!(session.unhook());
        assert_eq!(script.borrow().calls, ["install"]);
    }

    #[test]
    fn unhook_disables_drains_then_removes() {
        let (mut session, script) = session(Script::default());
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();

        let drained = session.unhook_with(
            |entry| {
                assert_eq!(entry, 0x1000);
                script.borrow_mut().calls.push("restored");
            },
            || {
                script.borrow_mut().calls.push("drain");
                true
            },
        );

        assert!(drained);
        assert_eq!(
            script.borrow().calls,
            ["install", "enable", "disable", "restored", "drain", "remove"]
        );
        assert_eq!(session.state(), HookState::Uninitialized);
        assert!(session.unhook());
        assert_eq!(script.borrow().calls.len(), 6);
    }

    #[test]
    fn undrained_unhook_keeps_trampoline() {
        let (mut session, script) = session(Script::default());
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();
        let mut passthrough = None;
        assert!(!session.unhook_with(|entry| passthrough = Some(entry), || false));
        assert_eq!(passthrough, Some(0x1000));
        assert!(!script.borrow().calls.contains(&"remove"));
        assert!(!session.is_hooked());
    }

    #[test]
    fn failed_disable_keeps_trampoline_and_entry_hidden() {
        let (mut session, script) = session(Script {
            fail_disable: true,
            ..Script::default()
        });
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();

        let mut restored = false;
        let mut drained = false;
        assert!(!session.unhook_with(|_| restored = true, || {
            drained = true;
            true
        }));
        assert!(!restored);
        assert!(!drained);
        assert_eq!(script.borrow().calls, ["install", "enable", "disable"]);

        drop(session);
        assert_eq!(script.borrow().calls.len(), 3);
    }

    #[test]
    fn drop_tears_down_hooked_session() {
        let (mut session, script) = session(Script::default());
        unsafe { session.hook(0x1000, 0x3000, |_| {}) }.unwrap();
        drop(session);
        assert_eq!(
            script.borrow().calls,
            ["install", "enable", "disable", "remove"]
        );
    }
}
