//! Code Injector: loads the payload module into a target process.

use crate::error::ErrorClass;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::process::Win32Process;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("window {window:#x} has no owning process")]
    WindowNotFound { window: isize },

    #[error("payload {} not found", path.display())]
    PayloadMissing { path: PathBuf },

    #[error("access denied opening process {pid}: {message}")]
    AccessDenied { pid: u32, message: String },

    #[error("failed to allocate memory in process {pid}: {message}")]
    AllocFailed { pid: u32, message: String },

    #[error("failed to write memory in process {pid}: {message}")]
    WriteFailed { pid: u32, message: String },

    #[error("process {pid} does not match the controller's bitness")]
    BitnessMismatch { pid: u32 },

    #[error("failed to resolve {symbol} in process {pid}")]
    SymbolNotFound { pid: u32, symbol: &'static str },

    #[error("failed to start remote thread in process {pid}: {message}")]
    ThreadFailed { pid: u32, message: String },

    #[error("payload load in process {pid} did not finish within {timeout_ms} ms")]
    Timeout { pid: u32, timeout_ms: u64 },

    #[error("process {pid} failed to load the payload")]
    LoadFailed { pid: u32 },

    #[error("process {pid} exited during injection")]
    ProcessExited { pid: u32 },

    #[error("injection is not supported on this platform")]
    Unsupported,
}

impl InjectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ProcessNotFound { .. }
            | Self::WindowNotFound { .. }
            | Self::PayloadMissing { .. }
            | Self::ProcessExited { .. } => ErrorClass::Discovery,
            Self::AccessDenied { .. }
            | Self::AllocFailed { .. }
            | Self::WriteFailed { .. }
            | Self::ThreadFailed { .. } => ErrorClass::Privilege,
            Self::Timeout { .. } | Self::LoadFailed { .. } => ErrorClass::Injection,
            Self::BitnessMismatch { .. } | Self::SymbolNotFound { .. } | Self::Unsupported => {
                ErrorClass::Unsupported
            }
        }
    }
}

/// OS process and window primitives the injector and target discovery are built on.
pub trait ProcessApi {
    /// Pid of the first running process with this executable name, ignoring case.
    fn find_process(&self, name: &str) -> Option<u32>;

    /// First top-level window of `pid` with exactly this class name.
    fn find_window(&self, pid: u32, class: &str) -> Option<isize>;

    fn is_window(&self, window: isize) -> bool;

    /// Owning process of a top-level window.
    fn window_pid(&self, window: isize) -> Option<u32>;

    /// Running and not yet exited. A recycled pid of an exited process reports false.
    fn is_alive(&self, pid: u32) -> bool;

    /// Make `pid` load `payload` and wait up to `timeout` for the loader to return.
    fn load_library(&self, pid: u32, payload: &Path, timeout: Duration) -> Result<(), InjectError>;
}

/// The one process an [`Injector`] has worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionSession {
    pub pid: u32,
    pub succeeded: bool,
}

pub struct Injector<P: ProcessApi = Win32Process> {
    api: P,
    timeout: Duration,
    session: Option<InjectionSession>,
}

impl Injector<Win32Process> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_api(Win32Process, timeout)
    }
}

impl<P: ProcessApi> Injector<P> {
    pub fn with_api(api: P, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            session: None,
        }
    }

    pub fn api(&self) -> &P {
        &self.api
    }

    pub fn session(&self) -> Option<InjectionSession> {
        self.session
    }

    /// Pid of a process the payload was successfully loaded into.
    pub fn injected_pid(&self) -> Option<u32> {
        self.session.filter(|s| s.succeeded).map(|s| s.pid)
    }

    pub fn is_process_alive(&self, pid: u32) -> bool {
        pid != 0 && self.api.is_alive(pid)
    }

    /// Inject into the process owning `window`.
    pub fn inject(&mut self, window: isize, payload: &Path) -> Result<(), InjectError> {
        let pid = self
            .api
            .window_pid(window)
            .ok_or(InjectError::WindowNotFound { window })?;
        self.inject_pid(pid, payload)
    }

    /// Inject into `pid`. A repeat call for the same live process succeeds without a second
    /// load.
    pub fn inject_pid(&mut self, pid: u32, payload: &Path) -> Result<(), InjectError> {
        if pid == 0 {
            return Err(InjectError::ProcessNotFound { pid });
        }

        if self.injected_pid() == Some(pid) {
            if self.api.is_alive(pid) {
                debug!(pid, "Payload already loaded");
                return Ok(());
            }
            self.session = None;
        }

        let payload = std::fs::canonicalize(payload).map_err(|_| InjectError::PayloadMissing {
            path: payload.to_path_buf(),
        })?;

        if !self.api.is_alive(pid) {
            return Err(InjectError::ProcessNotFound { pid });
        }

        self.session = Some(InjectionSession {
            pid,
            succeeded: false,
        });
        info!(pid, payload = %payload.display(), "Injecting payload");

        let loaded = self.api.load_library(pid, &payload, self.timeout);
        if !self.api.is_alive(pid) {
            warn!(pid, "Target exited during injection");
            return Err(InjectError::ProcessExited { pid });
        }
        loaded?;

        self.session = Some(InjectionSession {
            pid,
            succeeded: true,
        });
        info!(pid, "Payload loaded");
        Ok(())
    }

    /// Whether the injected process is still running. Forgets it once it has exited.
    pub fn is_valid(&mut self) -> bool {
        match self.injected_pid() {
            Some(pid) if self.api.is_alive(pid) => true,
            Some(pid) => {
                debug!(pid, "Injected process has exited");
                self.session = None;
                false
            }
            None => false,
        }
    }
}
