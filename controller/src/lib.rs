//! Controller side of background window automation.
//!
//! [`Controller`] is the only type an automation engine needs: it finds the target window,
//! creates the control channel the injected payload reads, optionally injects that payload, and
//! captures frames from the window even while it is occluded.
//!
//! ```no_run
//! use controller::{Controller, ControllerConfig, Target};
//!
//! let config = ControllerConfig::default();
//! let mut controller = Controller::new(Target::from_config(&config), config);
//! controller.connect()?;
//! controller.point_at(100, 200)?;
//! let frame = controller.screencap()?;
//! println!("{}x{}", frame.width, frame.height);
//! # Ok::<(), controller::ControllerError>(())
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod injector;
mod process;
pub mod window;

pub use capture::{CaptureError, CaptureFrame, CaptureSession, FrameSource, FrameTiming};
pub use config::{ConfigError, ControllerConfig, TargetConfig};
pub use error::{ControllerError, ErrorClass};
pub use injector::{InjectError, Injector, ProcessApi};

use shared::{ChannelWriter, SEGMENT_SIZE};
use tracing::{debug, info, warn};

/// How the controller finds its target window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A window handle the caller already owns.
    Window(isize),
    /// First window of the named process with the given class.
    Discover {
        process_name: String,
        window_class: String,
    },
}

impl Target {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::Discover {
            process_name: config.target.process_name.clone(),
            window_class: config.target.window_class.clone(),
        }
    }
}

/// Optional behaviors an automation engine may ask the controller for. None are offered, so
/// engines use their default input handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features(u64);

impl Features {
    pub const NONE: Self = Self(0);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Version and provenance of this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub profile: &'static str,
}

struct Connection<C> {
    window: isize,
    pid: u32,
    identity: String,
    channel: ChannelWriter,
    capture: C,
}

/// Synchronous facade over the channel, the injector and the capture pipeline.
///
/// Owns everything it creates. [`disconnect`](Self::disconnect), also run on drop, tears the
/// connection down exactly once and leaves the controller ready for another `connect`.
pub struct Controller<P: ProcessApi = injector::Win32Process, C: FrameSource = CaptureSession> {
    config: ControllerConfig,
    target: Target,
    injector: Injector<P>,
    connection: Option<Connection<C>>,
}

impl Controller {
    pub fn new(target: Target, config: ControllerConfig) -> Self {
        let injector = Injector::new(config.inject_timeout());
        Self::with_injector(target, config, injector)
    }
}

impl<P: ProcessApi, C: FrameSource> Controller<P, C> {
    pub fn with_injector(target: Target, config: ControllerConfig, injector: Injector<P>) -> Self {
        Self {
            config,
            target,
            injector,
            connection: None,
        }
    }

    pub fn build_info() -> BuildInfo {
        BuildInfo {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GIT_HASH"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
            profile: env!("BUILD_PROFILE"),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Resolve the target, create the control channel, inject the payload if one is
    /// configured and start capturing. Idempotent while connected.
    pub fn connect(&mut self) -> Result<(), ControllerError> {
        if self.connection.is_some() {
            return Ok(());
        }

        let build = Self::build_info();
        info!(version = build.version, git = build.git_hash, built = build.build_timestamp, "Connecting");

        self.config.validate()?;
        window::enable_dpi_awareness();

        let (window, pid) = self.resolve_target()?;
        info!(window = format_args!("{window:#x}"), pid, "Target resolved");

        let channel = ChannelWriter::create(&self.config.channel_name, SEGMENT_SIZE)?;
        channel.set_owner_window(window);
        channel.set_owner_pid(pid);

        if let Some(payload) = &self.config.payload_path {
            self.injector.inject_pid(pid, payload)?;
        }

        let capture = C::start(window, self.config.frame_timing())?;

        let identity = format!("bgctl-{pid}-{window:#x}");
        info!(identity = %identity, "Connected");
        self.connection = Some(Connection {
            window,
            pid,
            identity,
            channel,
            capture,
        });
        Ok(())
    }

    fn resolve_target(&self) -> Result<(isize, u32), ControllerError> {
        let api = self.injector.api();
        match &self.target {
            Target::Window(window) => {
                let window = *window;
                if !api.is_window(window) {
                    return Err(ControllerError::WindowNotFound(format!("{window:#x}")));
                }
                let pid = api
                    .window_pid(window)
                    .ok_or_else(|| ControllerError::WindowNotFound(format!("{window:#x}")))?;
                Ok((window, pid))
            }
            Target::Discover {
                process_name,
                window_class,
            } => {
                let pid = api
                    .find_process(process_name)
                    .ok_or_else(|| ControllerError::ProcessNotFound(process_name.clone()))?;
                debug!(process = %process_name, pid, "Process located");
                let window = api.find_window(pid, window_class).ok_or_else(|| {
                    ControllerError::WindowNotFound(format!("class {window_class} in pid {pid}"))
                })?;
                Ok((window, pid))
            }
        }
    }

    fn connection(&self) -> Result<&Connection<C>, ControllerError> {
        self.connection.as_ref().ok_or(ControllerError::NotConnected)
    }

    /// Stable identifier of the current connection.
    pub fn identity(&self) -> Result<&str, ControllerError> {
        Ok(&self.connection()?.identity)
    }

    pub fn window(&self) -> Result<isize, ControllerError> {
        Ok(self.connection()?.window)
    }

    /// Copy of the latest frame of the target window, tightly packed BGRA.
    pub fn screencap(&mut self) -> Result<CaptureFrame, ControllerError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ControllerError::NotConnected)?;
        Ok(connection.capture.capture()?)
    }

    /// Make the target read `(x, y)`, in its window's client coordinates, as the cursor
    /// position.
    pub fn point_at(&self, x: i32, y: i32) -> Result<(), ControllerError> {
        self.connection()?.channel.aim(x, y);
        Ok(())
    }

    /// Give the target its real cursor position back.
    pub fn release_pointer(&self) -> Result<(), ControllerError> {
        self.connection()?.channel.release();
        Ok(())
    }

    /// Whether the connected target process is still running.
    pub fn is_target_alive(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| self.injector.is_process_alive(c.pid))
    }

    /// Pid the payload was loaded into, if the process is still alive.
    pub fn injected_pid(&mut self) -> Option<u32> {
        self.injector.is_valid().then(|| self.injector.injected_pid()).flatten()
    }

    pub fn features(&self) -> Features {
        Features::NONE
    }

    pub fn click(&mut self, _x: i32, _y: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("click"))
    }

    pub fn swipe(
        &mut self,
        _x1: i32,
        _y1: i32,
        _x2: i32,
        _y2: i32,
        _duration_ms: u32,
    ) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("swipe"))
    }

    pub fn touch_down(&mut self, _contact: i32, _x: i32, _y: i32, _pressure: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("touch_down"))
    }

    pub fn touch_move(&mut self, _contact: i32, _x: i32, _y: i32, _pressure: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("touch_move"))
    }

    pub fn touch_up(&mut self, _contact: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("touch_up"))
    }

    pub fn click_key(&mut self, _key: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("click_key"))
    }

    pub fn input_text(&mut self, _text: &str) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("input_text"))
    }

    pub fn key_down(&mut self, _key: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("key_down"))
    }

    pub fn key_up(&mut self, _key: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("key_up"))
    }

    pub fn scroll(&mut self, _dx: i32, _dy: i32) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("scroll"))
    }

    pub fn start_app(&mut self, _intent: &str) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("start_app"))
    }

    pub fn stop_app(&mut self, _intent: &str) -> Result<(), ControllerError> {
        Err(ControllerError::Unimplemented("stop_app"))
    }

    /// Stop capturing, return the pointer to passthrough and close the channel. Idempotent.
    ///
    /// The payload stays loaded in the target; a later `connect` to the same process does not
    /// inject it again.
    pub fn disconnect(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        connection.capture.stop();
        connection.channel.release();
        if !self.injector.is_process_alive(connection.pid) {
            warn!(pid = connection.pid, "Target exited before disconnect");
        }
        info!(identity = %connection.identity, "Disconnected");
    }
}

impl<P: ProcessApi, C: FrameSource> Drop for Controller<P, C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
