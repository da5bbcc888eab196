//! Frame Capture Pipeline: turns the compositor's asynchronous per-window frame stream into a
//! synchronous "latest frame" call that works while the window is occluded or minimized.

use std::time::Duration;
use thiserror::Error;

pub mod mailbox;
pub mod staging;
mod wgc;

pub use mailbox::LatestFrame;
pub use staging::{pack_rows, StagingCache};
pub use wgc::CaptureSession;

/// Blue, green, red, alpha.
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("window capture is not supported on this system")]
    Unsupported,

    #[error("capture window {0:#x} is no longer valid")]
    InvalidWindow(isize),

    #[error("no frame arrived within {waited_ms} ms")]
    NoFrame { waited_ms: u64 },

    #[error("failed to create capture device: {0}")]
    Device(String),

    #[error("failed to start capture session: {0}")]
    Session(String),

    #[error("failed to read back frame: {0}")]
    Staging(String),

    #[error("capture session is closed")]
    Closed,
}

/// Bounded poll used by [`CaptureSession::capture`] while waiting for a new frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    pub wait: Duration,
    pub poll: Duration,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(100),
            poll: Duration::from_millis(10),
        }
    }
}

/// A running capture of one window.
pub trait FrameSource: Sized {
    fn start(window: isize, timing: FrameTiming) -> Result<Self, CaptureError>;

    /// The latest frame, waiting up to the timing's bound for a fresh one.
    fn capture(&mut self) -> Result<CaptureFrame, CaptureError>;

    /// Release every capture resource. Idempotent.
    fn stop(&mut self);
}

impl FrameSource for CaptureSession {
    fn start(window: isize, timing: FrameTiming) -> Result<Self, CaptureError> {
        CaptureSession::start(window, timing)
    }

    fn capture(&mut self) -> Result<CaptureFrame, CaptureError> {
        CaptureSession::capture(self)
    }

    fn stop(&mut self) {
        CaptureSession::stop(self)
    }
}

/// An owned, tightly packed BGRA image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl CaptureFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(CaptureError::Staging(format!(
                "{width}x{height} frame needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// BGRA bytes of the pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        self.data[at..at + BYTES_PER_PIXEL].try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(CaptureFrame::new(2, 2, vec![0; 15]).is_err());
        assert!(CaptureFrame::new(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn pixel_indexes_row_major_bgra() {
        let data: Vec<u8> = (0..16).collect();
        let frame = CaptureFrame::new(2, 2, data).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([0, 1, 2, 3]));
        assert_eq!(frame.pixel(1, 1), Some([12, 13, 14, 15]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn default_timing_polls_for_a_tenth_of_a_second() {
        let timing = FrameTiming::default();
        assert_eq!(timing.wait, Duration::from_millis(100));
        assert_eq!(timing.poll, Duration::from_millis(10));
    }

    #[cfg(not(windows))]
    #[test]
    fn session_reports_unsupported_off_windows() {
        assert!(!CaptureSession::is_supported());
        assert!(matches!(
            CaptureSession::start(0x10, FrameTiming::default()),
            Err(CaptureError::Unsupported)
        ));
    }
}
