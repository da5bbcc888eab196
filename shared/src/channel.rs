//! Writer and reader ends of the control channel.

use crate::segment::Segment;
use crate::{ChannelError, ControlRecord, PROTOCOL_VERSION, SEGMENT_SIZE};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Plain copy of the record's fields. Each field is read independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSnapshot {
    pub protocol_version: u32,
    pub enabled: bool,
    pub target_x: i32,
    pub target_y: i32,
    pub owner_window: isize,
    pub owner_pid: u32,
}

fn snapshot(record: &ControlRecord) -> ControlSnapshot {
    ControlSnapshot {
        protocol_version: record.protocol_version.load(Ordering::Acquire),
        enabled: record.enabled.load(Ordering::Acquire) != 0,
        target_x: record.target_x.load(Ordering::Acquire),
        target_y: record.target_y.load(Ordering::Acquire),
        owner_window: record.owner_window.load(Ordering::Acquire),
        owner_pid: record.owner_pid.load(Ordering::Acquire),
    }
}

/// Controller end of the channel. Creates and owns the segment.
///
/// The writer is expected to be driven from a single thread. Dropping it releases the
/// controller's handle; the segment vanishes once the payload detaches too.
pub struct ChannelWriter {
    segment: Segment,
}

impl ChannelWriter {
    /// Create and zero-initialize the segment `name` of `size` bytes.
    ///
    /// If the name is already in use by a peer that wrote a different protocol version the
    /// call fails with [`ChannelError::Incompatible`].
    pub fn create(name: &str, size: usize) -> Result<Self, ChannelError> {
        if size < SEGMENT_SIZE {
            return Err(ChannelError::TooSmall {
                requested: size,
                required: SEGMENT_SIZE,
            });
        }

        let (mut segment, existed) = Segment::create(name, size)?;

        if existed {
            let found = segment.record().protocol_version.load(Ordering::Acquire);
            if found != 0 && found != PROTOCOL_VERSION {
                warn!(name, found, "Control channel name held by an incompatible peer");
                segment.leave_backing();
                return Err(ChannelError::Incompatible {
                    name: name.to_string(),
                    found,
                });
            }
            debug!(name, "Reusing existing control channel segment");
        }

        // SAFETY: the view spans at least SEGMENT_SIZE writable bytes and no reference into
        // it has been handed out by this writer yet.
        unsafe { std::ptr::write_bytes(segment.as_ptr(), 0, SEGMENT_SIZE) };
        segment
            .record()
            .protocol_version
            .store(PROTOCOL_VERSION, Ordering::Release);

        info!(name, version = PROTOCOL_VERSION, "Control channel created");
        Ok(Self { segment })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    fn record(&self) -> &ControlRecord {
        self.segment.record()
    }

    /// Write the client-space target coordinates. Does not touch `enabled`.
    pub fn set_target(&self, x: i32, y: i32) {
        let record = self.record();
        record.target_x.store(x, Ordering::Release);
        record.target_y.store(y, Ordering::Release);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.record()
            .enabled
            .store(i32::from(enabled), Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.record().enabled.load(Ordering::Acquire) != 0
    }

    /// Point the synthetic cursor at `(x, y)`.
    ///
    /// Clears `enabled`, writes the coordinates, then sets `enabled`, so a concurrent reader
    /// never pairs the new flag with stale coordinates.
    pub fn aim(&self, x: i32, y: i32) {
        self.set_enabled(false);
        self.set_target(x, y);
        self.set_enabled(true);
    }

    /// Return the intercepted function to passthrough.
    pub fn release(&self) {
        self.set_enabled(false);
    }

    pub fn target(&self) -> (i32, i32) {
        let record = self.record();
        (
            record.target_x.load(Ordering::Acquire),
            record.target_y.load(Ordering::Acquire),
        )
    }

    pub fn set_owner_window(&self, window: isize) {
        self.record().owner_window.store(window, Ordering::Release);
    }

    pub fn owner_window(&self) -> isize {
        self.record().owner_window.load(Ordering::Acquire)
    }

    pub fn set_owner_pid(&self, pid: u32) {
        self.record().owner_pid.store(pid, Ordering::Release);
    }

    pub fn owner_pid(&self) -> u32 {
        self.record().owner_pid.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        snapshot(self.record())
    }
}

/// Payload end of the channel. Read-only view of a segment created by the controller.
///
/// Safe to share between any number of threads; every read is a single atomic load.
pub struct ChannelReader {
    segment: Segment,
}

impl ChannelReader {
    /// Attach to the existing segment `name`.
    ///
    /// Fails if the segment does not exist, or if its protocol version differs from
    /// [`PROTOCOL_VERSION`]. On failure every handle opened along the way is released.
    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        let segment = Segment::open(name)?;

        let found = segment.record().protocol_version.load(Ordering::Acquire);
        if found != PROTOCOL_VERSION {
            warn!(name, found, expected = PROTOCOL_VERSION, "Rejecting control channel");
            return Err(ChannelError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found,
            });
        }

        debug!(name, "Attached to control channel");
        Ok(Self { segment })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    fn record(&self) -> &ControlRecord {
        self.segment.record()
    }

    pub fn enabled(&self) -> bool {
        self.record().enabled.load(Ordering::Acquire) != 0
    }

    pub fn target(&self) -> (i32, i32) {
        let record = self.record();
        (
            record.target_x.load(Ordering::Acquire),
            record.target_y.load(Ordering::Acquire),
        )
    }

    pub fn owner_window(&self) -> isize {
        self.record().owner_window.load(Ordering::Acquire)
    }

    pub fn owner_pid(&self) -> u32 {
        self.record().owner_pid.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        snapshot(self.record())
    }
}
