//! Control channel protocol shared by the controller and the injected payload.
//!
//! The channel is a single fixed-layout [`ControlRecord`] living in a named shared memory
//! segment. The controller creates it ([`ChannelWriter`]), the payload inside the target
//! process attaches to it ([`ChannelReader`]). Fields are read and written independently;
//! there is no multi-field transaction.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicU32};

mod channel;
mod error;
mod segment;

pub use channel::{ChannelReader, ChannelWriter, ControlSnapshot};
pub use error::ChannelError;

/// Shared memory segment identifier.
/// Using Local\ namespace to avoid requiring administrator privileges.
pub const CHANNEL_NAME: &str = "Local\\BgCtl_ControlChannel";

/// Layout version of [`ControlRecord`]. Readers reject any other value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Bytes reserved at the tail of the record for forward-compatible fields.
pub const RESERVED_LEN: usize = 32;

/// Size of the record as laid out on the wire (byte-packed, native byte order).
pub const RECORD_WIRE_SIZE: usize = offset_of!(ControlRecord, reserved) + RESERVED_LEN;

/// Size requested for the segment. Covers the wire record plus any tail alignment.
pub const SEGMENT_SIZE: usize = size_of::<ControlRecord>();

/// The only entity in the control channel.
///
/// Every scalar sits at the offset a byte-packed record would give it, so the layout is
/// identical to the packed wire format on both 32- and 64-bit targets. Scalars are atomics
/// because the record is read by arbitrary threads of the target while the controller
/// writes it field by field.
#[repr(C)]
pub struct ControlRecord {
    /// Written once at creation, never mutated afterwards.
    pub protocol_version: AtomicU32,
    /// Win32 `BOOL`: non-zero means the intercepted function reports the synthetic position.
    pub enabled: AtomicI32,
    /// Client-space x coordinate of the synthetic pointer.
    pub target_x: AtomicI32,
    /// Client-space y coordinate of the synthetic pointer.
    pub target_y: AtomicI32,
    /// Window handle used to convert client coordinates to screen coordinates.
    pub owner_window: AtomicIsize,
    /// Process id recorded by the controller for liveness checks.
    pub owner_pid: AtomicU32,
    pub reserved: [u8; RESERVED_LEN],
}

const _: () = {
    assert!(offset_of!(ControlRecord, protocol_version) == 0);
    assert!(offset_of!(ControlRecord, enabled) == 4);
    assert!(offset_of!(ControlRecord, target_x) == 8);
    assert!(offset_of!(ControlRecord, target_y) == 12);
    assert!(offset_of!(ControlRecord, owner_window) == 16);
    assert!(offset_of!(ControlRecord, owner_pid) == 16 + size_of::<isize>());
    assert!(offset_of!(ControlRecord, reserved) == 20 + size_of::<isize>());
    assert!(SEGMENT_SIZE >= RECORD_WIRE_SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_matches_packed_layout() {
        // version + enabled + x + y + hwnd + pid + reserved
        let packed = 4 + 4 + 4 + 4 + size_of::<isize>() + 4 + RESERVED_LEN;
        assert_eq!(RECORD_WIRE_SIZE, packed);
    }

    #[test]
    fn segment_size_covers_alignment_tail() {
        assert_eq!(SEGMENT_SIZE % std::mem::align_of::<ControlRecord>(), 0);
        assert!(SEGMENT_SIZE - RECORD_WIRE_SIZE < std::mem::align_of::<ControlRecord>());
    }
}
