//! Replacement logic for `GetCursorPos`.
//!
//! While the control channel is enabled and names a live window, every caller in the process
//! sees the channel's client-space target converted to screen space. In any other state the
//! call goes to the original function unchanged.

use shared::ChannelReader;

/// Layout-compatible with Win32 `POINT`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// The window queries the replacement depends on.
pub trait WindowSpace {
    fn is_window(&self, window: isize) -> bool;

    /// Convert client coordinates of `window` to screen coordinates.
    fn client_to_screen(&self, window: isize, point: Point) -> Option<Point>;
}

/// Screen position to report instead of the real cursor, if any.
pub fn synthetic_position<W: WindowSpace>(
    channel: Option<&ChannelReader>,
    windows: &W,
) -> Option<Point> {
    let channel = channel?;
    if !channel.enabled() {
        return None;
    }

    let window = channel.owner_window();
    if window == 0 || !windows.is_window(window) {
        return None;
    }

    let (x, y) = channel.target();
    windows.client_to_screen(window, Point { x, y })
}

/// Body of the detour. `original` is the unpatched function.
///
/// A null output pointer is always forwarded so the caller gets the original failure code.
pub fn get_cursor_pos<W, F>(
    out: Option<&mut Point>,
    channel: Option<&ChannelReader>,
    windows: &W,
    original: F,
) -> bool
where
    W: WindowSpace,
    F: FnOnce(Option<&mut Point>) -> bool,
{
    let Some(out) = out else {
        return original(None);
    };

    match synthetic_position(channel, windows) {
        Some(point) => {
            *out = point;
            true
        }
        None => original(Some(out)),
    }
}

#[cfg(windows)]
pub use win32::Win32WindowSpace;

#[cfg(windows)]
mod win32 {
    use super::{Point, WindowSpace};
    use windows::Win32::Foundation::*;
    use windows::Win32::Graphics::Gdi::ClientToScreen;
    use windows::Win32::UI::WindowsAndMessaging::IsWindow;

    pub struct Win32WindowSpace;

    impl WindowSpace for Win32WindowSpace {
        fn is_window(&self, window: isize) -> bool {
            unsafe { IsWindow(Some(HWND(window as *mut _))) }.as_bool()
        }

        fn client_to_screen(&self, window: isize, point: Point) -> Option<Point> {
            let mut converted = POINT {
                x: point.x,
                y: point.y,
            };
            let ok = unsafe { ClientToScreen(HWND(window as *mut _), &mut converted) }.as_bool();
            ok.then_some(Point {
                x: converted.x,
                y: converted.y,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ChannelWriter, SEGMENT_SIZE};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    const WINDOW: isize = 0x4242;
    const REAL: Point = Point { x: 7, y: 9 };

    struct FakeWindows {
        origin: Point,
        alive: bool,
        convertible: bool,
    }

    impl Default for FakeWindows {
        fn default() -> Self {
            Self {
                origin: Point { x: 50, y: 50 },
                alive: true,
                convertible: true,
            }
        }
    }

    impl WindowSpace for FakeWindows {
        fn is_window(&self, window: isize) -> bool {
            self.alive && window == WINDOW
        }

        fn client_to_screen(&self, _window: isize, point: Point) -> Option<Point> {
            self.convertible.then_some(Point {
                x: point.x + self.origin.x,
                y: point.y + self.origin.y,
            })
        }
    }

    fn channel() -> (ChannelWriter, ChannelReader) {
        let name = format!(
            "Local\\bgctl-cursor-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let writer = ChannelWriter::create(&name, SEGMENT_SIZE).unwrap();
        writer.set_owner_window(WINDOW);
        let reader = ChannelReader::attach(&name).unwrap();
        (writer, reader)
    }

    fn call(reader: Option<&ChannelReader>, windows: &FakeWindows) -> (bool, Point, bool) {
        let mut out = Point::default();
        let mut forwarded = false;
        let ok = get_cursor_pos(Some(&mut out), reader, windows, |out| {
            forwarded = true;
            *out.unwrap() = REAL;
            true
        });
        (ok, out, forwarded)
    }

    #[test]
    fn enabled_channel_reports_target_in_screen_space() {
        let (writer, reader) = channel();
        writer.aim(100, 200);

        let (ok, out, forwarded) = call(Some(&reader), &FakeWindows::default());
        assert!(ok);
        assert!(!forwarded);
        assert_eq!(out, Point { x: 150, y: 250 });
    }

    #[test]
    fn disabled_channel_passes_through() {
        let (writer, reader) = channel();
        writer.set_target(100, 200);

        assert_eq!(call(Some(&reader), &FakeWindows::default()), (true, REAL, true));
    }

    #[test]
    fn release_returns_to_passthrough() {
        let (writer, reader) = channel();
        writer.aim(1, 2);
        writer.release();
        assert_eq!(call(Some(&reader), &FakeWindows::default()), (true, REAL, true));
    }

    #[test]
    fn missing_channel_passes_through() {
        assert_eq!(call(None, &FakeWindows::default()), (true, REAL, true));
    }

    #[test]
    fn dead_window_passes_through() {
        let (writer, reader) = channel();
        writer.aim(100, 200);
        let windows = FakeWindows {
            alive: false,
            ..FakeWindows::default()
        };
        assert_eq!(call(Some(&reader), &windows), (true, REAL, true));
    }

    #[test]
    fn zero_window_passes_through() {
        let (writer, reader) = channel();
        writer.set_owner_window(0);
        writer.aim(100, 200);
        assert_eq!(call(Some(&reader), &FakeWindows::default()), (true, REAL, true));
    }

    #[test]
    fn failed_conversion_passes_through() {
        let (writer, reader) = channel();
        writer.aim(100, 200);
        let windows = FakeWindows {
            convertible: false,
            ..FakeWindows::default()
        };
        assert_eq!(call(Some(&reader), &windows), (true, REAL, true));
    }

    #[test]
    fn null_output_is_forwarded_even_when_enabled() {
        let (writer, reader) = channel();
        writer.aim(100, 200);

        let mut saw_null = false;
        let ok = get_cursor_pos(None, Some(&reader), &FakeWindows::default(), |out| {
            saw_null = out.is_none();
            false
        });
        assert!(!ok);
        assert!(saw_null);
    }

    #[test]
    fn every_thread_sees_the_same_target() {
        let (writer, reader) = channel();
        writer.aim(10, 20);
        let reader = Arc::new(reader);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reader = reader.clone();
                std::thread::spawn(move || {
                    synthetic_position(Some(&reader), &FakeWindows::default())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(Point { x: 60, y: 70 }));
        }
    }
}
