//! Controller writes, payload logic reads: the cursor replacement driven through a real
//! control channel segment.

use hook::cursor::{get_cursor_pos, synthetic_position};
use hook::{Point, WindowSpace};
use shared::{ChannelReader, ChannelWriter, SEGMENT_SIZE};

const WINDOW: isize = 0x1000;

struct OffsetWindow;

impl WindowSpace for OffsetWindow {
    fn is_window(&self, window: isize) -> bool {
        window == WINDOW
    }

    fn client_to_screen(&self, _window: isize, point: Point) -> Option<Point> {
        Some(Point {
            x: point.x + 50,
            y: point.y + 50,
        })
    }
}

fn real_cursor(out: Option<&mut Point>) -> bool {
    match out {
        Some(out) => {
            *out = Point { x: -3, y: 11 };
            true
        }
        None => false,
    }
}

fn query(reader: &ChannelReader) -> Point {
    let mut out = Point::default();
    assert!(get_cursor_pos(
        Some(&mut out),
        Some(reader),
        &OffsetWindow,
        real_cursor
    ));
    out
}

#[test]
fn aim_and_release_round_trip_through_segment() {
    let name = format!("Local\\bgctl-redirect-test-{}", std::process::id());
    let writer = ChannelWriter::create(&name, SEGMENT_SIZE).unwrap();
    writer.set_owner_window(WINDOW);
    writer.set_owner_pid(std::process::id());

    let reader = ChannelReader::attach(&name).unwrap();
    assert_eq!(reader.owner_pid(), std::process::id());

    // Fresh channel: passthrough.
    assert_eq!(query(&reader), Point { x: -3, y: 11 });

    writer.aim(100, 200);
    assert_eq!(query(&reader), Point { x: 150, y: 250 });

    writer.aim(0, 0);
    assert_eq!(
        synthetic_position(Some(&reader), &OffsetWindow),
        Some(Point { x: 50, y: 50 })
    );

    writer.release();
    assert_eq!(query(&reader), Point { x: -3, y: 11 });
}

#[test]
fn reader_survives_writer_drop() {
    let name = format!("Local\\bgctl-redirect-drop-{}", std::process::id());
    let writer = ChannelWriter::create(&name, SEGMENT_SIZE).unwrap();
    writer.set_owner_window(WINDOW);
    writer.aim(1, 1);
    let reader = ChannelReader::attach(&name).unwrap();
    drop(writer);

    // The mapping stays valid for the reader; it keeps reporting the last state.
    assert_eq!(query(&reader), Point { x: 51, y: 51 });
}
