//! Frame assembly and grab-session streaming behaviour
//!
//! Exercises frame completion and buffer reuse, packet-loss gap handling
//! with the line header, and a full grab over the scripted image transport.
//!
//! Run with: `cargo test --test frame_assembly`

use kirana_io::config::AcquisitionConfig;
use kirana_io::detector::DetectorDescriptor;
use kirana_io::frame::{FrameAssembler, FrameView};
use kirana_io::grabber::GrabSession;
use kirana_io::sink::{event_id, ImgSink};
use kirana_io::transport::MockImageTransport;
use kirana_io::wire::image::{encode_line_packet, ImagePacketHeader};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<Vec<u8>>>,
    events: Mutex<Vec<(u32, u32)>>,
}

impl ImgSink for RecordingSink {
    fn on_error(&self, _error_id: u32, _message: &str) {}
    fn on_event(&self, event_id: u32, data: u32) {
        self.events.lock().unwrap().push((event_id, data));
    }
    fn on_frame_ready(&self, frame: &FrameView<'_>) {
        self.frames.lock().unwrap().push(frame.data().to_vec());
    }
}

fn recording_sink() -> (Arc<RecordingSink>, Arc<dyn ImgSink>) {
    let sink = Arc::new(RecordingSink::default());
    let keeper: Arc<dyn ImgSink> = sink.clone();
    (sink, keeper)
}

#[test]
fn frame_completion_and_buffer_reuse() {
    let (sink, keeper) = recording_sink();
    let mut assembler = FrameAssembler::new(4);
    assembler.set_sink(Arc::downgrade(&keeper));
    assembler.start(1024, 16).unwrap();

    // Four full lines complete the first frame
    let first = vec![0xA5u8; 2048];
    for _ in 0..4 {
        assembler.add_line(&first, None);
    }
    assert_eq!(sink.frames.lock().unwrap().len(), 1);

    // Four more complete a second; the first frame's bytes must be gone
    let second = vec![0x5Au8; 2048];
    for _ in 0..4 {
        assembler.add_line(&second, None);
    }
    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].iter().all(|&b| b == 0xA5));
    assert!(
        frames[1].iter().all(|&b| b == 0x5A),
        "bytes of the first frame leaked into the second"
    );
}

#[test]
fn line_id_gap_produces_zero_filled_row() {
    let (sink, keeper) = recording_sink();
    let mut assembler = FrameAssembler::new(4);
    assembler.set_sink(Arc::downgrade(&keeper));
    assembler.start(1024, 16).unwrap();

    let line = vec![0xEEu8; 2048];
    assembler.add_line(&line, Some(0));
    assembler.add_line(&line, Some(1));
    assembler.add_line(&line, Some(3));

    // One loss event of one row
    assert_eq!(
        sink.events.lock().unwrap()[..],
        [(event_id::PACKET_LOSS, 1)]
    );

    // Frame completed: rows 0-1 data, row 2 zeroed, row 3 data, cursor
    // wrapped to zero
    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame[..2 * 2048].iter().all(|&b| b == 0xEE));
    assert!(frame[2 * 2048..3 * 2048].iter().all(|&b| b == 0));
    assert!(frame[3 * 2048..].iter().all(|&b| b == 0xEE));
    assert_eq!(assembler.current_line(), 0);

    let stats = assembler.stats();
    assert_eq!(
        stats.lines_received + stats.lines_skipped,
        stats.frames_emitted * 4 + assembler.current_line() as u64
    );
}

#[test]
fn header_mode_grab_assembles_around_lost_packets() {
    let (sink, keeper) = recording_sink();

    let mut session = GrabSession::with_config(&AcquisitionConfig {
        image_timeout_ms: 5,
        lines_per_frame: 4,
        header_mode: true,
    });
    session.set_sink(Arc::downgrade(&keeper));

    let descriptor = DetectorDescriptor {
        pixel_count: 16,
        pixel_depth: 16,
        ..Default::default()
    };

    let transport = MockImageTransport::new();
    let payload = vec![0x33u8; 32];
    for line_id in [0u16, 1, 3] {
        let header = ImagePacketHeader {
            line_id,
            ..Default::default()
        };
        transport.push(encode_line_packet(&header, &payload));
    }

    session
        .open_with_transport(&descriptor, Box::new(transport))
        .unwrap();
    session.snap().unwrap();
    session.close();

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame[..2 * 32].iter().all(|&b| b == 0x33));
    assert!(frame[2 * 32..3 * 32].iter().all(|&b| b == 0));
    assert!(frame[3 * 32..].iter().all(|&b| b == 0x33));

    let events = sink.events.lock().unwrap();
    assert!(events.contains(&(event_id::PACKET_LOSS, 1)));
}

#[test]
fn oversized_gap_emits_partial_frame() {
    let (sink, keeper) = recording_sink();
    let mut assembler = FrameAssembler::new(4);
    assembler.set_sink(Arc::downgrade(&keeper));
    assembler.start(16, 16).unwrap();

    let line = vec![0x10u8; 32];
    assembler.add_line(&line, Some(0));
    assembler.add_line(&line, Some(1000));

    // Partial frame flushed, then the late line opens the next frame
    assert_eq!(sink.frames.lock().unwrap().len(), 1);
    assert_eq!(assembler.current_line(), 1);
}
