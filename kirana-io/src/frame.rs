//! Frame assembly from the line stream.
//!
//! The assembler owns one reusable pixel buffer of
//! `width * lines_per_frame * ceil(pixel_depth / 8)` bytes and a line
//! cursor. Lines are copied in as they arrive; when the frame fills, the
//! sink's `on_frame_ready` runs on the calling (grab) thread, then the
//! cursor resets and the buffer is cleared so no pixels leak into the next
//! frame.
//!
//! With header mode on, `line_id` gaps advance the cursor over zero-filled
//! rows (bounded by the end of the current frame) and raise a PACKET_LOSS
//! event; out-of-order ids fall back to arrival order. All mutation happens
//! on the grab thread; configuration changes are refused while running.

use crate::error::{Error, Result};
use crate::sink::{error_id, event_id, img_error, img_event, ImgSink};
use std::sync::Weak;

/// Default number of lines grouped into one frame.
pub const DEFAULT_LINES_PER_FRAME: usize = 1024;

/// Borrowed view of a completed frame, valid only inside `on_frame_ready`.
#[derive(Debug)]
pub struct FrameView<'a> {
    width: usize,
    lines: usize,
    pixel_depth: u8,
    data: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(width: usize, lines: usize, pixel_depth: u8, data: &'a [u8]) -> Self {
        FrameView {
            width,
            lines,
            pixel_depth,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn pixel_depth(&self) -> u8 {
        self.pixel_depth
    }

    pub fn bytes_per_pixel(&self) -> usize {
        (self.pixel_depth as usize + 7) / 8
    }

    /// Raw frame bytes, row-major, pixels little-endian.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// One row of raw bytes.
    pub fn row(&self, line: usize) -> &[u8] {
        let row_bytes = self.width * self.bytes_per_pixel();
        &self.data[line * row_bytes..(line + 1) * row_bytes]
    }

    /// Decode the frame into u16 pixels (depths up to 16 bits).
    pub fn to_u16(&self) -> Option<Vec<u16>> {
        if self.bytes_per_pixel() != 2 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    }
}

/// Running counters of the assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Lines copied into frames.
    pub lines_received: u64,
    /// Rows zero-filled to cover line_id gaps.
    pub lines_skipped: u64,
    /// Completed frames handed to the sink.
    pub frames_emitted: u64,
}

/// Reassembles line packets into fixed-height frames.
pub struct FrameAssembler {
    lines_per_frame: usize,
    width: usize,
    pixel_depth: u8,
    bytes_per_pixel: usize,

    buffer: Vec<u8>,
    current_line: usize,
    running: bool,
    next_line_id: Option<u32>,

    sink: Option<Weak<dyn ImgSink>>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(lines_per_frame: usize) -> Self {
        FrameAssembler {
            lines_per_frame: lines_per_frame.max(1),
            width: 0,
            pixel_depth: 16,
            bytes_per_pixel: 2,
            buffer: Vec::new(),
            current_line: 0,
            running: false,
            next_line_id: None,
            sink: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn set_sink(&mut self, sink: Weak<dyn ImgSink>) {
        self.sink = Some(sink);
    }

    pub fn lines_per_frame(&self) -> usize {
        self.lines_per_frame
    }

    /// Change the frame height. Illegal while running.
    pub fn set_lines(&mut self, lines: usize) -> Result<()> {
        if self.running {
            img_error(
                &self.sink,
                error_id::FRAME_CONFIG,
                "cannot change lines per frame while running",
            );
            return Err(Error::InvalidArgument(
                "cannot change lines per frame while running",
            ));
        }
        if lines == 0 {
            return Err(Error::InvalidArgument("lines per frame must be non-zero"));
        }
        self.lines_per_frame = lines;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn current_line(&self) -> usize {
        self.current_line
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Allocate the backing buffer for the given geometry and start
    /// accepting lines. Allocation failure is reported as FRAME_ALLOC and
    /// returned as a typed error.
    pub fn start(&mut self, width: usize, pixel_depth: u8) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if width == 0 || pixel_depth == 0 || pixel_depth > 24 {
            img_error(&self.sink, error_id::FRAME_CONFIG, "invalid frame geometry");
            return Err(Error::InvalidArgument("invalid frame geometry"));
        }

        self.width = width;
        self.pixel_depth = pixel_depth;
        self.bytes_per_pixel = (pixel_depth as usize + 7) / 8;

        let size = width * self.lines_per_frame * self.bytes_per_pixel;
        self.buffer.clear();
        if let Err(e) = self.buffer.try_reserve_exact(size) {
            img_error(
                &self.sink,
                error_id::FRAME_ALLOC,
                "frame buffer allocation failed",
            );
            log::error!("frame buffer allocation of {} bytes failed: {}", size, e);
            return Err(Error::Allocation(size));
        }
        self.buffer.resize(size, 0);

        self.current_line = 0;
        self.next_line_id = None;
        self.stats = AssemblerStats::default();
        self.running = true;

        log::info!(
            "frame assembly started: {}x{} @ {} bit",
            width,
            self.lines_per_frame,
            pixel_depth
        );
        Ok(())
    }

    /// Stop and release the backing buffer.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.buffer = Vec::new();
        self.current_line = 0;
        self.next_line_id = None;
        log::info!("frame assembly stopped");
    }

    /// Feed one line. `line_id` is the header's line counter when header
    /// mode is on; `None` places lines in arrival order.
    pub fn add_line(&mut self, bytes: &[u8], line_id: Option<u32>) {
        if !self.running {
            return;
        }

        let row_bytes = self.width * self.bytes_per_pixel;
        if bytes.len() != row_bytes {
            img_error(
                &self.sink,
                error_id::LINE_LENGTH,
                &format!(
                    "line length mismatch: got {} bytes, expected {}",
                    bytes.len(),
                    row_bytes
                ),
            );
            return;
        }

        // Header mode: a jump in line_id means rows were lost in transit.
        // Zero-fill the gap up to the end of the current frame; a gap past
        // the frame boundary emits the partial frame as-is and wraps.
        if let (Some(id), Some(expected)) = (line_id, self.next_line_id) {
            if id > expected {
                let gap = (id - expected) as usize;
                img_event(&self.sink, event_id::PACKET_LOSS, gap as u32);
                log::warn!("line stream gap: {} rows lost", gap);

                let advance = gap.min(self.lines_per_frame - self.current_line);
                self.current_line += advance;
                self.stats.lines_skipped += advance as u64;
                if self.current_line == self.lines_per_frame {
                    self.complete_frame();
                }
            } else if id < expected {
                log::debug!("out-of-order line id {} (expected {})", id, expected);
            }
        }

        let offset = self.current_line * row_bytes;
        self.buffer[offset..offset + row_bytes].copy_from_slice(bytes);
        self.current_line += 1;
        self.stats.lines_received += 1;
        if let Some(id) = line_id {
            self.next_line_id = Some(id.wrapping_add(1));
        }

        if self.current_line == self.lines_per_frame {
            self.complete_frame();
        }
    }

    fn complete_frame(&mut self) {
        if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
            let view = FrameView::new(
                self.width,
                self.lines_per_frame,
                self.pixel_depth,
                &self.buffer,
            );
            sink.on_frame_ready(&view);
        }
        self.stats.frames_emitted += 1;
        self.current_line = 0;
        // Reuse the buffer but never leak pixels into the next frame
        self.buffer.fill(0);
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_LINES_PER_FRAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<u32>>,
        events: Mutex<Vec<(u32, u32)>>,
    }

    impl ImgSink for RecordingSink {
        fn on_error(&self, error_id: u32, _message: &str) {
            self.errors.lock().unwrap().push(error_id);
        }
        fn on_event(&self, event_id: u32, data: u32) {
            self.events.lock().unwrap().push((event_id, data));
        }
        fn on_frame_ready(&self, frame: &FrameView<'_>) {
            self.frames.lock().unwrap().push(frame.data().to_vec());
        }
    }

    fn assembler_with_sink(
        lines: usize,
    ) -> (FrameAssembler, Arc<RecordingSink>, Arc<dyn ImgSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut assembler = FrameAssembler::new(lines);
        let keeper: Arc<dyn ImgSink> = sink.clone();
        assembler.set_sink(Arc::downgrade(&keeper));
        (assembler, sink, keeper)
    }

    #[test]
    fn frame_completes_after_enough_lines() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(4);
        assembler.start(1024, 16).unwrap();

        let line = vec![0x11u8; 2048];
        for _ in 0..4 {
            assembler.add_line(&line, None);
        }
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        assert_eq!(assembler.current_line(), 0);
    }

    #[test]
    fn buffer_reuse_does_not_leak_previous_frame() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(2);
        assembler.start(4, 16).unwrap();

        let first = vec![0xAAu8; 8];
        assembler.add_line(&first, None);
        assembler.add_line(&first, None);

        let second = vec![0x55u8; 8];
        assembler.add_line(&second, None);
        assembler.add_line(&second, None);

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].iter().all(|&b| b == 0xAA));
        assert!(frames[1].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn wrong_length_line_is_dropped_with_error() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(4);
        assembler.start(1024, 16).unwrap();

        assembler.add_line(&[0u8; 100], None);
        assert_eq!(assembler.current_line(), 0);
        assert_eq!(sink.errors.lock().unwrap()[..], [error_id::LINE_LENGTH]);
    }

    #[test]
    fn line_id_gap_zero_fills_and_reports_loss() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(4);
        assembler.start(1024, 16).unwrap();

        let line = vec![0x77u8; 2048];
        assembler.add_line(&line, Some(0));
        assembler.add_line(&line, Some(1));
        assembler.add_line(&line, Some(3));

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1, "gap should complete the frame");
        let frame = &frames[0];
        assert!(frame[..2 * 2048].iter().all(|&b| b == 0x77));
        assert!(frame[2 * 2048..3 * 2048].iter().all(|&b| b == 0), "row 2 zero-filled");
        assert!(frame[3 * 2048..].iter().all(|&b| b == 0x77), "row 3 is the last payload");

        assert_eq!(sink.events.lock().unwrap()[..], [(event_id::PACKET_LOSS, 1)]);
        assert_eq!(assembler.current_line(), 0);
    }

    #[test]
    fn gap_past_frame_boundary_emits_partial_and_wraps() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(4);
        assembler.start(8, 16).unwrap();

        let line = vec![0x01u8; 16];
        assembler.add_line(&line, Some(0));
        // Gap of 100 rows: frame emits with rows 1..4 zeroed, cursor wraps
        assembler.add_line(&line, Some(101));

        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        assert_eq!(assembler.current_line(), 1);
    }

    #[test]
    fn throughput_counters_balance() {
        let (mut assembler, _sink, _keeper) = assembler_with_sink(4);
        assembler.start(8, 16).unwrap();

        let line = vec![0u8; 16];
        assembler.add_line(&line, Some(0));
        assembler.add_line(&line, Some(2)); // one skipped
        for id in 3..9 {
            assembler.add_line(&line, Some(id));
        }

        let stats = assembler.stats();
        assert_eq!(
            stats.lines_received + stats.lines_skipped,
            stats.frames_emitted * 4 + assembler.current_line() as u64
        );
    }

    #[test]
    fn geometry_change_while_running_is_refused() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(4);
        assembler.start(8, 16).unwrap();
        assert!(assembler.set_lines(8).is_err());
        assert_eq!(sink.errors.lock().unwrap()[..], [error_id::FRAME_CONFIG]);

        assembler.stop();
        assert!(assembler.set_lines(8).is_ok());
    }

    #[test]
    fn stopped_assembler_drops_lines_silently() {
        let (mut assembler, sink, _keeper) = assembler_with_sink(2);
        assembler.add_line(&[0u8; 16], None);
        assert!(sink.frames.lock().unwrap().is_empty());
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn view_decodes_little_endian_pixels() {
        let data = [0x34, 0x12, 0xFF, 0x7F];
        let view = FrameView::new(2, 1, 16, &data);
        assert_eq!(view.to_u16().unwrap(), vec![0x1234, 0x7FFF]);
        assert_eq!(view.row(0), &data);
    }
}
