//! Grab session: streaming image acquisition.
//!
//! `grab(n)` spawns the grab thread, which polls the image transport under
//! its receive timeout, feeds line packets into the frame assembler and
//! exits once `n` frames have been emitted (or on `stop()`). Timeouts are a
//! normal poll condition; any other receive failure is reported and ends
//! the acquisition. Cancellation is cooperative: `stop()` raises a flag and
//! joins, relying on the image timeout to unblock the receiver.
//!
//! An optional flat-field corrector can be attached; completed frames are
//! then corrected before they reach the caller's sink.

use crate::config::AcquisitionConfig;
use crate::detector::DetectorDescriptor;
use crate::error::{Error, Result};
use crate::frame::{FrameAssembler, FrameView};
use crate::sink::{error_id, img_error, ImgSink};
use crate::transport::{ImageTransport, UdpImageTransport};
use crate::wire::image::{ImagePacketHeader, HEADER_LEN};
use crate::wire::MAX_IMAGE_PACKET;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use kirana_correct::FlatField;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Counters of the stream receiver.
#[derive(Debug, Default)]
pub struct GrabCounters {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
}

/// Streaming acquisition session for one detector.
pub struct GrabSession {
    descriptor: Option<DetectorDescriptor>,
    transport: Option<Arc<Mutex<Box<dyn ImageTransport>>>>,
    image_timeout: Duration,
    header_mode: bool,

    assembler: Arc<Mutex<FrameAssembler>>,
    adapter: Option<Arc<CorrectingSink>>,
    pipeline: Option<Arc<Mutex<FlatField>>>,
    sink: Option<Weak<dyn ImgSink>>,

    counters: Arc<GrabCounters>,
    stop_requested: Arc<AtomicBool>,
    grab_thread: Option<JoinHandle<()>>,
    completion: Option<Receiver<()>>,
}

impl GrabSession {
    pub fn new() -> Self {
        Self::with_config(&AcquisitionConfig::default())
    }

    /// Build a session from the `[acquisition]` config section.
    pub fn with_config(config: &AcquisitionConfig) -> Self {
        GrabSession {
            descriptor: None,
            transport: None,
            image_timeout: Duration::from_millis(config.image_timeout_ms),
            header_mode: config.header_mode,
            assembler: Arc::new(Mutex::new(FrameAssembler::new(
                config.lines_per_frame as usize,
            ))),
            adapter: None,
            pipeline: None,
            sink: None,
            counters: Arc::new(GrabCounters::default()),
            stop_requested: Arc::new(AtomicBool::new(false)),
            grab_thread: None,
            completion: None,
        }
    }

    /// Install the caller's sink (held weakly) and rewire the assembler
    /// through the correction adapter.
    pub fn set_sink(&mut self, sink: Weak<dyn ImgSink>) {
        self.sink = Some(sink);
        self.rewire_sink();
    }

    /// Attach or detach the flat-field corrector applied to completed
    /// frames before sink dispatch.
    pub fn set_pipeline(&mut self, pipeline: Option<Arc<Mutex<FlatField>>>) {
        self.pipeline = pipeline;
        self.rewire_sink();
    }

    /// Expect (and parse) the per-line packet header on the stream.
    pub fn set_header_mode(&mut self, enable: bool) -> Result<()> {
        if self.is_grabbing() {
            img_error(
                &self.sink,
                error_id::GRAB_LIFECYCLE,
                "cannot change header mode while grabbing",
            );
            return Err(Error::InvalidArgument(
                "cannot change header mode while grabbing",
            ));
        }
        self.header_mode = enable;
        Ok(())
    }

    /// Change the frame height. Illegal while grabbing.
    pub fn set_lines_per_frame(&mut self, lines: usize) -> Result<()> {
        self.assembler.lock().set_lines(lines)
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_grabbing(&self) -> bool {
        self.grab_thread.is_some()
    }

    /// Lines / frames counters of the current (or last) acquisition.
    pub fn assembler_stats(&self) -> crate::frame::AssemblerStats {
        self.assembler.lock().stats()
    }

    pub fn packets_received(&self) -> u64 {
        self.counters.packets_received.load(Ordering::Relaxed)
    }

    /// Open the image channel on the descriptor's image port.
    pub fn open(&mut self, descriptor: &DetectorDescriptor) -> Result<()> {
        let transport = match UdpImageTransport::bind(descriptor.img_port, self.image_timeout) {
            Ok(t) => t,
            Err(e) => {
                img_error(&self.sink, error_id::GRAB_OPEN, &e.to_string());
                return Err(e);
            }
        };
        self.open_with_transport(descriptor, Box::new(transport))
    }

    /// Open on an already-built transport (device stubs, alternate links).
    pub fn open_with_transport(
        &mut self,
        descriptor: &DetectorDescriptor,
        transport: Box<dyn ImageTransport>,
    ) -> Result<()> {
        if self.is_open() {
            img_error(&self.sink, error_id::GRAB_OPEN, "session already open");
            return Err(Error::AlreadyOpen);
        }
        descriptor.validate()?;

        self.descriptor = Some(descriptor.clone());
        self.transport = Some(Arc::new(Mutex::new(transport)));
        log::info!("grab session open on port {}", descriptor.img_port);
        Ok(())
    }

    /// Start acquiring. `frames == 0` runs until `stop()`.
    pub fn grab(&mut self, frames: u32) -> Result<()> {
        let Some(descriptor) = self.descriptor.clone() else {
            img_error(&self.sink, error_id::GRAB_OPEN, "grab session not open");
            return Err(Error::NotOpen);
        };
        if self.is_grabbing() {
            img_error(&self.sink, error_id::GRAB_LIFECYCLE, "already grabbing");
            return Err(Error::AlreadyOpen);
        }
        let transport = self
            .transport
            .as_ref()
            .map(Arc::clone)
            .ok_or(Error::NotOpen)?;

        self.assembler
            .lock()
            .start(descriptor.pixel_count as usize, descriptor.pixel_depth)?;

        self.counters.packets_received.store(0, Ordering::Relaxed);
        self.counters.packets_dropped.store(0, Ordering::Relaxed);
        self.stop_requested.store(false, Ordering::Relaxed);

        let (done_tx, done_rx) = bounded(1);
        self.completion = Some(done_rx);

        let worker = GrabWorker {
            transport,
            assembler: Arc::clone(&self.assembler),
            counters: Arc::clone(&self.counters),
            stop: Arc::clone(&self.stop_requested),
            sink: self.sink.clone(),
            header_mode: self.header_mode,
            frames_to_grab: frames,
            done: done_tx,
        };
        self.grab_thread = Some(std::thread::spawn(move || worker.run()));

        log::info!(
            "acquisition started ({} frames requested)",
            if frames == 0 { "unbounded".to_string() } else { frames.to_string() }
        );
        Ok(())
    }

    /// Acquire exactly one frame, blocking until it completed.
    ///
    /// Gives the stream ten image-timeout periods to produce the frame
    /// before giving up.
    pub fn snap(&mut self) -> Result<()> {
        self.grab(1)?;
        let deadline = self.image_timeout * 10;
        let result = match self.completion.as_ref() {
            Some(done) => match done.recv_timeout(deadline) {
                Ok(()) => Ok(()),
                Err(RecvTimeoutError::Timeout) => {
                    Err(Error::Timeout(deadline.as_millis() as u64))
                }
                Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
            },
            None => Err(Error::NotOpen),
        };
        self.stop();
        result
    }

    /// Request the grab thread to finish and join it. Idempotent.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Relaxed);
        if let Some(thread) = self.grab_thread.take() {
            if thread.join().is_err() {
                log::error!("grab thread panicked during join");
            }
        }
        self.completion = None;
    }

    /// Stop acquiring and release the channel.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.stop();
        let stats = self.assembler.lock().stats();
        log::info!(
            "grab session closed: {} packets received, {} rows lost, {} lines assembled, {} frames",
            self.counters.packets_received.load(Ordering::Relaxed),
            stats.lines_skipped,
            stats.lines_received,
            stats.frames_emitted
        );
        self.transport = None;
        self.descriptor = None;
    }

    fn rewire_sink(&mut self) {
        let Some(sink) = self.sink.clone() else {
            self.adapter = None;
            return;
        };
        let adapter = Arc::new(CorrectingSink {
            inner: sink,
            pipeline: self.pipeline.clone(),
            scratch: Mutex::new(Vec::new()),
        });
        let weak: Arc<dyn ImgSink> = adapter.clone();
        self.assembler.lock().set_sink(Arc::downgrade(&weak));
        // Hold the adapter so the assembler's weak reference stays valid
        self.adapter = Some(adapter);
        drop(weak);
    }
}

impl Default for GrabSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GrabSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// State moved onto the grab thread.
struct GrabWorker {
    transport: Arc<Mutex<Box<dyn ImageTransport>>>,
    assembler: Arc<Mutex<FrameAssembler>>,
    counters: Arc<GrabCounters>,
    stop: Arc<AtomicBool>,
    sink: Option<Weak<dyn ImgSink>>,
    header_mode: bool,
    frames_to_grab: u32,
    done: Sender<()>,
}

impl GrabWorker {
    fn run(self) {
        log::info!("grab thread started");
        let mut buf = vec![0u8; MAX_IMAGE_PACKET];

        while !self.stop.load(Ordering::Relaxed) {
            let received = {
                let mut transport = self.transport.lock();
                transport.recv(&mut buf)
            };

            match received {
                Ok(0) => continue,
                Ok(len) => {
                    self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.process_packet(&buf[..len]);
                }
                Err(Error::Timeout(_)) => continue,
                Err(e) => {
                    img_error(&self.sink, error_id::GRAB_LIFECYCLE, &e.to_string());
                    log::error!("image receive failed: {}", e);
                    break;
                }
            }

            if self.frames_to_grab > 0
                && self.assembler.lock().stats().frames_emitted >= self.frames_to_grab as u64
            {
                let _ = self.done.try_send(());
                break;
            }
        }

        self.assembler.lock().stop();
        let _ = self.done.try_send(());
        log::info!("grab thread stopped");
    }

    fn process_packet(&self, packet: &[u8]) {
        if self.header_mode {
            match ImagePacketHeader::parse(packet) {
                Ok(header) => {
                    let payload = &packet[HEADER_LEN..];
                    let len = (header.data_len as usize).min(payload.len());
                    self.assembler
                        .lock()
                        .add_line(&payload[..len], Some(header.line_id as u32));
                }
                Err(e) => {
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("dropping image packet with bad header: {}", e);
                }
            }
        } else {
            self.assembler.lock().add_line(packet, None);
        }
    }
}

/// Assembler-facing sink that applies the optional flat-field correction
/// before forwarding to the caller.
struct CorrectingSink {
    inner: Weak<dyn ImgSink>,
    pipeline: Option<Arc<Mutex<FlatField>>>,
    scratch: Mutex<Vec<u8>>,
}

impl ImgSink for CorrectingSink {
    fn on_error(&self, error_id: u32, message: &str) {
        if let Some(sink) = self.inner.upgrade() {
            sink.on_error(error_id, message);
        }
    }

    fn on_event(&self, event_id: u32, data: u32) {
        if let Some(sink) = self.inner.upgrade() {
            sink.on_event(event_id, data);
        }
    }

    fn on_frame_ready(&self, frame: &FrameView<'_>) {
        let Some(sink) = self.inner.upgrade() else {
            return;
        };

        let corrected = self.pipeline.as_ref().and_then(|pipeline| {
            let pixels = frame.to_u16()?;
            let mut output = vec![0u16; pixels.len()];
            let pipeline = pipeline.lock();
            match pipeline.apply(&pixels, &mut output) {
                Ok(()) => Some(output),
                Err(e) => {
                    log::warn!("frame correction skipped: {}", e);
                    None
                }
            }
        });

        match corrected {
            Some(pixels) => {
                let mut scratch = self.scratch.lock();
                scratch.clear();
                scratch.reserve(pixels.len() * 2);
                for value in pixels {
                    scratch.extend_from_slice(&value.to_le_bytes());
                }
                let view = FrameView::new(
                    frame.width(),
                    frame.lines(),
                    frame.pixel_depth(),
                    &scratch,
                );
                sink.on_frame_ready(&view);
            }
            None => sink.on_frame_ready(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockImageTransport;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CountingSink {
        frames: StdMutex<Vec<Vec<u8>>>,
    }

    impl ImgSink for CountingSink {
        fn on_error(&self, _error_id: u32, _message: &str) {}
        fn on_event(&self, _event_id: u32, _data: u32) {}
        fn on_frame_ready(&self, frame: &FrameView<'_>) {
            self.frames.lock().unwrap().push(frame.data().to_vec());
        }
    }

    fn tiny_descriptor() -> DetectorDescriptor {
        DetectorDescriptor {
            pixel_count: 8,
            pixel_depth: 16,
            ..Default::default()
        }
    }

    fn session_with_sink(lines: u32) -> (GrabSession, Arc<CountingSink>, Arc<dyn ImgSink>) {
        let sink = Arc::new(CountingSink::default());
        let keeper: Arc<dyn ImgSink> = sink.clone();
        let mut session = GrabSession::with_config(&AcquisitionConfig {
            image_timeout_ms: 5,
            lines_per_frame: lines,
            header_mode: false,
        });
        session.set_sink(Arc::downgrade(&keeper));
        (session, sink, keeper)
    }

    #[test]
    fn grab_before_open_is_refused() {
        let (mut session, _sink, _keeper) = session_with_sink(4);
        assert!(matches!(session.grab(1), Err(Error::NotOpen)));
    }

    #[test]
    fn snap_assembles_one_frame_from_the_stream() {
        let (mut session, sink, _keeper) = session_with_sink(4);
        let transport = MockImageTransport::new();
        for _ in 0..4 {
            transport.push(vec![0x42; 16]);
        }
        session
            .open_with_transport(&tiny_descriptor(), Box::new(transport.clone()))
            .unwrap();

        session.snap().unwrap();
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|&b| b == 0x42));
    }

    #[test]
    fn snap_times_out_on_a_silent_stream() {
        let (mut session, _sink, _keeper) = session_with_sink(4);
        session
            .open_with_transport(&tiny_descriptor(), Box::new(MockImageTransport::new()))
            .unwrap();
        assert!(matches!(session.snap(), Err(Error::Timeout(_))));
        assert!(!session.is_grabbing());
    }

    #[test]
    fn pipeline_corrects_frames_before_dispatch() {
        let (mut session, sink, _keeper) = session_with_sink(2);

        // Gain-only pipeline that doubles every pixel
        let mut flat_field = FlatField::new(8, 2, 16).unwrap();
        flat_field.set_gain(&[2.0; 16]).unwrap();
        session.set_pipeline(Some(Arc::new(Mutex::new(flat_field))));

        let transport = MockImageTransport::new();
        let mut row = Vec::new();
        for _ in 0..8 {
            row.extend_from_slice(&100u16.to_le_bytes());
        }
        transport.push(row.clone());
        transport.push(row);

        session
            .open_with_transport(&tiny_descriptor(), Box::new(transport))
            .unwrap();
        session.snap().unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let pixels: Vec<u16> = frames[0]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert!(pixels.iter().all(|&p| p == 200));
    }

    #[test]
    fn stop_without_grab_is_harmless() {
        let (mut session, _sink, _keeper) = session_with_sink(4);
        session.stop();
        session.close();
    }
}
