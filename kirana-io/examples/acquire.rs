//! End-to-end acquisition demo: discover, configure, grab
//!
//! Sequence:
//! 1. Discover detectors on the local adapter
//! 2. Open a command session and set the integration time
//! 3. Open a grab session and acquire a handful of frames
//! 4. Print stream statistics
//!
//! Run against real hardware (detector on the default subnet):
//! ```sh
//! RUST_LOG=info cargo run --example acquire -- 192.168.1.100
//! ```

use kirana_io::adaptor::Adaptor;
use kirana_io::control::ControlSession;
use kirana_io::frame::FrameView;
use kirana_io::grabber::GrabSession;
use kirana_io::sink::{CmdSink, ImgSink};
use kirana_io::wire::command::CommandCode;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prints command-channel telemetry as it arrives.
struct ConsoleSink;

impl CmdSink for ConsoleSink {
    fn on_error(&self, error_id: u32, message: &str) {
        log::error!("command channel error {}: {}", error_id, message);
    }
    fn on_event(&self, event_id: u32, data: f32) {
        log::info!("event {}: {:.1}", event_id, data);
    }
}

/// Counts frames and remembers the mean of the last one.
struct FrameCounter {
    frames: AtomicU64,
}

impl ImgSink for FrameCounter {
    fn on_error(&self, error_id: u32, message: &str) {
        log::error!("image channel error {}: {}", error_id, message);
    }
    fn on_event(&self, event_id: u32, data: u32) {
        log::warn!("image channel event {}: {}", event_id, data);
    }
    fn on_frame_ready(&self, frame: &FrameView<'_>) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(pixels) = frame.to_u16() {
            let mean = pixels.iter().map(|&p| p as u64).sum::<u64>() / pixels.len() as u64;
            log::info!(
                "frame {}: {}x{} @ {} bit, mean level {}",
                n,
                frame.width(),
                frame.lines(),
                frame.pixel_depth(),
                mean
            );
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let adapter_ip: Ipv4Addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.1.100".to_string())
        .parse()?;

    // === 1. Discover ===
    let cmd_sink: Arc<dyn CmdSink> = Arc::new(ConsoleSink);
    let mut adaptor = Adaptor::new();
    adaptor.set_sink(Arc::downgrade(&cmd_sink));
    adaptor.bind(adapter_ip)?;
    adaptor.open()?;

    let count = adaptor.connect()?;
    if count == 0 {
        log::error!("no detectors found on {}", adapter_ip);
        return Ok(());
    }
    let descriptor = adaptor.get(0)?;
    log::info!(
        "using detector {} at {} ({} modules, {} pixels)",
        descriptor.serial_number,
        descriptor.ip,
        descriptor.module_count,
        descriptor.pixel_count
    );

    // === 2. Command session ===
    let mut control = ControlSession::new();
    control.set_sink(Arc::downgrade(&cmd_sink));
    control.open(&descriptor)?;

    control.write_u64(CommandCode::IntegrationTime, 5_000, 0)?;
    let integration = control.read_u64(CommandCode::IntegrationTime, 0)?;
    let serial = control.read_string(CommandCode::GcuSerial, 0)?;
    log::info!("GCU {} ready, integration time {} us", serial, integration);

    // === 3. Acquire ===
    let img_sink: Arc<dyn ImgSink> = Arc::new(FrameCounter {
        frames: AtomicU64::new(0),
    });
    let mut grabber = GrabSession::new();
    grabber.set_sink(Arc::downgrade(&img_sink));
    grabber.open(&descriptor)?;
    grabber.grab(4)?;

    std::thread::sleep(Duration::from_secs(10));
    grabber.stop();

    // === 4. Wrap up ===
    let stats = grabber.assembler_stats();
    log::info!(
        "done: {} packets, {} frames, {} rows lost",
        grabber.packets_received(),
        stats.frames_emitted,
        stats.lines_skipped
    );

    grabber.close();
    control.close();
    adaptor.close();
    Ok(())
}
