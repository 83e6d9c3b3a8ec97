//! Sink interfaces for errors, events and completed frames.
//!
//! Callers implement these traits to observe the library. Sessions hold the
//! sinks as `Weak` references and drop deliveries silently once the caller
//! releases its `Arc`; the library never keeps a sink alive.
//!
//! The numeric error and event identifiers are part of the external
//! contract and must stay stable across releases.

use crate::frame::FrameView;
use std::sync::Weak;

/// Stable error identifiers delivered through `on_error`.
pub mod error_id {
    /// Adaptor state change refused (e.g. rebind while open).
    pub const ADAPTOR_STATE: u32 = 1;
    /// Network/socket initialisation failed.
    pub const NETWORK_INIT: u32 = 2;
    /// Invalid argument (IP, MAC, DM index).
    pub const INVALID_ARGUMENT: u32 = 4;
    /// Discovery failed or device index out of range.
    pub const DISCOVERY: u32 = 5;
    /// Device reconfiguration failed.
    pub const CONFIGURE: u32 = 6;
    /// Operation requires an open adaptor/session.
    pub const NOT_OPEN: u32 = 8;
    /// Command code does not support the requested operation.
    pub const UNSUPPORTED: u32 = 11;
    /// Session open/handshake failed.
    pub const OPEN_FAILED: u32 = 12;
    /// Command send/receive failed (timeout or I/O).
    pub const COMMAND_FAILED: u32 = 15;
    /// Response shorter than the protocol minimum.
    pub const SHORT_RESPONSE: u32 = 16;
    /// Device answered with a non-zero error code.
    pub const DEVICE_ERROR: u32 = 17;
    /// Response failed CRC or echo verification.
    pub const CRC_MISMATCH: u32 = 18;
    /// Command issued against a closed session.
    pub const SESSION_CLOSED: u32 = 19;
    /// Grab session open/lifecycle failure.
    pub const GRAB_OPEN: u32 = 25;
    /// Grab/stop while in the wrong state, or stream receive failure.
    pub const GRAB_LIFECYCLE: u32 = 26;
    /// Frame geometry change refused while running.
    pub const FRAME_CONFIG: u32 = 32;
    /// Frame buffer allocation failed.
    pub const FRAME_ALLOC: u32 = 33;
    /// Heartbeat lost contact with the device.
    pub const HEARTBEAT_FAIL: u32 = 39;
    /// Heartbeat thread could not be started.
    pub const HEARTBEAT_START: u32 = 40;
    /// Heartbeat thread could not be stopped cleanly.
    pub const HEARTBEAT_STOP: u32 = 41;
    /// Image line length does not match the configured geometry.
    pub const LINE_LENGTH: u32 = 101;
}

/// Stable event identifiers delivered through `on_event`.
pub mod event_id {
    /// Discovery finished; data carries the device count.
    pub const DISCOVERY_COUNT: u32 = 101;
    /// GCU temperature in degrees Celsius.
    pub const TEMPERATURE: u32 = 107;
    /// GCU relative humidity in percent.
    pub const HUMIDITY: u32 = 108;
    /// Image lines lost; data carries the gap size.
    pub const PACKET_LOSS: u32 = 109;
}

/// Observer for the command channel (adaptor and control session).
pub trait CmdSink: Send + Sync {
    fn on_error(&self, error_id: u32, message: &str);
    fn on_event(&self, event_id: u32, data: f32);
}

/// Observer for the image channel (grab session and frame assembler).
///
/// `on_frame_ready` runs on the grab thread and must return promptly; the
/// frame view is only valid for the duration of the call.
pub trait ImgSink: Send + Sync {
    fn on_error(&self, error_id: u32, message: &str);
    fn on_event(&self, event_id: u32, data: u32);
    fn on_frame_ready(&self, frame: &FrameView<'_>);
}

pub(crate) fn cmd_error(sink: &Option<Weak<dyn CmdSink>>, id: u32, message: &str) {
    if let Some(sink) = sink.as_ref().and_then(Weak::upgrade) {
        sink.on_error(id, message);
    }
}

pub(crate) fn cmd_event(sink: &Option<Weak<dyn CmdSink>>, id: u32, data: f32) {
    if let Some(sink) = sink.as_ref().and_then(Weak::upgrade) {
        sink.on_event(id, data);
    }
}

pub(crate) fn img_error(sink: &Option<Weak<dyn ImgSink>>, id: u32, message: &str) {
    if let Some(sink) = sink.as_ref().and_then(Weak::upgrade) {
        sink.on_error(id, message);
    }
}

pub(crate) fn img_event(sink: &Option<Weak<dyn ImgSink>>, id: u32, data: u32) {
    if let Some(sink) = sink.as_ref().and_then(Weak::upgrade) {
        sink.on_event(id, data);
    }
}
