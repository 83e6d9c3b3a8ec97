//! KiranaIO - Host-side acquisition library for line-scan X-ray detectors
//!
//! This library owns the device-facing half of a line-scan X-ray imaging
//! system: UDP discovery and configuration of detectors behind a grab/control
//! unit, the command/response wire protocol, a heartbeat-supervised command
//! session, and streaming line reception assembled into frames.
//!
//! ## Architecture
//!
//! - [`adaptor::Adaptor`] discovers detectors by broadcast and produces
//!   [`detector::DetectorDescriptor`] values.
//! - [`control::ControlSession`] opens the command channel, serialises the
//!   request/response cycle and supervises the device with a heartbeat
//!   thread.
//! - [`grabber::GrabSession`] opens the image channel and drives a
//!   [`frame::FrameAssembler`] from its grab thread; completed frames reach
//!   the caller through the [`sink::ImgSink`] callback, optionally after
//!   flat-field correction.
//! - [`factory::ResourceFactory`] owns initialisation order and tracks
//!   long-lived buffer allocations.
//!
//! Sinks are held as weak references; the library never extends a sink's
//! lifetime.

pub mod adaptor;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod factory;
pub mod frame;
pub mod grabber;
pub mod sink;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use config::Config;
pub use detector::DetectorDescriptor;
pub use error::{Error, Result};
pub use frame::FrameView;
pub use sink::{CmdSink, ImgSink};
