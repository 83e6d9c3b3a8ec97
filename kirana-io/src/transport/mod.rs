//! Transport layer for the command and image channels.

use crate::error::Result;
use std::time::Duration;

mod udp;
pub use udp::{discover, send_broadcast, UdpCommandTransport, UdpImageTransport};

mod mock;
pub use mock::{MockCommandTransport, MockDetectorState, MockImageTransport};

/// Request/response transport for the command channel.
///
/// The device is half-duplex: one request is in flight at a time, and the
/// session layer serialises callers. A short or missing response surfaces
/// as an error, never as partial bytes.
pub trait CommandTransport: Send {
    /// Send one request and wait for its response.
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>>;

    /// Change the response deadline.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
}

/// Receive-only transport for the image stream.
pub trait ImageTransport: Send {
    /// Receive one packet into `buf`, returning its length.
    ///
    /// Returns `Error::Timeout` when no packet arrives within the image
    /// timeout; callers poll again.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
}
