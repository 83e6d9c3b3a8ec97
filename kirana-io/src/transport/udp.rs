//! UDP transport implementation.
//!
//! One socket per concern: a connected request/response socket for commands,
//! a bound receive socket for the image stream, and short-lived broadcast
//! sockets for discovery and MAC-targeted configuration.

use super::{CommandTransport, ImageTransport};
use crate::detector::DetectorDescriptor;
use crate::error::{Error, Result};
use crate::wire::discovery;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Command responses never exceed header + max payload + CRC.
const RESPONSE_BUFFER: usize = 512;

/// Receive slice while collecting discovery responses.
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Connected UDP socket driving the request/response cycle.
pub struct UdpCommandTransport {
    socket: UdpSocket,
    timeout: Duration,
}

impl UdpCommandTransport {
    /// Bind an ephemeral local port and connect it to the device's command
    /// endpoint.
    pub fn connect(remote: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(timeout))?;
        log::debug!("command transport connected to {}", remote);
        Ok(UdpCommandTransport { socket, timeout })
    }
}

impl CommandTransport for UdpCommandTransport {
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        self.socket.send(request)?;

        let mut buf = [0u8; RESPONSE_BUFFER];
        match self.socket.recv(&mut buf) {
            Ok(received) => {
                log::trace!(
                    "command round-trip: {} -> {} bytes in {:?}",
                    request.len(),
                    received,
                    started.elapsed()
                );
                Ok(buf[..received].to_vec())
            }
            Err(e) if is_timeout(&e) => Err(Error::Timeout(self.timeout.as_millis() as u64)),
            Err(e) => Err(e.into()),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.socket.set_read_timeout(Some(timeout))?;
        self.timeout = timeout;
        Ok(())
    }
}

/// Bound UDP socket receiving the line stream.
pub struct UdpImageTransport {
    socket: UdpSocket,
    timeout: Duration,
}

impl UdpImageTransport {
    /// Bind the image port on all interfaces.
    pub fn bind(img_port: u16, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", img_port))?;
        socket.set_read_timeout(Some(timeout))?;
        log::debug!("image transport bound on port {}", img_port);
        Ok(UdpImageTransport { socket, timeout })
    }
}

impl ImageTransport for UdpImageTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.socket.recv_from(buf) {
            Ok((received, _)) => Ok(received),
            Err(e) if is_timeout(&e) => Err(Error::Timeout(self.timeout.as_millis() as u64)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Broadcast the discovery frame from the given adapter and collect device
/// records for the duration of the window. Duplicate MACs are coalesced.
pub fn discover(
    adapter_ip: Ipv4Addr,
    cmd_port: u16,
    window: Duration,
) -> Result<Vec<DetectorDescriptor>> {
    let socket = UdpSocket::bind((adapter_ip, 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(DISCOVERY_POLL))?;

    let request = discovery::discovery_request();
    socket.send_to(&request, (Ipv4Addr::BROADCAST, cmd_port))?;
    log::info!(
        "discovery broadcast sent from {} to port {}",
        adapter_ip,
        cmd_port
    );

    let mut found: Vec<DetectorDescriptor> = Vec::new();
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 1024];

    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((received, from)) => match discovery::parse_device_info(&buf[..received]) {
                Ok(descriptor) => {
                    if found.iter().any(|d| d.mac == descriptor.mac) {
                        log::debug!("duplicate discovery response from {}", from);
                    } else {
                        log::info!(
                            "discovered detector {} at {} (MAC {})",
                            descriptor.serial_number,
                            descriptor.ip,
                            descriptor.mac_string()
                        );
                        found.push(descriptor);
                    }
                }
                Err(e) => log::debug!("ignoring malformed discovery response from {}: {}", from, e),
            },
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(found)
}

/// Fire one broadcast frame (configuration / factory reset) from the given
/// adapter.
pub fn send_broadcast(adapter_ip: Ipv4Addr, cmd_port: u16, frame: &[u8]) -> Result<()> {
    let socket = UdpSocket::bind((adapter_ip, 0))?;
    socket.set_broadcast(true)?;
    socket.send_to(frame, (Ipv4Addr::BROADCAST, cmd_port))?;
    Ok(())
}
