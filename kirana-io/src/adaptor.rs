//! Adaptor: broadcast discovery and network configuration of detectors.
//!
//! Flow: `bind(adapter_ip)` -> `open()` -> `connect()` -> `get(i)`, then
//! optionally `configure()` a device's addressing by MAC or `restore()`
//! everything discovered to factory defaults. Devices reboot after either
//! operation; the adaptor waits three seconds and does not reconnect on its
//! own.

use crate::detector::{DetectorDescriptor, DEFAULT_CMD_PORT};
use crate::error::{Error, Result};
use crate::sink::{cmd_error, cmd_event, error_id, event_id, CmdSink};
use crate::transport;
use crate::wire::discovery;
use std::net::Ipv4Addr;
use std::sync::Weak;
use std::time::Duration;

/// Window during which discovery responses are collected.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Devices reboot after reconfiguration; give them this long.
const REBOOT_WAIT: Duration = Duration::from_secs(3);

/// Discovery and configuration front-end for one network adapter.
pub struct Adaptor {
    adapter_ip: Option<Ipv4Addr>,
    cmd_port: u16,
    opened: bool,
    discovered: Vec<DetectorDescriptor>,
    sink: Option<Weak<dyn CmdSink>>,
}

impl Adaptor {
    pub fn new() -> Self {
        Adaptor {
            adapter_ip: None,
            cmd_port: DEFAULT_CMD_PORT,
            opened: false,
            discovered: Vec::new(),
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: Weak<dyn CmdSink>) {
        self.sink = Some(sink);
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Number of detectors found by the last `connect`.
    pub fn device_count(&self) -> usize {
        self.discovered.len()
    }

    /// Select the local adapter to broadcast from. Refused while open.
    pub fn bind(&mut self, adapter_ip: Ipv4Addr) -> Result<()> {
        if self.opened {
            cmd_error(
                &self.sink,
                error_id::ADAPTOR_STATE,
                "cannot change adapter IP while open",
            );
            return Err(Error::InvalidArgument(
                "cannot change adapter IP while open",
            ));
        }
        self.adapter_ip = Some(adapter_ip);
        Ok(())
    }

    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        let Some(ip) = self.adapter_ip else {
            cmd_error(&self.sink, error_id::INVALID_ARGUMENT, "adapter IP not set");
            return Err(Error::InvalidArgument("adapter IP not set"));
        };
        self.discovered.clear();
        self.opened = true;
        log::info!("adaptor open on {}", ip);
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.opened {
            return;
        }
        self.discovered.clear();
        self.opened = false;
        log::info!("adaptor closed");
    }

    /// Broadcast discovery and collect responses for the discovery window.
    ///
    /// Returns the device count; the count is also delivered as event 101.
    pub fn connect(&mut self) -> Result<usize> {
        let ip = self.require_open()?;

        self.discovered.clear();
        match transport::discover(ip, self.cmd_port, DISCOVERY_WINDOW) {
            Ok(devices) => {
                log::info!("discovery found {} device(s)", devices.len());
                self.discovered = devices;
                cmd_event(
                    &self.sink,
                    event_id::DISCOVERY_COUNT,
                    self.discovered.len() as f32,
                );
                Ok(self.discovered.len())
            }
            Err(e) => {
                cmd_error(&self.sink, error_id::DISCOVERY, &e.to_string());
                Err(e)
            }
        }
    }

    /// Copy of the i-th discovered descriptor.
    pub fn get(&self, index: usize) -> Result<DetectorDescriptor> {
        match self.discovered.get(index) {
            Some(descriptor) => Ok(descriptor.clone()),
            None => {
                cmd_error(&self.sink, error_id::DISCOVERY, "device index out of range");
                Err(Error::InvalidArgument("device index out of range"))
            }
        }
    }

    /// Reconfigure a device's (ip, cmd_port, img_port), targeted by MAC,
    /// then wait out its reboot. The device set must be re-discovered
    /// afterwards.
    pub fn configure(&mut self, descriptor: &DetectorDescriptor) -> Result<()> {
        let ip = self.require_open()?;

        if !descriptor.has_mac() {
            cmd_error(
                &self.sink,
                error_id::INVALID_ARGUMENT,
                "descriptor carries no MAC address",
            );
            return Err(Error::InvalidArgument("descriptor carries no MAC address"));
        }
        descriptor.validate()?;

        log::info!(
            "configuring device {}: ip {}, ports {}/{}",
            descriptor.mac_string(),
            descriptor.ip,
            descriptor.cmd_port,
            descriptor.img_port
        );
        let frame = discovery::configure_request(
            &descriptor.mac,
            descriptor.ip,
            descriptor.cmd_port,
            descriptor.img_port,
        );
        if let Err(e) = transport::send_broadcast(ip, self.cmd_port, &frame) {
            cmd_error(&self.sink, error_id::CONFIGURE, &e.to_string());
            return Err(e);
        }

        log::info!("device configured, waiting for reboot");
        std::thread::sleep(REBOOT_WAIT);
        Ok(())
    }

    /// Reset every discovered device to factory defaults
    /// (192.168.1.2, 3000, 4001), then wait out the reboot.
    pub fn restore(&mut self) -> Result<()> {
        let ip = self.require_open()?;

        if self.discovered.is_empty() {
            cmd_error(&self.sink, error_id::DISCOVERY, "no devices discovered");
            return Err(Error::InvalidArgument("no devices discovered"));
        }

        for descriptor in &self.discovered {
            log::info!("restoring device {}", descriptor.mac_string());
            let frame = discovery::restore_request(&descriptor.mac);
            if let Err(e) = transport::send_broadcast(ip, self.cmd_port, &frame) {
                cmd_error(&self.sink, error_id::CONFIGURE, &e.to_string());
                return Err(e);
            }
        }

        log::info!(
            "{} device(s) restored to defaults, waiting for reboot",
            self.discovered.len()
        );
        std::thread::sleep(REBOOT_WAIT);
        Ok(())
    }

    fn require_open(&self) -> Result<Ipv4Addr> {
        match (self.opened, self.adapter_ip) {
            (true, Some(ip)) => Ok(ip),
            _ => {
                cmd_error(&self.sink, error_id::NOT_OPEN, "adaptor not open");
                Err(Error::NotOpen)
            }
        }
    }
}

impl Default for Adaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_a_bound_adapter() {
        let mut adaptor = Adaptor::new();
        assert!(adaptor.open().is_err());
        adaptor.bind(Ipv4Addr::new(127, 0, 0, 1)).unwrap();
        assert!(adaptor.open().is_ok());
        assert!(adaptor.is_open());
    }

    #[test]
    fn rebind_while_open_is_refused() {
        let mut adaptor = Adaptor::new();
        adaptor.bind(Ipv4Addr::new(127, 0, 0, 1)).unwrap();
        adaptor.open().unwrap();
        assert!(adaptor.bind(Ipv4Addr::new(10, 0, 0, 1)).is_err());
        adaptor.close();
        assert!(adaptor.bind(Ipv4Addr::new(10, 0, 0, 1)).is_ok());
    }

    #[test]
    fn get_without_discovery_is_out_of_range() {
        let adaptor = Adaptor::new();
        assert!(adaptor.get(0).is_err());
    }

    #[test]
    fn configure_requires_a_mac() {
        let mut adaptor = Adaptor::new();
        adaptor.bind(Ipv4Addr::new(127, 0, 0, 1)).unwrap();
        adaptor.open().unwrap();
        let no_mac = DetectorDescriptor::default();
        assert!(matches!(
            adaptor.configure(&no_mac),
            Err(Error::InvalidArgument(_))
        ));
    }
}
