//! Command session: stateful control channel to one detector.
//!
//! Lifecycle runs Closed -> Opening -> Open -> Closing -> Closed. Opening
//! binds the command socket and performs one handshake read (GCU firmware)
//! to confirm the device is alive; failure falls straight back to Closed.
//! While open, the request/response cycle is serialised through a dedicated
//! transport mutex - the device is half-duplex and cannot interleave
//! requests. Wire-level failures surface twice by contract: as the typed
//! error to the caller and as one `on_error` delivery to the sink.

mod heartbeat;
pub use heartbeat::{parse_gcu_info, MISS_THRESHOLD};

use crate::config::CommandConfig;
use crate::detector::DetectorDescriptor;
use crate::error::{Error, Result};
use crate::sink::{cmd_error, error_id, CmdSink};
use crate::transport::{CommandTransport, UdpCommandTransport};
use crate::wire::command::{
    self, decode_response, CommandCode, DmScope, Operation, PayloadKind, DM_ALL,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Control channel to one detector.
pub struct ControlSession {
    descriptor: Option<DetectorDescriptor>,
    transport: Option<Arc<Mutex<Box<dyn CommandTransport>>>>,
    timeout: Duration,
    sink: Option<Weak<dyn CmdSink>>,

    heartbeat_enabled: bool,
    heartbeat_period: Duration,
    heartbeat: Option<heartbeat::Heartbeat>,
}

impl ControlSession {
    pub fn new() -> Self {
        Self::with_config(&CommandConfig::default())
    }

    /// Build a session from the `[command]` config section.
    pub fn with_config(config: &CommandConfig) -> Self {
        ControlSession {
            descriptor: None,
            transport: None,
            timeout: Duration::from_millis(config.timeout_ms),
            sink: None,
            heartbeat_enabled: config.heartbeat,
            heartbeat_period: Duration::from_millis(config.heartbeat_period_ms),
            heartbeat: None,
        }
    }

    /// Install the caller's sink. Held weakly; dropping the caller's `Arc`
    /// silently stops deliveries.
    pub fn set_sink(&mut self, sink: Weak<dyn CmdSink>) {
        self.sink = Some(sink);
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn descriptor(&self) -> Option<&DetectorDescriptor> {
        self.descriptor.as_ref()
    }

    /// Change the command deadline. Applies to the open transport as well.
    pub fn set_timeout(&mut self, timeout_ms: u64) -> Result<()> {
        self.timeout = Duration::from_millis(timeout_ms);
        if let Some(transport) = &self.transport {
            transport.lock().set_timeout(self.timeout)?;
        }
        Ok(())
    }

    /// Open the command channel over UDP to the descriptor's address.
    pub fn open(&mut self, descriptor: &DetectorDescriptor) -> Result<()> {
        descriptor.validate()?;
        let remote = SocketAddr::from((descriptor.ip, descriptor.cmd_port));
        let transport = match UdpCommandTransport::connect(remote, self.timeout) {
            Ok(t) => t,
            Err(e) => {
                cmd_error(&self.sink, error_id::NETWORK_INIT, &e.to_string());
                return Err(e);
            }
        };
        self.open_with_transport(descriptor, Box::new(transport))
    }

    /// Open on an already-built transport (device stubs, alternate links).
    pub fn open_with_transport(
        &mut self,
        descriptor: &DetectorDescriptor,
        transport: Box<dyn CommandTransport>,
    ) -> Result<()> {
        if self.is_open() {
            cmd_error(&self.sink, error_id::OPEN_FAILED, "session already open");
            return Err(Error::AlreadyOpen);
        }
        descriptor.validate()?;

        log::info!("opening command session to {}", descriptor.ip);
        let transport = Arc::new(Mutex::new(transport));

        // Handshake: one no-op register read proves liveness
        let request = command::encode_read(CommandCode::GcuFirmware, 0);
        let handshake = {
            let mut t = transport.lock();
            t.transact(&request)
        };
        let response = match handshake {
            Ok(bytes) => decode_response(
                &bytes,
                CommandCode::GcuFirmware.opcode(),
                Operation::Read as u8,
            ),
            Err(e) => Err(e),
        };
        if let Err(e) = response {
            cmd_error(&self.sink, error_id::OPEN_FAILED, &e.to_string());
            log::warn!("command session handshake failed: {}", e);
            return Err(e);
        }

        self.descriptor = Some(descriptor.clone());
        self.transport = Some(transport);
        log::info!("command session open");

        if self.heartbeat_enabled {
            self.start_heartbeat();
        }
        Ok(())
    }

    /// Close the session: stop the heartbeat, join it, drop the transport.
    /// Idempotent.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        log::info!("closing command session");
        self.stop_heartbeat();
        self.transport = None;
        self.descriptor = None;
        log::info!("command session closed");
    }

    /// Run an executable command (save / load / restore / frame trigger).
    pub fn operate(&self, code: CommandCode) -> Result<()> {
        if !code.is_executable() {
            cmd_error(
                &self.sink,
                error_id::UNSUPPORTED,
                "command is not executable",
            );
            return Err(Error::Unsupported);
        }
        let request = command::encode_execute(code)?;
        self.transact(&request, code.opcode(), code.execute_operation() as u8)?;
        Ok(())
    }

    /// Read a scalar register.
    pub fn read_u64(&self, code: CommandCode, dm_index: u8) -> Result<u64> {
        let kind = code.payload_kind();
        if kind.width() == 0 {
            cmd_error(&self.sink, error_id::UNSUPPORTED, "register is not scalar");
            return Err(Error::Unsupported);
        }
        self.check_read_index(code, dm_index)?;

        let request = command::encode_read(code, dm_index);
        let response = self.transact(&request, code.opcode(), Operation::Read as u8)?;
        command::payload_to_u64(kind, &response.payload)
    }

    /// Read a string register (GCU / DM serial numbers).
    pub fn read_string(&self, code: CommandCode, dm_index: u8) -> Result<String> {
        if !matches!(code, CommandCode::GcuSerial | CommandCode::DmSerial) {
            cmd_error(&self.sink, error_id::UNSUPPORTED, "register is not a string");
            return Err(Error::Unsupported);
        }
        self.check_read_index(code, dm_index)?;

        let request = command::encode_read(code, dm_index);
        let response = self.transact(&request, code.opcode(), Operation::Read as u8)?;
        Ok(String::from_utf8_lossy(&response.payload).into_owned())
    }

    /// Write a scalar register.
    pub fn write_u64(&self, code: CommandCode, value: u64, dm_index: u8) -> Result<()> {
        if code.payload_kind() == PayloadKind::Text || code.is_executable() {
            cmd_error(&self.sink, error_id::UNSUPPORTED, "register is not writable");
            return Err(Error::Unsupported);
        }
        if code.scope() == DmScope::GcuOnly && dm_index != 0 {
            cmd_error(&self.sink, error_id::INVALID_ARGUMENT, "register is GCU-wide");
            return Err(Error::InvalidArgument("register is GCU-wide"));
        }

        let request = command::encode_write(code, value, dm_index)?;
        self.transact(&request, code.opcode(), Operation::Write as u8)?;
        Ok(())
    }

    /// One telemetry poll: (temperature C, humidity %).
    pub fn read_gcu_info(&self) -> Result<(f32, f32)> {
        let request = command::encode_read(CommandCode::GcuInfo, 0);
        let response = self.transact(
            &request,
            CommandCode::GcuInfo.opcode(),
            Operation::Read as u8,
        )?;
        Ok(parse_gcu_info(&response.payload))
    }

    /// Start or stop heartbeat supervision. Takes effect immediately on an
    /// open session and is remembered for the next open otherwise.
    pub fn enable_heartbeat(&mut self, enable: bool) {
        self.heartbeat_enabled = enable;
        if !self.is_open() {
            return;
        }
        if enable {
            self.start_heartbeat();
        } else {
            self.stop_heartbeat();
        }
    }

    fn start_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        let Some(transport) = self.transport.as_ref() else {
            cmd_error(&self.sink, error_id::HEARTBEAT_START, "session not open");
            return;
        };
        self.heartbeat = Some(heartbeat::spawn(
            Arc::clone(transport),
            self.sink.clone(),
            self.heartbeat_period,
        ));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }

    fn check_read_index(&self, code: CommandCode, dm_index: u8) -> Result<()> {
        if dm_index == DM_ALL {
            cmd_error(
                &self.sink,
                error_id::INVALID_ARGUMENT,
                "DM index 0xFF is invalid for reads",
            );
            return Err(Error::InvalidArgument("DM index 0xFF is invalid for reads"));
        }
        if code.scope() == DmScope::GcuOnly && dm_index != 0 {
            cmd_error(&self.sink, error_id::INVALID_ARGUMENT, "register is GCU-wide");
            return Err(Error::InvalidArgument("register is GCU-wide"));
        }
        Ok(())
    }

    /// One serialised request/response cycle with decode and error
    /// mirroring to the sink.
    fn transact(
        &self,
        request: &[u8],
        opcode: u8,
        operation: u8,
    ) -> Result<command::Response> {
        let Some(transport) = self.transport.as_ref() else {
            cmd_error(&self.sink, error_id::SESSION_CLOSED, "session not open");
            return Err(Error::NotOpen);
        };

        let result = {
            let mut transport = transport.lock();
            transport.transact(request)
        };

        let decoded = match result {
            Ok(bytes) => decode_response(&bytes, opcode, operation),
            Err(e) => Err(e),
        };

        decoded.map_err(|e| {
            cmd_error(&self.sink, sink_error_id(&e), &e.to_string());
            log::debug!("command {:#04x} failed: {}", opcode, e);
            e
        })
    }
}

impl Default for ControlSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a wire/transport failure to its externally stable error id.
fn sink_error_id(error: &Error) -> u32 {
    match error {
        Error::ShortRead(_) => error_id::SHORT_RESPONSE,
        Error::DeviceError(_) => error_id::DEVICE_ERROR,
        Error::CrcMismatch { .. } | Error::OpcodeMismatch { .. } => error_id::CRC_MISMATCH,
        Error::NotOpen => error_id::SESSION_CLOSED,
        _ => error_id::COMMAND_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockCommandTransport;

    fn open_session() -> (ControlSession, MockCommandTransport) {
        let transport = MockCommandTransport::new();
        let mut session = ControlSession::with_config(&CommandConfig {
            heartbeat: false,
            ..Default::default()
        });
        session
            .open_with_transport(
                &DetectorDescriptor::default(),
                Box::new(transport.clone()),
            )
            .unwrap();
        (session, transport)
    }

    #[test]
    fn closed_session_refuses_commands() {
        let session = ControlSession::new();
        assert!(matches!(
            session.read_u64(CommandCode::IntegrationTime, 0),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn double_open_is_rejected() {
        let (mut session, _transport) = open_session();
        let another = MockCommandTransport::new();
        assert!(matches!(
            session.open_with_transport(&DetectorDescriptor::default(), Box::new(another)),
            Err(Error::AlreadyOpen)
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (session, transport) = open_session();
        session
            .write_u64(CommandCode::IntegrationTime, 777, 0)
            .unwrap();
        assert_eq!(session.read_u64(CommandCode::IntegrationTime, 0).unwrap(), 777);
        assert_eq!(transport.state().lock().unwrap().register(0x20, 0), 777);
    }

    #[test]
    fn broadcast_read_is_refused_locally() {
        let (session, transport) = open_session();
        let before = transport.state().lock().unwrap().transactions;
        assert!(session.read_u64(CommandCode::DmGain, DM_ALL).is_err());
        // Never reached the wire
        assert_eq!(transport.state().lock().unwrap().transactions, before);
    }

    #[test]
    fn per_module_write_targets_the_module() {
        let (session, transport) = open_session();
        session.write_u64(CommandCode::DmGain, 9, 3).unwrap();
        assert_eq!(transport.state().lock().unwrap().register(0x23, 3), 9);
    }

    #[test]
    fn device_error_code_is_typed() {
        let (session, transport) = open_session();
        transport.state().lock().unwrap().fail_next_with = Some(0x42);
        assert!(matches!(
            session.read_u64(CommandCode::OperationMode, 0),
            Err(Error::DeviceError(0x42))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, _transport) = open_session();
        session.close();
        session.close();
        assert!(!session.is_open());
    }
}
