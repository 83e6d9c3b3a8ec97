//! Command session behaviour against the in-memory device stub
//!
//! Covers the externally observable contract: exact wire bytes of a
//! register write, read-back of written values, protocol fault surfacing to
//! both the caller and the sink, and heartbeat telemetry/failure reporting.
//!
//! Run with: `cargo test --test command_session`

use kirana_io::config::CommandConfig;
use kirana_io::control::ControlSession;
use kirana_io::detector::DetectorDescriptor;
use kirana_io::error::Error;
use kirana_io::sink::{error_id, event_id, CmdSink};
use kirana_io::transport::MockCommandTransport;
use kirana_io::wire::command::CommandCode;
use kirana_io::wire::verify_crc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    errors: Mutex<Vec<(u32, String)>>,
    events: Mutex<Vec<(u32, f32)>>,
}

impl RecordingSink {
    fn error_ids(&self) -> Vec<u32> {
        self.errors.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    fn events_with_id(&self, id: u32) -> Vec<f32> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == id)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl CmdSink for RecordingSink {
    fn on_error(&self, error_id: u32, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((error_id, message.to_string()));
    }
    fn on_event(&self, event_id: u32, data: f32) {
        self.events.lock().unwrap().push((event_id, data));
    }
}

fn open_session(config: CommandConfig) -> (ControlSession, MockCommandTransport, Arc<RecordingSink>, Arc<dyn CmdSink>) {
    let transport = MockCommandTransport::new();
    let sink = Arc::new(RecordingSink::default());
    let keeper: Arc<dyn CmdSink> = sink.clone();

    let mut session = ControlSession::with_config(&config);
    session.set_sink(Arc::downgrade(&keeper));
    session
        .open_with_transport(&DetectorDescriptor::default(), Box::new(transport.clone()))
        .unwrap();
    (session, transport, sink, keeper)
}

fn no_heartbeat() -> CommandConfig {
    CommandConfig {
        heartbeat: false,
        ..Default::default()
    }
}

#[test]
fn integration_time_write_and_read_back() {
    let (session, transport, _sink, _keeper) = open_session(no_heartbeat());

    session
        .write_u64(CommandCode::IntegrationTime, 12345, 0)
        .unwrap();

    // Exact wire bytes of the request: opcode, write, GCU, 4-byte payload
    // in big-endian, then a valid CRC
    let request = transport.state().lock().unwrap().last_request.clone();
    assert_eq!(&request[..4], &[0x20, 0x01, 0x00, 0x04]);
    assert_eq!(&request[4..8], &[0x00, 0x00, 0x30, 0x39]);
    assert!(verify_crc(&request));

    let value = session.read_u64(CommandCode::IntegrationTime, 0).unwrap();
    assert_eq!(value, 12345);
}

#[test]
fn crc_fault_reaches_caller_and_sink_once() {
    let (session, transport, sink, _keeper) = open_session(no_heartbeat());

    transport.state().lock().unwrap().corrupt_next_crc = true;
    let result = session.read_u64(CommandCode::OperationMode, 0);
    assert!(matches!(result, Err(Error::CrcMismatch { .. })));
    assert_eq!(sink.error_ids(), vec![error_id::CRC_MISMATCH]);

    // Session stays open; the next command succeeds
    assert!(session.read_u64(CommandCode::OperationMode, 0).is_ok());
}

#[test]
fn device_error_is_reported_with_its_own_id() {
    let (session, transport, sink, _keeper) = open_session(no_heartbeat());

    transport.state().lock().unwrap().fail_next_with = Some(3);
    assert!(matches!(
        session.write_u64(CommandCode::LedControl, 1, 0),
        Err(Error::DeviceError(3))
    ));
    assert_eq!(sink.error_ids(), vec![error_id::DEVICE_ERROR]);
}

#[test]
fn serial_numbers_read_as_strings() {
    let (session, transport, _sink, _keeper) = open_session(no_heartbeat());

    {
        let state = transport.state();
        let mut state = state.lock().unwrap();
        state.set_string(CommandCode::GcuSerial.opcode(), 0, "GCU-4711");
        state.set_string(CommandCode::DmSerial.opcode(), 2, "DM-0002");
    }

    assert_eq!(
        session.read_string(CommandCode::GcuSerial, 0).unwrap(),
        "GCU-4711"
    );
    assert_eq!(
        session.read_string(CommandCode::DmSerial, 2).unwrap(),
        "DM-0002"
    );
    assert!(session.read_string(CommandCode::IntegrationTime, 0).is_err());
}

#[test]
fn executables_run_and_reads_of_them_fail() {
    let (session, _transport, _sink, _keeper) = open_session(no_heartbeat());
    session.operate(CommandCode::SaveSettings).unwrap();
    session.operate(CommandCode::SendFrameTrigger).unwrap();
    assert!(matches!(
        session.operate(CommandCode::DmGain),
        Err(Error::Unsupported)
    ));
}

#[test]
fn heartbeat_publishes_telemetry() {
    let config = CommandConfig {
        heartbeat: true,
        heartbeat_period_ms: 5,
        ..Default::default()
    };
    let (mut session, _transport, sink, _keeper) = open_session(config);

    // Default stub telemetry is 25.3 C / 40.1 %
    std::thread::sleep(Duration::from_millis(120));
    session.close();

    let temperatures = sink.events_with_id(event_id::TEMPERATURE);
    let humidities = sink.events_with_id(event_id::HUMIDITY);
    assert!(!temperatures.is_empty(), "no temperature events seen");
    assert!(!humidities.is_empty(), "no humidity events seen");
    assert!((temperatures[0] - 25.3).abs() < 0.01);
    assert!((humidities[0] - 40.1).abs() < 0.01);
}

#[test]
fn heartbeat_reports_loss_of_contact_once_per_threshold() {
    let config = CommandConfig {
        heartbeat: true,
        heartbeat_period_ms: 5,
        ..Default::default()
    };
    let (mut session, transport, sink, _keeper) = open_session(config);

    transport.state().lock().unwrap().drop_all = true;
    // 10 misses at 5 ms each raise one failure roughly every 50 ms
    std::thread::sleep(Duration::from_millis(400));
    session.close();

    let failures = sink
        .error_ids()
        .iter()
        .filter(|&&id| id == error_id::HEARTBEAT_FAIL)
        .count();
    assert!(failures >= 1, "no heartbeat failure reported");
    assert!(failures <= 10, "heartbeat failure spammed: {}", failures);
}

#[test]
fn commands_after_close_fail_with_session_closed() {
    let (mut session, _transport, sink, _keeper) = open_session(no_heartbeat());
    session.close();
    assert!(matches!(
        session.read_u64(CommandCode::PixelNumber, 0),
        Err(Error::NotOpen)
    ));
    assert_eq!(sink.error_ids(), vec![error_id::SESSION_CLOSED]);
}
