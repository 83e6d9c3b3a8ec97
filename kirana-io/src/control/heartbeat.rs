//! Background heartbeat thread for the command session.
//!
//! Polls the GCU info register once per period. A successful poll resets the
//! miss counter and publishes temperature and humidity to the sink; after
//! ten consecutive misses one HEARTBEAT_FAIL error is emitted, the counter
//! resets and polling continues. The thread stops cooperatively: the session
//! sets the shutdown flag and joins.

use crate::error::Result;
use crate::sink::{cmd_error, cmd_event, error_id, event_id, CmdSink};
use crate::transport::CommandTransport;
use crate::wire::command::{decode_response, encode_read, CommandCode, Operation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consecutive misses before HEARTBEAT_FAIL is raised.
pub const MISS_THRESHOLD: u32 = 10;

/// Slice the period so shutdown is observed quickly.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Handle to a running heartbeat thread.
pub struct Heartbeat {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Signal the thread and join it. Unconditional on the teardown path.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("heartbeat thread panicked during join");
            }
        }
    }
}

/// Spawn the heartbeat thread.
pub fn spawn(
    transport: Arc<Mutex<Box<dyn CommandTransport>>>,
    sink: Option<Weak<dyn CmdSink>>,
    period: Duration,
) -> Heartbeat {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let thread = thread::spawn(move || {
        log::info!("heartbeat thread started (period {:?})", period);
        let mut missed = 0u32;

        'outer: loop {
            // Sleep one period in slices so close() never waits long
            let mut slept = Duration::ZERO;
            while slept < period {
                if flag.load(Ordering::Relaxed) {
                    break 'outer;
                }
                let slice = SHUTDOWN_POLL.min(period - slept);
                thread::sleep(slice);
                slept += slice;
            }
            if flag.load(Ordering::Relaxed) {
                break;
            }

            match poll_gcu_info(&transport) {
                Ok((temperature, humidity)) => {
                    if missed > 0 {
                        log::info!("heartbeat recovered after {} misses", missed);
                    }
                    missed = 0;
                    cmd_event(&sink, event_id::TEMPERATURE, temperature);
                    cmd_event(&sink, event_id::HUMIDITY, humidity);
                }
                Err(e) => {
                    missed += 1;
                    log::debug!("heartbeat miss {}/{}: {}", missed, MISS_THRESHOLD, e);
                    if missed >= MISS_THRESHOLD {
                        log::warn!(
                            "heartbeat lost contact ({} consecutive misses)",
                            missed
                        );
                        cmd_error(
                            &sink,
                            error_id::HEARTBEAT_FAIL,
                            "heartbeat failed: 10 consecutive misses",
                        );
                        missed = 0;
                    }
                }
            }
        }

        log::info!("heartbeat thread stopped");
    });

    Heartbeat {
        shutdown,
        thread: Some(thread),
    }
}

/// One GCU info read: returns (temperature C, humidity %).
fn poll_gcu_info(
    transport: &Arc<Mutex<Box<dyn CommandTransport>>>,
) -> Result<(f32, f32)> {
    let request = encode_read(CommandCode::GcuInfo, 0);
    let bytes = {
        let mut transport = transport.lock();
        transport.transact(&request)?
    };
    let response = decode_response(
        &bytes,
        CommandCode::GcuInfo.opcode(),
        Operation::Read as u8,
    )?;
    Ok(parse_gcu_info(&response.payload))
}

/// Temperature and humidity arrive as little-endian tenths in the first
/// four payload bytes; anything shorter reads as zero.
pub fn parse_gcu_info(payload: &[u8]) -> (f32, f32) {
    let temperature = if payload.len() >= 2 {
        u16::from_le_bytes([payload[0], payload[1]]) as f32 / 10.0
    } else {
        0.0
    };
    let humidity = if payload.len() >= 4 {
        u16::from_le_bytes([payload[2], payload[3]]) as f32 / 10.0
    } else {
        0.0
    };
    (temperature, humidity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcu_info_parsing() {
        // 25.3 C, 40.1 %
        let payload = [253u16.to_le_bytes(), 401u16.to_le_bytes()].concat();
        let (t, h) = parse_gcu_info(&payload);
        assert!((t - 25.3).abs() < 1e-5);
        assert!((h - 40.1).abs() < 1e-5);
    }

    #[test]
    fn short_payload_reads_as_zero() {
        assert_eq!(parse_gcu_info(&[]), (0.0, 0.0));
        let (t, h) = parse_gcu_info(&500u16.to_le_bytes());
        assert!((t - 50.0).abs() < 1e-5);
        assert_eq!(h, 0.0);
    }
}
