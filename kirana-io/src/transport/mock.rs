//! Mock transports for hardware-free testing.
//!
//! `MockCommandTransport` is an in-memory device stub: it decodes requests
//! with the real codec, keeps a register map per (opcode, dm_index) and
//! answers with well-formed response packets. Fault injection hooks cover
//! the failure paths the sessions must survive.

use super::{CommandTransport, ImageTransport};
use crate::error::{Error, Result};
use crate::wire::command::{payload_kind_for_opcode, PayloadKind};
use crate::wire::{append_crc, verify_crc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state of the simulated device.
pub struct MockDetectorState {
    registers: HashMap<(u8, u8), u64>,
    strings: HashMap<(u8, u8), String>,
    /// Temperature in tenths of a degree, reported via GCU info.
    pub temperature_tenths: u16,
    /// Relative humidity in tenths of a percent, reported via GCU info.
    pub humidity_tenths: u16,
    /// Corrupt the CRC of the next response.
    pub corrupt_next_crc: bool,
    /// Answer every transaction with a timeout.
    pub drop_all: bool,
    /// Device error code to return on the next transaction.
    pub fail_next_with: Option<u8>,
    /// Raw bytes of the most recent request.
    pub last_request: Vec<u8>,
    /// Number of transactions served (including dropped ones).
    pub transactions: u64,
}

impl MockDetectorState {
    fn new() -> Self {
        MockDetectorState {
            registers: HashMap::new(),
            strings: HashMap::new(),
            temperature_tenths: 253,
            humidity_tenths: 401,
            corrupt_next_crc: false,
            drop_all: false,
            fail_next_with: None,
            last_request: Vec::new(),
            transactions: 0,
        }
    }

    pub fn set_register(&mut self, opcode: u8, dm_index: u8, value: u64) {
        self.registers.insert((opcode, dm_index), value);
    }

    pub fn register(&self, opcode: u8, dm_index: u8) -> u64 {
        self.registers.get(&(opcode, dm_index)).copied().unwrap_or(0)
    }

    pub fn set_string(&mut self, opcode: u8, dm_index: u8, value: &str) {
        self.strings.insert((opcode, dm_index), value.to_string());
    }
}

/// Command transport backed by the simulated device.
#[derive(Clone)]
pub struct MockCommandTransport {
    state: Arc<Mutex<MockDetectorState>>,
}

impl MockCommandTransport {
    pub fn new() -> Self {
        MockCommandTransport {
            state: Arc::new(Mutex::new(MockDetectorState::new())),
        }
    }

    /// Handle kept by the test to steer and inspect the device.
    pub fn state(&self) -> Arc<Mutex<MockDetectorState>> {
        Arc::clone(&self.state)
    }
}

impl Default for MockCommandTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTransport for MockCommandTransport {
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.transactions += 1;
        state.last_request = request.to_vec();

        if state.drop_all {
            return Err(Error::Timeout(0));
        }
        if request.len() < 6 || !verify_crc(request) {
            return Err(Error::ShortRead(request.len()));
        }

        let opcode = request[0];
        let operation = request[1];
        let dm_index = request[2];
        let data_len = request[3] as usize;
        let payload = &request[4..4 + data_len.min(request.len() - 6)];

        let mut response = vec![opcode, operation];
        if let Some(code) = state.fail_next_with.take() {
            response.push(code);
            response.push(0);
        } else {
            response.push(0);
            match operation {
                // Write: store big-endian payload
                0x01 => {
                    let mut value = 0u64;
                    for &b in payload {
                        value = (value << 8) | b as u64;
                    }
                    state.registers.insert((opcode, dm_index), value);
                    response.push(0);
                }
                // Read
                0x02 => match payload_kind_for_opcode(opcode) {
                    Some(PayloadKind::Text) => {
                        if opcode == 0x72 {
                            // GCU info: temperature and humidity, LE tenths
                            response.push(4);
                            response.extend_from_slice(&state.temperature_tenths.to_le_bytes());
                            response.extend_from_slice(&state.humidity_tenths.to_le_bytes());
                        } else {
                            let text = state
                                .strings
                                .get(&(opcode, dm_index))
                                .cloned()
                                .unwrap_or_default();
                            response.push(text.len() as u8);
                            response.extend_from_slice(text.as_bytes());
                        }
                    }
                    Some(kind) => {
                        let width = kind.width();
                        let value = state.register(opcode, dm_index);
                        response.push(width as u8);
                        response.extend_from_slice(&value.to_be_bytes()[8 - width..]);
                    }
                    None => {
                        // Unknown register: device-side error
                        response[2] = 0x01;
                        response.push(0);
                    }
                },
                // Execute / load
                _ => response.push(0),
            }
        }

        append_crc(&mut response);
        if state.corrupt_next_crc {
            state.corrupt_next_crc = false;
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }
        Ok(response)
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Image transport fed from a queue of scripted packets.
#[derive(Clone)]
pub struct MockImageTransport {
    packets: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl MockImageTransport {
    pub fn new() -> Self {
        MockImageTransport {
            packets: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Queue a packet for the grab thread to receive.
    pub fn push(&self, packet: Vec<u8>) {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet);
    }

    pub fn pending(&self) -> usize {
        self.packets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MockImageTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageTransport for MockImageTransport {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match packet {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => {
                // Behave like an idle socket: brief wait, then timeout
                std::thread::sleep(Duration::from_millis(1));
                Err(Error::Timeout(1))
            }
        }
    }
}
