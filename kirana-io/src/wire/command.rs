//! Command codes and request/response framing.
//!
//! The opcode table follows the GCU's wire-level command list. Each code
//! carries its payload layout and DM-index semantics: index 0 addresses the
//! GCU itself, 1..N a specific detector module, 0xFF all modules (writes
//! only - reads against 0xFF are rejected before they reach the wire).

use super::{append_crc, verify_crc, MAX_PAYLOAD};
use crate::error::{Error, Result};

/// Wire operation byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Execute = 0x00,
    Write = 0x01,
    Read = 0x02,
    Load = 0x04,
}

/// Payload layout of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    None,
    U8,
    U16,
    U32,
    /// Raw bytes, length from the response header.
    Text,
}

impl PayloadKind {
    /// Scalar width in bytes; zero for `None`/`Text`.
    pub fn width(self) -> usize {
        match self {
            PayloadKind::None | PayloadKind::Text => 0,
            PayloadKind::U8 => 1,
            PayloadKind::U16 => 2,
            PayloadKind::U32 => 4,
        }
    }
}

/// DM-index addressing rules of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmScope {
    /// Only the GCU itself (index 0).
    GcuOnly,
    /// A specific module (1..N).
    PerModule,
    /// A specific module or all modules at once (0xFF, writes only).
    ModuleOrAll,
}

/// Broadcast index addressing every module.
pub const DM_ALL: u8 = 0xFF;

/// The GCU's command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    // Executable commands
    SaveSettings,
    LoadSettings,
    RestoreDefaults,
    SendFrameTrigger,

    // Scalar registers
    IntegrationTime,
    NonIntegrationTime,
    OperationMode,
    DmGain,
    ChannelConfig,
    BaselineValue,
    OutputScale,
    LineTriggerMode,
    LineTriggerEnable,
    LineTriggerFineDelay,
    LineTriggerRawDelay,
    FrameTriggerMode,
    FrameTriggerEnable,
    FrameTriggerDelay,
    TriggerParity,
    PixelNumber,
    PixelSize,
    GcuFirmware,
    LedControl,
    EnergyMode,

    // String reads
    GcuSerial,
    DmSerial,

    // Telemetry blob (temperature / humidity)
    GcuInfo,
}

impl CommandCode {
    /// Wire opcode.
    pub fn opcode(self) -> u8 {
        match self {
            CommandCode::SaveSettings => 0x10,
            CommandCode::LoadSettings => 0x10,
            CommandCode::RestoreDefaults => 0x11,
            CommandCode::IntegrationTime => 0x20,
            CommandCode::NonIntegrationTime => 0x21,
            CommandCode::OperationMode => 0x22,
            CommandCode::DmGain => 0x23,
            CommandCode::ChannelConfig => 0x25,
            CommandCode::BaselineValue => 0x35,
            CommandCode::OutputScale => 0x43,
            CommandCode::LineTriggerMode => 0x50,
            CommandCode::LineTriggerEnable => 0x51,
            CommandCode::LineTriggerFineDelay => 0x52,
            CommandCode::LineTriggerRawDelay => 0x53,
            CommandCode::FrameTriggerMode => 0x54,
            CommandCode::FrameTriggerEnable => 0x55,
            CommandCode::FrameTriggerDelay => 0x56,
            CommandCode::SendFrameTrigger => 0x57,
            CommandCode::TriggerParity => 0x5A,
            CommandCode::GcuSerial => 0x62,
            CommandCode::DmSerial => 0x63,
            CommandCode::PixelNumber => 0x64,
            CommandCode::PixelSize => 0x65,
            CommandCode::GcuFirmware => 0x68,
            CommandCode::GcuInfo => 0x72,
            CommandCode::LedControl => 0x75,
            CommandCode::EnergyMode => 0x7B,
        }
    }

    /// Payload layout for reads and writes.
    pub fn payload_kind(self) -> PayloadKind {
        match self {
            CommandCode::SaveSettings
            | CommandCode::LoadSettings
            | CommandCode::RestoreDefaults
            | CommandCode::SendFrameTrigger => PayloadKind::None,

            CommandCode::OperationMode
            | CommandCode::LineTriggerMode
            | CommandCode::LineTriggerEnable
            | CommandCode::FrameTriggerMode
            | CommandCode::TriggerParity
            | CommandCode::PixelSize
            | CommandCode::LedControl
            | CommandCode::EnergyMode => PayloadKind::U8,

            CommandCode::NonIntegrationTime
            | CommandCode::DmGain
            | CommandCode::BaselineValue
            | CommandCode::OutputScale
            | CommandCode::LineTriggerFineDelay
            | CommandCode::LineTriggerRawDelay
            | CommandCode::FrameTriggerEnable
            | CommandCode::PixelNumber
            | CommandCode::GcuFirmware => PayloadKind::U16,

            CommandCode::IntegrationTime
            | CommandCode::ChannelConfig
            | CommandCode::FrameTriggerDelay => PayloadKind::U32,

            CommandCode::GcuSerial | CommandCode::DmSerial | CommandCode::GcuInfo => {
                PayloadKind::Text
            }
        }
    }

    /// DM-index addressing rule.
    pub fn scope(self) -> DmScope {
        match self {
            CommandCode::DmGain | CommandCode::DmSerial => DmScope::PerModule,
            CommandCode::BaselineValue => DmScope::ModuleOrAll,
            _ => DmScope::GcuOnly,
        }
    }

    /// True for commands issued with `operate` rather than read/write.
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            CommandCode::SaveSettings
                | CommandCode::LoadSettings
                | CommandCode::RestoreDefaults
                | CommandCode::SendFrameTrigger
        )
    }

    /// Wire operation used when the command is executed.
    pub fn execute_operation(self) -> Operation {
        match self {
            CommandCode::LoadSettings | CommandCode::RestoreDefaults => Operation::Load,
            _ => Operation::Execute,
        }
    }
}

/// Payload layout for a raw opcode, if the opcode is known.
///
/// Reads resolve the scalar width of a response from this table; the device
/// stub uses it to answer with the right number of bytes.
pub fn payload_kind_for_opcode(opcode: u8) -> Option<PayloadKind> {
    let kind = match opcode {
        0x10 | 0x11 | 0x57 => PayloadKind::None,
        0x22 | 0x50 | 0x51 | 0x54 | 0x5A | 0x65 | 0x75 | 0x7B => PayloadKind::U8,
        0x21 | 0x23 | 0x35 | 0x43 | 0x52 | 0x53 | 0x55 | 0x64 | 0x68 => PayloadKind::U16,
        0x20 | 0x25 | 0x56 => PayloadKind::U32,
        0x62 | 0x63 | 0x72 => PayloadKind::Text,
        _ => return None,
    };
    Some(kind)
}

/// Encode a register write. The value travels big-endian at the register's
/// width.
pub fn encode_write(code: CommandCode, value: u64, dm_index: u8) -> Result<Vec<u8>> {
    let kind = code.payload_kind();
    let width = kind.width();
    if width == 0 {
        return Err(Error::Unsupported);
    }
    if width < 8 && value >= 1u64 << (width * 8) {
        return Err(Error::InvalidArgument("value exceeds register width"));
    }

    let mut packet = Vec::with_capacity(4 + width + 2);
    packet.push(code.opcode());
    packet.push(Operation::Write as u8);
    packet.push(dm_index);
    packet.push(width as u8);
    packet.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    append_crc(&mut packet);
    Ok(packet)
}

/// Encode a register or string read.
pub fn encode_read(code: CommandCode, dm_index: u8) -> Vec<u8> {
    let mut packet = vec![code.opcode(), Operation::Read as u8, dm_index, 0];
    append_crc(&mut packet);
    packet
}

/// Encode an executable command (save/load/restore/trigger).
pub fn encode_execute(code: CommandCode) -> Result<Vec<u8>> {
    if !code.is_executable() {
        return Err(Error::Unsupported);
    }
    let mut packet = vec![code.opcode(), code.execute_operation() as u8, 0, 0];
    append_crc(&mut packet);
    Ok(packet)
}

/// A decoded, validated response.
#[derive(Debug, Clone)]
pub struct Response {
    pub opcode: u8,
    pub operation: u8,
    pub payload: Vec<u8>,
}

/// Decode a response and check it against the request it answers.
///
/// Checks, in order: minimum length, CRC, opcode echo, operation echo,
/// device error code, payload length consistency.
pub fn decode_response(bytes: &[u8], sent_opcode: u8, sent_operation: u8) -> Result<Response> {
    if bytes.len() < 6 {
        return Err(Error::ShortRead(bytes.len()));
    }
    if !verify_crc(bytes) {
        let body = &bytes[..bytes.len() - 2];
        let trailer = &bytes[bytes.len() - 2..];
        return Err(Error::CrcMismatch {
            expected: super::crc16(body),
            actual: u16::from_le_bytes([trailer[0], trailer[1]]),
        });
    }
    if bytes[0] != sent_opcode {
        return Err(Error::OpcodeMismatch {
            sent: sent_opcode,
            echoed: bytes[0],
        });
    }
    if bytes[1] != sent_operation {
        return Err(Error::OpcodeMismatch {
            sent: sent_operation,
            echoed: bytes[1],
        });
    }
    if bytes[2] != 0 {
        return Err(Error::DeviceError(bytes[2]));
    }

    let data_len = bytes[3] as usize;
    if data_len > MAX_PAYLOAD || 4 + data_len + 2 > bytes.len() {
        return Err(Error::ShortRead(bytes.len()));
    }

    Ok(Response {
        opcode: bytes[0],
        operation: bytes[1],
        payload: bytes[4..4 + data_len].to_vec(),
    })
}

/// Interpret a scalar payload as a big-endian value of the given layout.
pub fn payload_to_u64(kind: PayloadKind, payload: &[u8]) -> Result<u64> {
    let width = kind.width();
    if width == 0 {
        return Err(Error::Unsupported);
    }
    if payload.len() < width {
        return Err(Error::ShortRead(payload.len()));
    }
    let mut value = 0u64;
    for &byte in &payload[..width] {
        value = (value << 8) | byte as u64;
    }
    Ok(value)
}

/// Build a well-formed response packet (used by the device stub and tests).
pub fn encode_response(opcode: u8, operation: u8, error_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + payload.len() + 2);
    packet.push(opcode);
    packet.push(operation);
    packet.push(error_code);
    packet.push(payload.len() as u8);
    packet.extend_from_slice(payload);
    append_crc(&mut packet);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_time_write_layout() {
        let packet = encode_write(CommandCode::IntegrationTime, 12345, 0).unwrap();
        assert_eq!(&packet[..4], &[0x20, 0x01, 0x00, 0x04]);
        assert_eq!(&packet[4..8], &[0x00, 0x00, 0x30, 0x39]);
        assert!(verify_crc(&packet));
    }

    #[test]
    fn read_has_empty_payload() {
        let packet = encode_read(CommandCode::DmGain, 2);
        assert_eq!(&packet[..4], &[0x23, 0x02, 0x02, 0x00]);
        assert!(verify_crc(&packet));
    }

    #[test]
    fn executables_pick_the_right_operation() {
        let save = encode_execute(CommandCode::SaveSettings).unwrap();
        assert_eq!(&save[..2], &[0x10, 0x00]);
        let load = encode_execute(CommandCode::LoadSettings).unwrap();
        assert_eq!(&load[..2], &[0x10, 0x04]);
        let restore = encode_execute(CommandCode::RestoreDefaults).unwrap();
        assert_eq!(&restore[..2], &[0x11, 0x04]);
        assert!(encode_execute(CommandCode::DmGain).is_err());
    }

    #[test]
    fn write_of_oversized_value_is_rejected() {
        assert!(matches!(
            encode_write(CommandCode::OperationMode, 0x100, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            encode_write(CommandCode::GcuSerial, 1, 0),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn response_round_trip() {
        let response = encode_response(0x20, 0x02, 0, &[0x00, 0x00, 0x30, 0x39]);
        let decoded = decode_response(&response, 0x20, 0x02).unwrap();
        assert_eq!(
            payload_to_u64(PayloadKind::U32, &decoded.payload).unwrap(),
            12345
        );
    }

    #[test]
    fn decode_rejects_each_fault_in_order() {
        // Short
        assert!(matches!(
            decode_response(&[0x20, 0x02, 0x00], 0x20, 0x02),
            Err(Error::ShortRead(3))
        ));

        // CRC
        let mut corrupted = encode_response(0x20, 0x02, 0, &[1]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        assert!(matches!(
            decode_response(&corrupted, 0x20, 0x02),
            Err(Error::CrcMismatch { .. })
        ));

        // Opcode echo
        let response = encode_response(0x21, 0x02, 0, &[1]);
        assert!(matches!(
            decode_response(&response, 0x20, 0x02),
            Err(Error::OpcodeMismatch { .. })
        ));

        // Device error code
        let response = encode_response(0x20, 0x02, 7, &[]);
        assert!(matches!(
            decode_response(&response, 0x20, 0x02),
            Err(Error::DeviceError(7))
        ));
    }

    #[test]
    fn every_code_round_trips_through_the_opcode_table() {
        let codes = [
            CommandCode::SaveSettings,
            CommandCode::LoadSettings,
            CommandCode::RestoreDefaults,
            CommandCode::SendFrameTrigger,
            CommandCode::IntegrationTime,
            CommandCode::NonIntegrationTime,
            CommandCode::OperationMode,
            CommandCode::DmGain,
            CommandCode::ChannelConfig,
            CommandCode::BaselineValue,
            CommandCode::OutputScale,
            CommandCode::LineTriggerMode,
            CommandCode::LineTriggerEnable,
            CommandCode::LineTriggerFineDelay,
            CommandCode::LineTriggerRawDelay,
            CommandCode::FrameTriggerMode,
            CommandCode::FrameTriggerEnable,
            CommandCode::FrameTriggerDelay,
            CommandCode::TriggerParity,
            CommandCode::PixelNumber,
            CommandCode::PixelSize,
            CommandCode::GcuFirmware,
            CommandCode::LedControl,
            CommandCode::EnergyMode,
            CommandCode::GcuSerial,
            CommandCode::DmSerial,
            CommandCode::GcuInfo,
        ];
        for code in codes {
            assert_eq!(
                payload_kind_for_opcode(code.opcode()),
                Some(code.payload_kind()),
                "table mismatch for {:?}",
                code
            );
        }
    }
}
