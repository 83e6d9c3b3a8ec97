//! Discovery and configuration frames.
//!
//! Discovery is a sentinel-prefixed broadcast command; devices answer with a
//! 146-byte little-endian record describing their identity and addressing.
//! Configuration and factory-reset frames target a device by MAC so they
//! work before the device has a routable IP.

use super::{append_crc, crc16, PACKET_SENTINEL};
use crate::detector::DetectorDescriptor;
use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Opcode of the who-is-there broadcast.
const OP_DISCOVER: u8 = 0x70;
/// Opcode of the MAC-targeted network reconfiguration.
const OP_CONFIGURE: u8 = 0x71;
/// Opcode of the MAC-targeted factory reset.
const OP_RESTORE: u8 = 0x72;

/// Size of the device-info record devices answer discovery with.
pub const DEVICE_INFO_LEN: usize = 146;

/// Byte range of the record covered by its checksum.
const CHECKSUM_SPAN: usize = 82;

/// The fixed discovery broadcast frame.
pub fn discovery_request() -> Vec<u8> {
    let mut packet = Vec::with_capacity(8);
    packet.extend_from_slice(&PACKET_SENTINEL);
    packet.extend_from_slice(&[OP_DISCOVER, 0x02, 0xFF, 0x00]);
    append_crc(&mut packet);
    packet
}

/// MAC-targeted reconfiguration of (ip, cmd_port, img_port).
pub fn configure_request(
    mac: &[u8; 6],
    ip: Ipv4Addr,
    cmd_port: u16,
    img_port: u16,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(22);
    packet.extend_from_slice(&PACKET_SENTINEL);
    packet.extend_from_slice(&[OP_CONFIGURE, 0x01, 0xFF, 14]);
    packet.extend_from_slice(mac);
    packet.extend_from_slice(&ip.octets());
    packet.extend_from_slice(&cmd_port.to_be_bytes());
    packet.extend_from_slice(&img_port.to_be_bytes());
    append_crc(&mut packet);
    packet
}

/// MAC-targeted reset to factory defaults (192.168.1.2, 3000, 4001).
pub fn restore_request(mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(14);
    packet.extend_from_slice(&PACKET_SENTINEL);
    packet.extend_from_slice(&[OP_RESTORE, 0x01, 0xFF, 6]);
    packet.extend_from_slice(mac);
    append_crc(&mut packet);
    packet
}

/// Parse a discovery response record into a descriptor.
///
/// Record layout (little-endian):
/// `mac[6] ip[32] cmd_port:u16 img_port:u16 serial[32] pixel_count:u32
/// module_count:u8 card_type:u8 firmware:u16 checksum:u16 reserved[62]`.
/// The checksum covers the first 82 bytes. Strings are NUL-padded.
pub fn parse_device_info(bytes: &[u8]) -> Result<DetectorDescriptor> {
    if bytes.len() < CHECKSUM_SPAN + 2 {
        return Err(Error::ShortRead(bytes.len()));
    }

    let stored = u16::from_le_bytes([bytes[CHECKSUM_SPAN], bytes[CHECKSUM_SPAN + 1]]);
    let computed = crc16(&bytes[..CHECKSUM_SPAN]);
    if stored != computed {
        return Err(Error::CrcMismatch {
            expected: computed,
            actual: stored,
        });
    }

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[0..6]);

    let ip_text = padded_str(&bytes[6..38]);
    let ip: Ipv4Addr = ip_text
        .parse()
        .map_err(|_| Error::InvalidArgument("unparseable IP in device record"))?;

    let descriptor = DetectorDescriptor {
        ip,
        mac,
        cmd_port: u16::from_le_bytes([bytes[38], bytes[39]]),
        img_port: u16::from_le_bytes([bytes[40], bytes[41]]),
        serial_number: padded_str(&bytes[42..74]).to_string(),
        pixel_count: u32::from_le_bytes([bytes[74], bytes[75], bytes[76], bytes[77]]),
        module_count: bytes[78],
        card_type: bytes[79],
        firmware_version: u16::from_le_bytes([bytes[80], bytes[81]]),
        ..Default::default()
    };
    descriptor.validate()?;
    Ok(descriptor)
}

/// Build a device-info record (used by tests and device simulation).
pub fn encode_device_info(descriptor: &DetectorDescriptor) -> Vec<u8> {
    let mut bytes = vec![0u8; DEVICE_INFO_LEN];
    bytes[0..6].copy_from_slice(&descriptor.mac);

    let ip = descriptor.ip.to_string();
    bytes[6..6 + ip.len().min(31)].copy_from_slice(&ip.as_bytes()[..ip.len().min(31)]);

    bytes[38..40].copy_from_slice(&descriptor.cmd_port.to_le_bytes());
    bytes[40..42].copy_from_slice(&descriptor.img_port.to_le_bytes());

    let serial = descriptor.serial_number.as_bytes();
    let serial_len = serial.len().min(31);
    bytes[42..42 + serial_len].copy_from_slice(&serial[..serial_len]);

    bytes[74..78].copy_from_slice(&descriptor.pixel_count.to_le_bytes());
    bytes[78] = descriptor.module_count;
    bytes[79] = descriptor.card_type;
    bytes[80..82].copy_from_slice(&descriptor.firmware_version.to_le_bytes());

    let checksum = crc16(&bytes[..CHECKSUM_SPAN]);
    bytes[82..84].copy_from_slice(&checksum.to_le_bytes());
    bytes
}

fn padded_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> DetectorDescriptor {
        DetectorDescriptor {
            ip: Ipv4Addr::new(192, 168, 1, 50),
            mac: [0x02, 0x11, 0x22, 0x33, 0x44, 0x55],
            cmd_port: 3000,
            img_port: 4001,
            serial_number: "GCU-00172".to_string(),
            pixel_count: 8192,
            module_count: 8,
            card_type: 4,
            firmware_version: 0x0203,
            ..Default::default()
        }
    }

    #[test]
    fn device_info_round_trip() {
        let descriptor = sample_descriptor();
        let record = encode_device_info(&descriptor);
        assert_eq!(record.len(), DEVICE_INFO_LEN);

        let parsed = parse_device_info(&record).unwrap();
        assert_eq!(parsed.ip, descriptor.ip);
        assert_eq!(parsed.mac, descriptor.mac);
        assert_eq!(parsed.cmd_port, 3000);
        assert_eq!(parsed.img_port, 4001);
        assert_eq!(parsed.serial_number, "GCU-00172");
        assert_eq!(parsed.pixel_count, 8192);
        assert_eq!(parsed.module_count, 8);
        assert_eq!(parsed.card_type, 4);
        assert_eq!(parsed.firmware_version, 0x0203);
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let mut record = encode_device_info(&sample_descriptor());
        record[0] ^= 0xFF;
        assert!(matches!(
            parse_device_info(&record),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn discovery_frame_is_sentinel_prefixed() {
        let frame = discovery_request();
        assert_eq!(&frame[..2], &PACKET_SENTINEL);
        assert_eq!(frame[2], 0x70);
        assert!(super::super::verify_crc(&frame));
    }

    #[test]
    fn configure_frame_carries_all_fields() {
        let mac = [1, 2, 3, 4, 5, 6];
        let frame = configure_request(&mac, Ipv4Addr::new(10, 0, 0, 2), 3100, 4100);
        assert_eq!(&frame[..2], &PACKET_SENTINEL);
        assert_eq!(frame[2], 0x71);
        assert_eq!(&frame[6..12], &mac);
        assert_eq!(&frame[12..16], &[10, 0, 0, 2]);
        assert_eq!(&frame[16..18], &3100u16.to_be_bytes());
        assert_eq!(&frame[18..20], &4100u16.to_be_bytes());
        assert!(super::super::verify_crc(&frame));
    }
}
