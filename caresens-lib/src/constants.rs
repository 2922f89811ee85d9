// Protocol constants for CareSens-family meters

use std::time::Duration;

/// Start-of-packet control byte
pub const STX: u8 = 0x02;

/// End-of-packet control byte
pub const ETX: u8 = 0x03;

/// Magic identifying the protocol family, follows STX in every packet
pub const HEADER_MAGIC: [u8; 4] = *b"iSPc";

/// STX + magic + size byte
pub const HEADER_SIZE: usize = 6;

/// Bytes counted by the size field on top of the payload (command + checksum + ETX)
pub const PACKET_OVERHEAD: usize = 7;

/// Length of the 4-character opcode
pub const COMMAND_SIZE: usize = 4;

/// Length of the checksum trailer
pub const CHECKSUM_SIZE: usize = 2;

/// Size of an HID report exchanged with the CP2110 bridge
pub const REPORT_SIZE: usize = 64;

/// Largest number of valid bytes a single report can carry after its length prefix
pub const MAX_REPORT_PAYLOAD: usize = REPORT_SIZE - 1;

/// Size of one stored glucose/ketone record (6 timestamp bytes, flags, value)
pub const RECORD_SIZE: usize = 9;

/// Records fetched per GLUC exchange. 27 * 9 + 7 is the largest size that
/// still fits the one-byte size field.
pub const RECORDS_PER_PAGE: u16 = 27;

/// Handshake attempts before the device is declared unresponsive
pub const PING_ATTEMPTS: u32 = 4;

/// Wake probe written straight to the bridge: a one-byte report carrying 0x80
pub const PING_PROBE: [u8; 2] = [0x01, 0x80];

/// Default bound for one command/response exchange
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Two-digit years on the wire are offsets from this year
pub const YEAR_BASE: i32 = 2000;

/// CP2110 feature report: set UART configuration
pub const REPORT_ID_UART_CONFIG: u8 = 0x50;

/// CP2110 feature report: enable/disable UART passthrough
pub const REPORT_ID_UART_ENABLE: u8 = 0x41;

/// CP2110 bridge chip USB identifiers
pub const BRIDGE_VID: u16 = 0x10C4;
pub const BRIDGE_PID: u16 = 0xEA80;
