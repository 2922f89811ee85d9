//! Packet codec.
//!
//! Outbound packets carry a one-byte length prefix (the CP2110 report id) in
//! front of the framed packet; inbound packets are reassembled from reports
//! and start directly at STX:
//!
//! ```text
//! [len] STX 'i' 'S' 'P' 'c' size c0 c1 c2 c3 payload... crc_hi crc_lo ETX
//! ```
//!
//! `size` counts everything after itself: command, payload, checksum and ETX.

use crate::constants::{CHECKSUM_SIZE, COMMAND_SIZE, ETX, HEADER_MAGIC, HEADER_SIZE, PACKET_OVERHEAD, STX};
use crate::crc;
use crate::error::{DriverError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `RSNB`: read serial number
    ReadSerial,
    /// `RTIM`: read device clock
    ReadTime,
    /// `WTIM`: write device clock
    WriteTime,
    /// `NCOT`: number of stored records
    RecordCount,
    /// `GLUC`: read a range of stored glucose/ketone results
    GlucoseResult,
    /// Any token we do not recognise, including device error tokens
    Other([u8; 4]),
}

impl Command {
    pub fn token(&self) -> [u8; 4] {
        match self {
            Command::ReadSerial => *b"RSNB",
            Command::ReadTime => *b"RTIM",
            Command::WriteTime => *b"WTIM",
            Command::RecordCount => *b"NCOT",
            Command::GlucoseResult => *b"GLUC",
            Command::Other(token) => *token,
        }
    }

    /// Glucose results are sent without a valid checksum by the meter firmware.
    pub fn is_checksum_exempt(&self) -> bool {
        matches!(self, Command::GlucoseResult)
    }
}

impl From<[u8; 4]> for Command {
    fn from(token: [u8; 4]) -> Self {
        match &token {
            b"RSNB" => Command::ReadSerial,
            b"RTIM" => Command::ReadTime,
            b"WTIM" => Command::WriteTime,
            b"NCOT" => Command::RecordCount,
            b"GLUC" => Command::GlucoseResult,
            _ => Command::Other(token),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.token()))
    }
}

/// Wire layout of the fixed packet prefix.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct HeaderRaw {
    stx: u8,
    magic: [u8; 4],
    size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub size: u8,
}

impl Header {
    /// Total length of the packet this header announces, STX through ETX.
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    pub command: Command,
    pub data: Bytes,
    pub checksum: u16,
}

/// A validated inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub command: Command,
    pub payload: Bytes,
    pub checksum: u16,
}

/// Build an outbound packet, length prefix included.
///
/// Keeping `payload` within what a single report and the one-byte size field
/// can carry is up to the caller.
pub fn encode(command: Command, payload: &[u8]) -> Bytes {
    let datalen = PACKET_OVERHEAD + payload.len();
    let packetlen = datalen + PACKET_OVERHEAD;

    let mut buf = BytesMut::with_capacity(packetlen);
    buf.put_u8((packetlen - 1) as u8);
    buf.put_u8(STX);
    buf.put_slice(&HEADER_MAGIC);
    buf.put_u8(datalen as u8);
    buf.put_slice(&command.token());
    buf.put_slice(payload);

    // covers STX..payload and the terminator that follows the checksum slot
    let crc = crc::framed_checksum(&buf[1..]);
    buf.put_u16(crc);
    buf.put_u8(ETX);
    buf.freeze()
}

/// Validate the fixed prefix of a reassembled packet.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    let (raw, _) = HeaderRaw::ref_from_prefix(bytes).map_err(|_| {
        DriverError::HeaderVerify(format!("need {} header bytes, got {}", HEADER_SIZE, bytes.len()))
    })?;
    if raw.stx != STX {
        return Err(DriverError::HeaderVerify(format!("expected STX, got {:#04x}", raw.stx)));
    }
    if raw.magic != HEADER_MAGIC {
        return Err(DriverError::HeaderVerify(format!(
            "bad magic {}",
            hex::encode(raw.magic)
        )));
    }
    Ok(Header {
        magic: raw.magic,
        size: raw.size,
    })
}

/// Slice command, data and checksum out of a packet whose header was already validated.
pub fn decode_body(bytes: &Bytes, size: u8) -> Result<Body> {
    let size = size as usize;
    if size < PACKET_OVERHEAD {
        return Err(DriverError::SizeVerify(format!(
            "declared size {size} is below the {PACKET_OVERHEAD}-byte minimum"
        )));
    }
    if bytes.len() < HEADER_SIZE + size {
        return Err(DriverError::SizeVerify(format!(
            "expected {} bytes, got {}",
            HEADER_SIZE + size,
            bytes.len()
        )));
    }

    let command_end = HEADER_SIZE + COMMAND_SIZE;
    let data_end = command_end + size - PACKET_OVERHEAD;
    let token: [u8; 4] = bytes[HEADER_SIZE..command_end].try_into()?;
    let checksum = u16::from_be_bytes(bytes[data_end..data_end + CHECKSUM_SIZE].try_into()?);

    Ok(Body {
        command: Command::from(token),
        data: bytes.slice(command_end..data_end),
        checksum,
    })
}

/// Recompute the trailer checksum of a reassembled packet.
///
/// `bytes` runs from STX through ETX. The checksum bytes are cut out and the
/// CRC is taken over what remains, terminator included. Glucose results skip
/// verification.
pub fn verify_checksum(bytes: &[u8], command: Command) -> Result<()> {
    if command.is_checksum_exempt() {
        return Ok(());
    }
    let body_end = bytes
        .len()
        .checked_sub(CHECKSUM_SIZE + 1)
        .ok_or_else(|| DriverError::SizeVerify("packet too short for a checksum".to_string()))?;
    let (covered, trailer) = bytes.split_at(body_end);
    let expected = u16::from_be_bytes(trailer[..CHECKSUM_SIZE].try_into()?);

    let mut region = Vec::with_capacity(covered.len() + 1);
    region.extend_from_slice(covered);
    region.push(trailer[CHECKSUM_SIZE]);
    let actual = crc::checksum(&region);
    if expected != actual {
        return Err(DriverError::ChecksumVerify(format!(
            "packet says {expected:#06x}, computed {actual:#06x}"
        )));
    }
    Ok(())
}

impl TryFrom<Bytes> for Packet {
    type Error = DriverError;

    fn try_from(bytes: Bytes) -> Result<Self> {
        let header = decode_header(&bytes)?;
        let body = decode_body(&bytes, header.size)?;
        let packet_bytes = &bytes[..header.packet_len()];
        if packet_bytes.last() != Some(&ETX) {
            return Err(DriverError::SizeVerify("packet does not end with ETX".to_string()));
        }
        verify_checksum(packet_bytes, body.command)?;
        Ok(Packet {
            header,
            command: body.command,
            payload: body.data,
            checksum: body.checksum,
        })
    }
}

impl Packet {
    /// Header, body and checksum validation in one step.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        Packet::try_from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drop the outbound length prefix, leaving what the reassembler would produce.
    fn framed(command: Command, payload: &[u8]) -> Bytes {
        encode(command, payload).slice(1..)
    }

    #[test]
    fn test_encode_read_serial() {
        let encoded = encode(Command::ReadSerial, &[]);
        assert_eq!(hex::encode(&encoded), "0d02695350630752534e42682b03");
    }

    #[test]
    fn test_encode_write_time() {
        let encoded = encode(Command::WriteTime, &[24, 3, 15, 10, 30, 0]);
        assert_eq!(hex::encode(&encoded), "1302695350630d5754494d18030f0a1e00129103");
        assert_eq!(encoded[0] as usize, encoded.len() - 1);
    }

    #[test]
    fn test_round_trip_payload_lengths() {
        for len in [0usize, 1, 4, 6, 50, 243] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let bytes = framed(Command::ReadTime, &payload);
            let header = decode_header(&bytes).unwrap();
            assert_eq!(header.size as usize, PACKET_OVERHEAD + len);
            let body = decode_body(&bytes, header.size).unwrap();
            assert_eq!(body.command, Command::ReadTime);
            assert_eq!(body.data.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = framed(Command::ReadSerial, &[]).to_vec();
        bytes[2] = b'X';
        assert!(matches!(decode_header(&bytes), Err(DriverError::HeaderVerify(_))));
    }

    #[test]
    fn test_short_header() {
        assert!(matches!(decode_header(&[STX, b'i']), Err(DriverError::HeaderVerify(_))));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = framed(Command::ReadSerial, &[1, 2, 3]);
        let header = decode_header(&bytes).unwrap();
        let truncated = bytes.slice(..bytes.len() - 2);
        assert!(matches!(
            decode_body(&truncated, header.size),
            Err(DriverError::SizeVerify(_))
        ));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut bytes = framed(Command::ReadTime, &[1, 2, 3, 4, 5, 6]).to_vec();
        let crc_pos = bytes.len() - 3;
        bytes[crc_pos] ^= 0xFF;
        let result = Packet::parse(Bytes::from(bytes));
        assert!(matches!(result, Err(DriverError::ChecksumVerify(_))));
    }

    #[test]
    fn test_accepts_frame_checksummed_over_terminator() {
        // NCOT reply carrying 30 records, CRC taken over STX..payload + ETX
        let mut frame = hex::decode("0269535063094e434f54001e").unwrap();
        let crc = crc::checksum(&[frame.as_slice(), &[ETX][..]].concat());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.push(ETX);
        let packet = Packet::parse(Bytes::from(frame)).unwrap();
        assert_eq!(packet.command, Command::RecordCount);
        assert_eq!(packet.payload.as_ref(), &[0x00, 0x1e]);
    }

    #[test]
    fn test_checksum_without_terminator_rejected() {
        let body = hex::decode("02695350630752534e42").unwrap();
        let mut frame = body.clone();
        frame.extend_from_slice(&crc::checksum(&body).to_be_bytes());
        frame.push(ETX);
        assert!(matches!(
            Packet::parse(Bytes::from(frame)),
            Err(DriverError::ChecksumVerify(_))
        ));
    }

    #[test]
    fn test_glucose_result_checksum_exempt() {
        let mut bytes = framed(Command::GlucoseResult, &[0u8; 9]).to_vec();
        let crc_pos = bytes.len() - 3;
        bytes[crc_pos] ^= 0xFF;
        bytes[crc_pos + 1] ^= 0xFF;
        let packet = Packet::parse(Bytes::from(bytes)).unwrap();
        assert_eq!(packet.command, Command::GlucoseResult);
        assert_eq!(packet.payload.len(), 9);
    }

    #[test]
    fn test_unknown_token_preserved() {
        let bytes = framed(Command::Other(*b"ECMD"), &[]);
        let packet = Packet::parse(bytes).unwrap();
        assert_eq!(packet.command, Command::Other(*b"ECMD"));
        assert_eq!(packet.command.to_string(), "ECMD");
    }
}
