//! CRC-16 used by the packet trailer.
//!
//! The meters use the ITU polynomial (0x1021) in its reflected form with the
//! ISO/IEC 14443-3 type A preset, usually called `CRC_A`. The value is sent
//! big-endian right before ETX.
//!
//! The covered region is STX through the end of the payload followed by the
//! ETX terminator, as if the checksum bytes were not there.

use crate::constants::{CHECKSUM_SIZE, ETX};
use crc::{CRC_16_ISO_IEC_14443_3_A, Crc};

const CRC_A: Crc<u16> = Crc::<u16>::new(&CRC_16_ISO_IEC_14443_3_A);

/// Checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    CRC_A.checksum(data)
}

/// Checksum of `body` (STX through payload) with the terminator appended.
pub fn framed_checksum(body: &[u8]) -> u16 {
    let mut digest = CRC_A.digest();
    digest.update(body);
    digest.update(&[ETX]);
    digest.finalize()
}

/// Checksum of the region a packet trailer covers.
///
/// `packet` is an encoded buffer as produced by [`crate::packet::encode`]
/// (length prefix first). The CRC runs from offset 1 through the payload,
/// skips the two checksum bytes and takes in the final ETX.
pub fn packet_checksum(packet: &[u8]) -> Option<u16> {
    let body_end = packet.len().checked_sub(CHECKSUM_SIZE + 1)?;
    packet.get(1..body_end).map(framed_checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(checksum(b"123456789"), 0xBF05);
    }

    #[test]
    fn test_empty_input_is_preset() {
        assert_eq!(checksum(&[]), 0x6363);
    }

    #[test]
    fn test_pinned_packet_vectors() {
        let cases = [
            ("0d02695350630752534e42682b03", 0x682B),
            ("0d0269535063075254494d30c703", 0x30C7),
            ("0d0269535063074e434f54f36703", 0xF367),
            ("1102695350630b474c55430000001ab2ec03", 0xB2EC),
            ("1302695350630d5754494d18030f0a1e00129103", 0x1291),
        ];
        for (hex_data, expected) in cases {
            let bytes = hex::decode(hex_data).unwrap();
            assert_eq!(packet_checksum(&bytes), Some(expected), "vector {hex_data}");
        }
    }

    #[test]
    fn test_modified_byte_changes_checksum() {
        let mut bytes = hex::decode("0d02695350630752534e42682b03").unwrap();
        let original = packet_checksum(&bytes).unwrap();
        bytes[8] ^= 0x01;
        assert_ne!(packet_checksum(&bytes).unwrap(), original);
    }

    #[test]
    fn test_terminator_is_covered() {
        // same STX..payload, different byte where ETX belongs
        let body = hex::decode("02695350630752534e42").unwrap();
        let mut with_other_tail = body.clone();
        with_other_tail.push(0x00);
        assert_ne!(framed_checksum(&body), checksum(&body));
        assert_ne!(framed_checksum(&body), checksum(&with_other_tail));
        assert_eq!(framed_checksum(&body), 0x682B);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(packet_checksum(&[0x01, 0x02]), None);
    }
}
