//! Rebuilds one logical packet from a stream of CP2110 input reports.
//!
//! Each report starts with a byte telling how many of the following bytes
//! are valid; anything after that is padding. A packet begins at the first
//! STX seen in a valid region and ends once the buffer holds ETX and as many
//! bytes as the header announced.

use crate::constants::{ETX, HEADER_SIZE, STX};
use crate::error::{DriverError, Result};
use crate::packet::decode_header;
use crate::transport::HidTransport;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    started: bool,
    expected_len: Option<usize>,
}

/// The valid part of a report, according to its length prefix.
pub fn report_payload(report: &[u8]) -> &[u8] {
    match report.split_first() {
        Some((&len, rest)) => &rest[..(len as usize).min(rest.len())],
        None => &[],
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one raw report. Returns the complete packet (STX through ETX)
    /// once enough bytes have arrived.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Bytes>> {
        let mut payload = report_payload(report);

        if !self.started {
            match payload.iter().position(|&b| b == STX) {
                Some(start) => {
                    payload = &payload[start..];
                    self.started = true;
                }
                None => {
                    trace!("discarding {} bytes before packet start", payload.len());
                    return Ok(None);
                }
            }
        }

        self.buffer.extend_from_slice(payload);

        if self.expected_len.is_none() && self.buffer.len() >= HEADER_SIZE {
            let header = decode_header(&self.buffer)?;
            self.expected_len = Some(header.packet_len());
        }

        let Some(expected) = self.expected_len else {
            return Ok(None);
        };
        // ETX may legitimately show up inside the payload; only the length is authoritative
        if self.buffer.len() >= expected && self.buffer[HEADER_SIZE..expected].contains(&ETX) {
            let mut packet = std::mem::take(&mut self.buffer);
            packet.truncate(expected);
            self.reset();
            return Ok(Some(packet.freeze()));
        }
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.started = false;
        self.expected_len = None;
    }
}

/// Read reports from `transport` until a whole packet is assembled or `timeout` elapses.
pub async fn read_packet<T>(transport: &mut T, timeout: Duration) -> Result<Bytes>
where
    T: HidTransport + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut reassembler = Reassembler::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DriverError::Timeout(format!(
                "no complete packet within {} ms ({} bytes buffered)",
                timeout.as_millis(),
                reassembler.buffered()
            )));
        }

        let report = transport.receive(remaining).await?;
        if report.is_empty() {
            continue;
        }
        debug!("<< {}", hex::encode(&report));
        if let Some(packet) = reassembler.push(&report)? {
            return Ok(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Command, encode};

    fn fragment(packet: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        packet
            .chunks(chunk)
            .map(|c| {
                let mut report = vec![c.len() as u8];
                report.extend_from_slice(c);
                report.resize(64, 0);
                report
            })
            .collect()
    }

    #[test]
    fn test_report_payload_clamps_length() {
        assert_eq!(report_payload(&[3, 1, 2, 3, 4, 5]), &[1, 2, 3]);
        assert_eq!(report_payload(&[9, 1, 2]), &[1, 2]);
        assert!(report_payload(&[]).is_empty());
    }

    #[test]
    fn test_single_report() {
        let encoded = encode(Command::ReadSerial, b"ABC123");
        let mut r = Reassembler::new();
        let packet = r.push(&encoded).unwrap().expect("complete");
        assert_eq!(packet.as_ref(), &encoded[1..]);
    }

    #[test]
    fn test_fragmented_any_chunk_size() {
        let encoded = encode(Command::GlucoseResult, &[0x03; 40]);
        let reference = &encoded[1..];
        for chunk in 1..=reference.len() {
            let mut r = Reassembler::new();
            let mut out = Vec::new();
            for report in fragment(reference, chunk) {
                if let Some(packet) = r.push(&report).unwrap() {
                    out.push(packet);
                }
            }
            assert_eq!(out.len(), 1, "chunk size {chunk}");
            assert_eq!(out[0].as_ref(), reference, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_leading_noise_discarded() {
        let encoded = encode(Command::ReadTime, &[]);
        let mut r = Reassembler::new();
        assert!(r.push(&[4, 0xAA, 0xBB, 0xCC, 0xDD]).unwrap().is_none());
        assert!(!r.is_started());
        let mut report = vec![encoded.len() as u8, 0x55];
        report.extend_from_slice(&encoded[1..]);
        let packet = r.push(&report).unwrap().expect("complete");
        assert_eq!(packet.as_ref(), &encoded[1..]);
    }

    #[test]
    fn test_etx_inside_payload_does_not_complete_early() {
        let encoded = encode(Command::GlucoseResult, &[ETX; 20]);
        let reference = &encoded[1..];
        let mut r = Reassembler::new();
        let reports = fragment(reference, 12);
        for report in &reports[..reports.len() - 1] {
            assert!(r.push(report).unwrap().is_none());
        }
        assert!(r.push(reports.last().unwrap()).unwrap().is_some());
    }

    #[test]
    fn test_bad_header_fails() {
        let mut r = Reassembler::new();
        let result = r.push(&[6, STX, b'x', b'S', b'P', b'c', 7]);
        assert!(matches!(result, Err(DriverError::HeaderVerify(_))));
    }
}
