//! Command/response exchange with the meter.
//!
//! One request is in flight at a time: every method takes `&mut self`, sends
//! one packet and owns the transport until the reply is reassembled or the
//! read timeout runs out.

use crate::constants::{PING_ATTEMPTS, PING_PROBE, READ_TIMEOUT, RECORD_SIZE};
use crate::error::{DeviceErrorCode, DriverError, Result};
use crate::packet::{Command, Packet, encode};
use crate::reassembly::read_packet;
use crate::records::{RawRecord, decode_page, decode_timestamp, encode_timestamp};
use crate::transport::{HidTransport, UartConfig, uart_enable_report};
use bytes::{BufMut, BytesMut};
use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CommandEngine<T> {
    transport: T,
    read_timeout: Duration,
    ping_failures: u32,
}

impl<T: HidTransport> CommandEngine<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            read_timeout: READ_TIMEOUT,
            ping_failures: 0,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Configure the bridge UART and turn on passthrough.
    pub async fn init_bridge(&mut self, uart: &UartConfig) -> Result<()> {
        debug!("Configuring bridge UART: {:?}", uart);
        self.transport.send_feature_report(&uart.to_feature_report()).await?;
        self.transport.send_feature_report(&uart_enable_report(true)).await?;
        Ok(())
    }

    /// Wake the meter. Any non-empty report counts as an answer.
    pub async fn ping(&mut self) -> Result<()> {
        loop {
            self.transport.send(&PING_PROBE).await?;
            let response = self.transport.receive(self.read_timeout).await?;
            if !response.is_empty() {
                debug!("Ping answered after {} failed attempts", self.ping_failures);
                self.ping_failures = 0;
                return Ok(());
            }

            self.ping_failures += 1;
            if self.ping_failures >= PING_ATTEMPTS {
                let attempts = self.ping_failures;
                self.ping_failures = 0;
                return Err(DriverError::DeviceNotResponding { attempts });
            }
            warn!("No answer to ping, retrying ({}/{})", self.ping_failures, PING_ATTEMPTS);
        }
    }

    /// Send one command and return its validated response.
    ///
    /// Device error tokens in the response opcode are turned into the
    /// matching [`DriverError`] category.
    pub async fn send_command(&mut self, command: Command, payload: &[u8]) -> Result<Packet> {
        let request = encode(command, payload);
        debug!(">> {} {}", command, hex::encode(&request));
        self.transport.send(&request).await?;

        let raw = read_packet(&mut self.transport, self.read_timeout).await?;
        let packet = Packet::parse(raw)?;

        if let Some(code) = DeviceErrorCode::from_token(&packet.command.token()) {
            warn!("Device answered {} with error {} ({})", command, code, code.category());
            return Err(code.into());
        }
        Ok(packet)
    }

    /// Like [`send_command`](Self::send_command), but also requires the reply to echo the opcode.
    async fn exchange(&mut self, command: Command, payload: &[u8]) -> Result<Packet> {
        let packet = self.send_command(command, payload).await?;
        if packet.command != command {
            return Err(DriverError::UnexpectedResponse {
                expected: command.to_string(),
                actual: packet.command.to_string(),
            });
        }
        Ok(packet)
    }

    pub async fn read_serial_number(&mut self) -> Result<String> {
        let packet = self.exchange(Command::ReadSerial, &[]).await?;
        let serial = String::from_utf8_lossy(&packet.payload)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        info!("Serial number: {}", serial);
        Ok(serial)
    }

    pub async fn read_device_time(&mut self) -> Result<NaiveDateTime> {
        let packet = self.exchange(Command::ReadTime, &[]).await?;
        decode_timestamp(&packet.payload).ok_or_else(|| DriverError::UnexpectedResponse {
            expected: "device time".to_string(),
            actual: hex::encode(&packet.payload),
        })
    }

    /// Set the meter clock and check that it echoes the value back.
    pub async fn write_device_time(&mut self, time: NaiveDateTime) -> Result<()> {
        let written = encode_timestamp(&time);
        let packet = self.exchange(Command::WriteTime, &written).await?;
        if packet.payload.as_ref() != written.as_slice() {
            return Err(DriverError::ClockWriteMismatch {
                written: hex::encode(written),
                echoed: hex::encode(&packet.payload),
            });
        }
        info!("Device clock set to {}", time);
        Ok(())
    }

    pub async fn read_record_count(&mut self) -> Result<u16> {
        let packet = self.exchange(Command::RecordCount, &[]).await?;
        let bytes: [u8; 2] = packet
            .payload
            .get(..2)
            .ok_or_else(|| DriverError::SizeVerify(format!("record count needs 2 bytes, got {}", packet.payload.len())))?
            .try_into()?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Read records `first..=last` in one exchange.
    pub async fn read_records(&mut self, first: u16, last: u16) -> Result<Vec<RawRecord>> {
        if last < first {
            return Err(DriverError::SizeVerify(format!("empty record range {first}..={last}")));
        }
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u16(first);
        payload.put_u16(last);
        let packet = self.exchange(Command::GlucoseResult, &payload).await?;

        let expected = (last - first) as usize + 1;
        if packet.payload.len() != expected * RECORD_SIZE {
            return Err(DriverError::SizeVerify(format!(
                "asked for {expected} records, got {} bytes",
                packet.payload.len()
            )));
        }
        decode_page(&packet.payload, first as usize)
    }
}
