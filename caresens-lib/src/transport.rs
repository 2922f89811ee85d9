//! Byte transport to the meter's UART-over-HID bridge.
//!
//! The protocol engine only ever talks to a [`HidTransport`]; the `caresens`
//! binary provides one backed by `nusb`, and tests use an in-memory meter.

use crate::constants::{BRIDGE_PID, BRIDGE_VID, REPORT_ID_UART_CONFIG, REPORT_ID_UART_ENABLE};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies which USB device to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Pick a specific unit when several bridges are attached
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            vendor_id: BRIDGE_VID,
            product_id: BRIDGE_PID,
            serial_number: None,
        }
    }
}

#[async_trait]
pub trait HidTransport: Send {
    /// Open the device. Must be called before any other method.
    async fn connect(&mut self, descriptor: &DeviceDescriptor) -> Result<()>;

    /// Write one output report (length prefix first). Returns bytes written.
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for one input report. An empty buffer means nothing arrived.
    async fn receive(&mut self, timeout: Duration) -> Result<Bytes>;

    /// Write a feature report; `data[0]` is the report id.
    async fn send_feature_report(&mut self, data: &[u8]) -> Result<()>;

    /// Release the device. Calling it on a closed transport is not an error.
    async fn disconnect(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: HidTransport + ?Sized> HidTransport for Box<T> {
    async fn connect(&mut self, descriptor: &DeviceDescriptor) -> Result<()> {
        (**self).connect(descriptor).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        (**self).receive(timeout).await
    }

    async fn send_feature_report(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_feature_report(data).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FlowControl {
    None = 0,
    Hardware = 1,
}

/// Data bits as encoded by the bridge (5 bits = 0 .. 8 bits = 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataBits {
    Five = 0,
    Six = 1,
    Seven = 2,
    Eight = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StopBits {
    One = 0,
    Two = 1,
}

/// Serial settings the bridge needs before the meter can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

/// 9600 8N1, no flow control.
pub const METER_UART: UartConfig = UartConfig {
    baud_rate: 9600,
    parity: Parity::None,
    flow_control: FlowControl::None,
    data_bits: DataBits::Eight,
    stop_bits: StopBits::One,
};

impl UartConfig {
    /// "Set UART Config" feature report.
    pub fn to_feature_report(&self) -> [u8; 9] {
        let baud = self.baud_rate.to_be_bytes();
        [
            REPORT_ID_UART_CONFIG,
            baud[0],
            baud[1],
            baud[2],
            baud[3],
            self.parity.into(),
            self.flow_control.into(),
            self.data_bits.into(),
            self.stop_bits.into(),
        ]
    }
}

/// "UART Enable" feature report.
pub fn uart_enable_report(enable: bool) -> [u8; 2] {
    [REPORT_ID_UART_ENABLE, enable as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_uart_report() {
        assert_eq!(
            METER_UART.to_feature_report(),
            [0x50, 0x00, 0x00, 0x25, 0x80, 0x00, 0x00, 0x03, 0x00]
        );
    }

    #[test]
    fn test_uart_enable_report() {
        assert_eq!(uart_enable_report(true), [0x41, 0x01]);
        assert_eq!(uart_enable_report(false), [0x41, 0x00]);
    }

    #[test]
    fn test_data_bits_round_trip() {
        assert_eq!(DataBits::try_from(3u8).unwrap(), DataBits::Eight);
        assert!(StopBits::try_from(7u8).is_err());
    }
}
