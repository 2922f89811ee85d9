//! Stored readings: wire layout, flag decoding and mapping to clinical records.

use crate::constants::{RECORD_SIZE, YEAR_BASE};
use crate::error::{DriverError, Result};
use crate::time::{TimeAnnotator, UtcInfo};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Glucose readings above this are shown as "HI" by the meter (mg/dL).
pub const GLUCOSE_HIGH_THRESHOLD: f64 = 600.0;
pub const GLUCOSE_HIGH_VALUE: f64 = 601.0;
/// Glucose readings below this are shown as "LO" by the meter (mg/dL).
pub const GLUCOSE_LOW_THRESHOLD: f64 = 20.0;
pub const GLUCOSE_LOW_VALUE: f64 = 19.0;

pub const KETONE_HIGH_THRESHOLD: f64 = 8.0;
pub const KETONE_HIGH_VALUE: f64 = 8.1;
pub const KETONE_LOW_THRESHOLD: f64 = 0.1;
pub const KETONE_LOW_VALUE: f64 = 0.0;

/// Ketone values are stored in tenths of mmol/L.
pub const KETONE_SCALE: f64 = 10.0;

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFlags {
    pub high: bool,
    pub low: bool,
    pub control_solution: bool,
    pub ketone: bool,
    #[skip]
    reserved: B4,
}

/// One record exactly as it sits in a GLUC response.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawRecordBytes {
    pub timestamp: [u8; 6],
    pub flags: u8,
    pub value: U16,
}

/// A decoded stored reading, before any clinical interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Position in device memory, used only for time reconciliation.
    pub index: usize,
    pub device_time: NaiveDateTime,
    pub flags: RecordFlags,
    pub value: u16,
}

/// Parse the 6-byte `yy mm dd hh mi ss` timestamp used by records and the clock commands.
pub fn decode_timestamp(bytes: &[u8]) -> Option<NaiveDateTime> {
    let [yy, mo, dd, hh, mi, ss]: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
    NaiveDate::from_ymd_opt(YEAR_BASE + yy as i32, mo as u32, dd as u32)?.and_hms_opt(hh as u32, mi as u32, ss as u32)
}

pub fn encode_timestamp(time: &NaiveDateTime) -> [u8; 6] {
    [
        (time.year() - YEAR_BASE).clamp(0, 99) as u8,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    ]
}

impl RawRecord {
    pub fn from_bytes(index: usize, bytes: &[u8]) -> Result<Self> {
        let raw = RawRecordBytes::ref_from_bytes(bytes).map_err(|_| DriverError::InvalidRecord {
            index,
            message: format!("expected {RECORD_SIZE} bytes, got {}", bytes.len()),
        })?;
        let device_time = decode_timestamp(&raw.timestamp).ok_or_else(|| DriverError::InvalidRecord {
            index,
            message: format!("invalid timestamp {}", hex::encode(raw.timestamp)),
        })?;
        Ok(Self {
            index,
            device_time,
            flags: RecordFlags::from_bytes([raw.flags]),
            value: raw.value.get(),
        })
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let raw = RawRecordBytes {
            timestamp: encode_timestamp(&self.device_time),
            flags: self.flags.into_bytes()[0],
            value: U16::new(self.value),
        };
        let mut out = [0u8; RECORD_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }
}

/// Split a GLUC response into records; `first_index` is the index of the first one.
pub fn decode_page(data: &[u8], first_index: usize) -> Result<Vec<RawRecord>> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(DriverError::SizeVerify(format!(
            "record page of {} bytes is not a multiple of {RECORD_SIZE}",
            data.len()
        )));
    }
    data.chunks_exact(RECORD_SIZE)
        .enumerate()
        .map(|(i, chunk)| RawRecord::from_bytes(first_index + i, chunk))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "smbg")]
    #[strum(to_string = "smbg")]
    Glucose,
    #[serde(rename = "bloodKetone")]
    #[strum(to_string = "bloodKetone")]
    Ketone,
}

impl RecordKind {
    pub fn units(&self) -> &'static str {
        match self {
            RecordKind::Glucose => "mg/dL",
            RecordKind::Ketone => "mmol/L",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum Annotation {
    /// Value was clamped; `threshold` is the meter's display limit.
    #[serde(rename = "bg/out-of-range")]
    OutOfRange { value: OutOfRange, threshold: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRange {
    High,
    Low,
}

/// A reading ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub value: f64,
    pub units: String,
    pub device_time: NaiveDateTime,
    #[serde(flatten)]
    pub utc: UtcInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl NormalizedRecord {
    pub fn is_out_of_range(&self, which: OutOfRange) -> bool {
        self.annotations
            .iter()
            .any(|Annotation::OutOfRange { value, .. }| *value == which)
    }
}

/// Interpret one raw record. Returns `None` for control-solution tests.
pub fn map_record(raw: &RawRecord, annotator: &dyn TimeAnnotator) -> Option<NormalizedRecord> {
    if raw.flags.control_solution() {
        return None;
    }

    let kind = if raw.flags.ketone() {
        RecordKind::Ketone
    } else {
        RecordKind::Glucose
    };
    let (high_value, high_threshold, low_value, low_threshold) = match kind {
        RecordKind::Glucose => (
            GLUCOSE_HIGH_VALUE,
            GLUCOSE_HIGH_THRESHOLD,
            GLUCOSE_LOW_VALUE,
            GLUCOSE_LOW_THRESHOLD,
        ),
        RecordKind::Ketone => (
            KETONE_HIGH_VALUE,
            KETONE_HIGH_THRESHOLD,
            KETONE_LOW_VALUE,
            KETONE_LOW_THRESHOLD,
        ),
    };

    // HIGH wins over LOW when a record carries both
    let (value, annotations) = if raw.flags.high() {
        (
            high_value,
            vec![Annotation::OutOfRange {
                value: OutOfRange::High,
                threshold: high_threshold,
            }],
        )
    } else if raw.flags.low() {
        (
            low_value,
            vec![Annotation::OutOfRange {
                value: OutOfRange::Low,
                threshold: low_threshold,
            }],
        )
    } else {
        let value = match kind {
            RecordKind::Glucose => raw.value as f64,
            RecordKind::Ketone => raw.value as f64 / KETONE_SCALE,
        };
        (value, Vec::new())
    };

    Some(NormalizedRecord {
        kind,
        value,
        units: kind.units().to_string(),
        device_time: raw.device_time,
        utc: annotator.annotate(raw.device_time, raw.index),
        annotations,
    })
}

/// Map every raw record, dropping control-solution tests.
pub fn map_records(raw: &[RawRecord], annotator: &dyn TimeAnnotator) -> Vec<NormalizedRecord> {
    raw.iter().filter_map(|r| map_record(r, annotator)).collect()
}
