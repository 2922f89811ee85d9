use std::array::TryFromSliceError;
use std::io;
use strum_macros::Display;
use thiserror::Error;

use crate::session::Stage;

/// Error tokens a meter can return in place of a regular response opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceErrorCode {
    #[strum(serialize = "ETMO")]
    Timeout,
    #[strum(serialize = "EHDR")]
    HeaderVerify,
    #[strum(serialize = "ESIZ")]
    SizeVerify,
    #[strum(serialize = "ECRC")]
    ChecksumVerify,
    #[strum(serialize = "ECMD")]
    CommandVerify,
}

impl DeviceErrorCode {
    /// Look up a 4-byte response opcode. Returns `None` for regular opcodes.
    pub fn from_token(token: &[u8; 4]) -> Option<Self> {
        match token {
            b"ETMO" => Some(Self::Timeout),
            b"EHDR" => Some(Self::HeaderVerify),
            b"ESIZ" => Some(Self::SizeVerify),
            b"ECRC" => Some(Self::ChecksumVerify),
            b"ECMD" => Some(Self::CommandVerify),
            _ => None,
        }
    }

    pub fn token(&self) -> [u8; 4] {
        match self {
            Self::Timeout => *b"ETMO",
            Self::HeaderVerify => *b"EHDR",
            Self::SizeVerify => *b"ESIZ",
            Self::ChecksumVerify => *b"ECRC",
            Self::CommandVerify => *b"ECMD",
        }
    }

    /// Human-readable category reported for this token.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HeaderVerify => "header-verify-failed",
            Self::SizeVerify => "size-verify-failed",
            Self::ChecksumVerify => "checksum-verify-failed",
            Self::CommandVerify => "command-verify-failed",
        }
    }
}

impl From<DeviceErrorCode> for DriverError {
    fn from(code: DeviceErrorCode) -> Self {
        let reason = format!("reported by device ({code})");
        match code {
            DeviceErrorCode::Timeout => DriverError::Timeout(reason),
            DeviceErrorCode::HeaderVerify => DriverError::HeaderVerify(reason),
            DeviceErrorCode::SizeVerify => DriverError::SizeVerify(reason),
            DeviceErrorCode::ChecksumVerify => DriverError::ChecksumVerify(reason),
            DeviceErrorCode::CommandVerify => DriverError::CommandVerify(reason),
        }
    }
}

/// The primary error type for the `caresens-lib` library.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("header verify failed: {0}")]
    HeaderVerify(String),

    #[error("size verify failed: {0}")]
    SizeVerify(String),

    #[error("checksum verify failed: {0}")]
    ChecksumVerify(String),

    #[error("command verify failed: {0}")]
    CommandVerify(String),

    #[error("device not responding after {attempts} handshake attempts")]
    DeviceNotResponding { attempts: u32 },

    #[error("device clock write mismatch: wrote {written}, device echoed {echoed}")]
    ClockWriteMismatch { written: String, echoed: String },

    #[error("no records to upload")]
    NoRecordsToUpload,

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("invalid record at index {index}: {message}")]
    InvalidRecord { index: usize, message: String },

    #[error("device time cannot be reconciled: {0}")]
    TimeSource(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TryFromSliceError> for DriverError {
    fn from(_: TryFromSliceError) -> Self {
        DriverError::SizeVerify("failed to convert slice to array".to_string())
    }
}

impl DriverError {
    /// Category string for protocol-level failures, matching the device error table.
    pub fn category(&self) -> &'static str {
        match self {
            DriverError::Timeout(_) => DeviceErrorCode::Timeout.category(),
            DriverError::HeaderVerify(_) => DeviceErrorCode::HeaderVerify.category(),
            DriverError::SizeVerify(_) => DeviceErrorCode::SizeVerify.category(),
            DriverError::ChecksumVerify(_) => DeviceErrorCode::ChecksumVerify.category(),
            DriverError::CommandVerify(_) => DeviceErrorCode::CommandVerify.category(),
            DriverError::DeviceNotResponding { .. } => "device-not-responding",
            DriverError::ClockWriteMismatch { .. } => "clock-write-mismatch",
            DriverError::NoRecordsToUpload => "no-records-to-upload",
            DriverError::UnexpectedResponse { .. } | DriverError::InvalidRecord { .. } => "protocol",
            DriverError::TimeSource(_) => "time-source",
            DriverError::Upload(_) => "upload",
            DriverError::Transport(_) | DriverError::NotConnected | DriverError::Io(_) => "transport",
            DriverError::Config(_) | DriverError::Json(_) => "config",
        }
    }
}

/// A failure of the session pipeline, tagged with the first stage that failed.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: DriverError,
}

pub type Result<T> = std::result::Result<T, DriverError>;
