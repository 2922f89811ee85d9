//! Hand-off of normalized readings to whatever stores them.

use crate::error::Result;
use crate::records::NormalizedRecord;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Annotation added to the session when the meter clock had to be rewritten.
pub const WRONG_DEVICE_TIME: &str = "wrong-device-time";

/// Everything about the meter the upload needs besides the readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub device_id: String,
    pub serial_number: String,
    pub model: String,
    pub manufacturers: Vec<String>,
    pub device_time: Option<NaiveDateTime>,
    pub timezone_offset: i32,
    /// Set when the meter clock was rewritten during this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_offset_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub accepted: usize,
    /// Identifier the endpoint assigned to this upload, if any
    pub reference: Option<String>,
}

#[async_trait]
pub trait Uploader: Send {
    /// Store `records`; resolves once the endpoint has finished.
    async fn submit(
        &mut self,
        records: &[NormalizedRecord],
        metadata: &SessionMetadata,
        progress: &(dyn Fn(u8) + Send + Sync),
        group_id: Option<&str>,
    ) -> Result<UploadReceipt>;
}
