pub mod config;
pub mod constants;
pub mod crc;
pub mod engine;
pub mod error;
pub mod packet;
pub mod reassembly;
pub mod records;
pub mod session;
pub mod time;
pub mod transport;
pub mod upload;

pub use config::DriverConfig;
pub use engine::CommandEngine;
pub use error::{DeviceErrorCode, DriverError, PipelineError};
pub use packet::{Command, Packet};
pub use records::{NormalizedRecord, RawRecord, RecordKind};
pub use session::{DeviceSession, Driver, SessionReport, Stage};
pub use time::{FixedOffsetAnnotator, SystemTimeSource, TimeAnnotator, TimeCheck, TimePolicy, TimeSource};
pub use transport::{DeviceDescriptor, HidTransport, UartConfig};
pub use upload::{SessionMetadata, UploadReceipt, Uploader};
