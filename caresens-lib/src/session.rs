//! The fixed session pipeline every meter of the family goes through.
//!
//! ```text
//! Detect -> Setup -> Connect -> ReadConfig -> Fetch -> Process -> Upload -> Disconnect -> Cleanup
//! ```
//!
//! Forward stages run in order and stop at the first failure. Disconnect and
//! Cleanup are teardown: they run exactly once after the forward stages,
//! whether those succeeded or not.

use crate::config::DriverConfig;
use crate::constants::RECORDS_PER_PAGE;
use crate::engine::CommandEngine;
use crate::error::{DriverError, PipelineError, Result};
use crate::records::{NormalizedRecord, RawRecord, map_records};
use crate::time::{FixedOffsetAnnotator, SystemTimeSource, TimeAnnotator, TimeCheck, TimeSource};
use crate::transport::{HidTransport, METER_UART, UartConfig};
use crate::upload::{SessionMetadata, UploadReceipt, Uploader, WRONG_DEVICE_TIME};
use chrono::NaiveDateTime;
use serde::Serialize;
use strum_macros::Display;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum Stage {
    Detect,
    Setup,
    Connect,
    ReadConfig,
    Fetch,
    Process,
    Upload,
    Disconnect,
    Cleanup,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Detect => Some(Stage::Setup),
            Stage::Setup => Some(Stage::Connect),
            Stage::Connect => Some(Stage::ReadConfig),
            Stage::ReadConfig => Some(Stage::Fetch),
            Stage::Fetch => Some(Stage::Process),
            Stage::Process => Some(Stage::Upload),
            Stage::Upload => Some(Stage::Disconnect),
            Stage::Disconnect => Some(Stage::Cleanup),
            Stage::Cleanup => None,
        }
    }

    /// Disconnect and Cleanup run regardless of how the forward stages went.
    pub fn is_teardown(self) -> bool {
        matches!(self, Stage::Disconnect | Stage::Cleanup)
    }
}

/// State collected while walking the pipeline. Owned by the [`Driver`].
#[derive(Debug, Default)]
pub struct DeviceSession {
    pub serial_number: Option<String>,
    pub device_id: Option<String>,
    pub model: String,
    pub driver_tag: String,
    pub manufacturers: Vec<String>,
    pub device_time: Option<NaiveDateTime>,
    /// Corrected minus original device time, when the clock was rewritten
    pub clock_offset_ms: Option<i64>,
    pub annotations: Vec<String>,
    pub record_count: u16,
    pub raw_records: Vec<RawRecord>,
    pub records: Vec<NormalizedRecord>,
    pub dropped_control: usize,
    pub receipt: Option<UploadReceipt>,
    /// Stages that completed successfully, in order
    pub completed: Vec<Stage>,
    pub connected: bool,
    pub cleaned_up: bool,
}

impl DeviceSession {
    fn new(config: &DriverConfig) -> Self {
        Self {
            model: config.model.clone(),
            driver_tag: config.driver_tag.clone(),
            manufacturers: config.manufacturers.clone(),
            ..Self::default()
        }
    }

    pub fn metadata(&self, timezone_offset: i32) -> SessionMetadata {
        SessionMetadata {
            device_id: self.device_id.clone().unwrap_or_default(),
            serial_number: self.serial_number.clone().unwrap_or_default(),
            model: self.model.clone(),
            manufacturers: self.manufacturers.clone(),
            device_time: self.device_time,
            timezone_offset,
            clock_offset_ms: self.clock_offset_ms,
            annotations: self.annotations.clone(),
        }
    }

    /// Forget anything fetched so a failed session never uploads partial data.
    fn discard_data(&mut self) {
        self.raw_records.clear();
        self.records.clear();
    }
}

/// Summary of a successful session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub device_id: String,
    pub fetched: u16,
    pub uploaded: usize,
    pub dropped_control: usize,
    pub clock_corrected: bool,
    pub receipt: Option<UploadReceipt>,
    pub stages: Vec<Stage>,
}

type ProgressFn = Box<dyn Fn(Stage, u8) + Send + Sync>;

/// Runs one meter through the session pipeline.
pub struct Driver<T: HidTransport> {
    engine: CommandEngine<T>,
    config: DriverConfig,
    uart: UartConfig,
    time_source: Box<dyn TimeSource>,
    annotator: Box<dyn TimeAnnotator>,
    uploader: Box<dyn Uploader>,
    progress: ProgressFn,
    span: Span,
    session: DeviceSession,
}

impl<T: HidTransport> Driver<T> {
    /// Driver with the host clock as time source and the configured fixed timezone.
    pub fn new(transport: T, config: DriverConfig, uploader: Box<dyn Uploader>) -> Result<Self> {
        config.validate()?;
        let offset = config.timezone_offset_minutes;
        let time_source = SystemTimeSource::new(offset)
            .ok_or_else(|| DriverError::Config(format!("invalid timezone offset {offset}")))?;
        let annotator = FixedOffsetAnnotator::new(offset)
            .ok_or_else(|| DriverError::Config(format!("invalid timezone offset {offset}")))?;

        Ok(Self {
            engine: CommandEngine::new(transport).with_read_timeout(config.read_timeout()),
            session: DeviceSession::new(&config),
            span: info_span!("caresens", driver = %config.driver_tag),
            config,
            uart: METER_UART,
            time_source: Box::new(time_source),
            annotator: Box::new(annotator),
            uploader,
            progress: Box::new(|_, _| {}),
        })
    }

    pub fn with_time_source(mut self, time_source: Box<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_annotator(mut self, annotator: Box<dyn TimeAnnotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_uart(mut self, uart: UartConfig) -> Self {
        self.uart = uart;
        self
    }

    /// All log output of the session is emitted inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(Stage, u8) + Send + Sync + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn engine(&self) -> &CommandEngine<T> {
        &self.engine
    }

    pub fn into_engine(self) -> CommandEngine<T> {
        self.engine
    }

    /// Walk the whole pipeline. The transport is released before this returns.
    pub async fn run(&mut self) -> std::result::Result<SessionReport, PipelineError> {
        let span = self.span.clone();
        self.run_pipeline().instrument(span).await
    }

    async fn run_pipeline(&mut self) -> std::result::Result<SessionReport, PipelineError> {
        self.session = DeviceSession::new(&self.config);

        let mut stage = Stage::Detect;
        let outcome = loop {
            debug!("Entering {} stage", stage);
            if let Err(source) = self.step(stage).await {
                error!("{} stage failed: {}", stage, source);
                break Err(PipelineError { stage, source });
            }
            self.session.completed.push(stage);
            match stage.next() {
                Some(next) if !next.is_teardown() => stage = next,
                _ => break Ok(()),
            }
        };

        if outcome.is_err() {
            self.session.discard_data();
        }
        let teardown = self.teardown().await;
        outcome?;
        teardown?;

        Ok(SessionReport {
            device_id: self.session.device_id.clone().unwrap_or_default(),
            fetched: self.session.record_count,
            uploaded: self.session.records.len(),
            dropped_control: self.session.dropped_control,
            clock_corrected: self.session.clock_offset_ms.is_some(),
            receipt: self.session.receipt.clone(),
            stages: self.session.completed.clone(),
        })
    }

    async fn step(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Detect => self.detect(),
            Stage::Setup => self.setup(),
            Stage::Connect => self.connect().await,
            Stage::ReadConfig => self.read_config().await,
            Stage::Fetch => self.fetch().await,
            Stage::Process => self.process(),
            Stage::Upload => self.upload().await,
            Stage::Disconnect => self.disconnect().await,
            Stage::Cleanup => {
                self.cleanup();
                Ok(())
            }
        }
    }

    fn detect(&mut self) -> Result<()> {
        // the bridge enumerates as plain HID, nothing to negotiate
        Ok(())
    }

    fn setup(&mut self) -> Result<()> {
        (self.progress)(Stage::Setup, 100);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        info!(
            "Opening {:04x}:{:04x}",
            self.config.device.vendor_id, self.config.device.product_id
        );
        // a failed open may still have claimed something; teardown releases it
        self.session.connected = true;
        self.engine.transport_mut().connect(&self.config.device).await?;
        self.engine.init_bridge(&self.uart).await?;
        self.engine.ping().await?;
        info!("Meter is awake");
        Ok(())
    }

    async fn read_config(&mut self) -> Result<()> {
        let serial = self.engine.read_serial_number().await?;
        let device_id = self.config.device_id(&serial);
        info!("Device id {}", device_id);
        self.session.serial_number = Some(serial);
        self.session.device_id = Some(device_id);

        let device_time = self.engine.read_device_time().await?;
        self.session.device_time = Some(device_time);
        debug!("Device clock reads {}", device_time);

        match self.time_source.check_device_time(device_time, &self.config.time_policy) {
            TimeCheck::InSync => {}
            TimeCheck::NeedsUpdate(trusted) => {
                warn!("Device clock {} is off, setting it to {}", device_time, trusted);
                self.engine.write_device_time(trusted).await?;
                let offset = trusted - device_time;
                self.annotator.set_conversion_offset(offset);
                self.session.clock_offset_ms = Some(offset.num_milliseconds());
                self.session.annotations.push(WRONG_DEVICE_TIME.to_string());
            }
            TimeCheck::Unresolvable(reason) => return Err(DriverError::TimeSource(reason)),
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<()> {
        let count = self.engine.read_record_count().await?;
        self.session.record_count = count;
        info!("Device holds {} records", count);

        let mut records = Vec::with_capacity(count as usize);
        let mut first = 0u16;
        while first < count {
            let last = first.saturating_add(RECORDS_PER_PAGE - 1).min(count - 1);
            let page = self.engine.read_records(first, last).await?;
            debug!("Fetched records {}..={}", first, last);
            records.extend(page);
            first = last + 1;
        }
        self.session.raw_records = records;
        Ok(())
    }

    fn process(&mut self) -> Result<()> {
        let raw = std::mem::take(&mut self.session.raw_records);
        let records = map_records(&raw, self.annotator.as_ref());
        self.session.dropped_control = raw.len() - records.len();
        if self.session.dropped_control > 0 {
            debug!("Dropped {} control solution tests", self.session.dropped_control);
        }
        if records.is_empty() {
            return Err(DriverError::NoRecordsToUpload);
        }
        self.session.records = records;
        Ok(())
    }

    async fn upload(&mut self) -> Result<()> {
        let metadata = self.session.metadata(self.config.timezone_offset_minutes);
        let progress = &self.progress;
        let report_progress = move |pct: u8| progress(Stage::Upload, pct);
        let receipt = self
            .uploader
            .submit(
                &self.session.records,
                &metadata,
                &report_progress,
                self.config.group_id.as_deref(),
            )
            .await?;
        info!("Uploaded {} records", receipt.accepted);
        self.session.receipt = Some(receipt);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.session.connected {
            return Ok(());
        }
        self.session.connected = false;
        self.engine.transport_mut().disconnect().await?;
        debug!("Transport released");
        Ok(())
    }

    /// Drop what is left of the raw fetch. Safe to call any number of times.
    pub fn cleanup(&mut self) {
        if self.session.cleaned_up {
            return;
        }
        self.session.raw_records = Vec::new();
        self.session.cleaned_up = true;
        debug!("Session cleaned up");
    }

    async fn teardown(&mut self) -> std::result::Result<(), PipelineError> {
        let disconnect = self.step(Stage::Disconnect).await;
        if disconnect.is_ok() {
            self.session.completed.push(Stage::Disconnect);
        }
        self.cleanup();
        self.session.completed.push(Stage::Cleanup);
        disconnect.map_err(|source| PipelineError {
            stage: Stage::Disconnect,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stages = vec![Stage::Detect];
        while let Some(next) = stages.last().unwrap().next() {
            stages.push(next);
        }
        assert_eq!(
            stages,
            vec![
                Stage::Detect,
                Stage::Setup,
                Stage::Connect,
                Stage::ReadConfig,
                Stage::Fetch,
                Stage::Process,
                Stage::Upload,
                Stage::Disconnect,
                Stage::Cleanup,
            ]
        );
    }

    #[test]
    fn test_teardown_stages() {
        assert!(Stage::Disconnect.is_teardown());
        assert!(Stage::Cleanup.is_teardown());
        assert!(!Stage::Upload.is_teardown());
        assert_eq!(Stage::ReadConfig.to_string(), "ReadConfig");
    }
}
