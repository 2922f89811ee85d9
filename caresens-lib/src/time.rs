//! Device clock policy and UTC annotation of readings.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How far the meter clock may drift before it is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimePolicy {
    pub tolerance_minutes: i64,
    /// When false, a drifting clock fails the session instead of being corrected.
    pub auto_correct: bool,
}

impl Default for TimePolicy {
    fn default() -> Self {
        Self {
            tolerance_minutes: 15,
            auto_correct: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeCheck {
    InSync,
    /// Write this trusted local time to the meter.
    NeedsUpdate(NaiveDateTime),
    Unresolvable(String),
}

pub trait TimeSource: Send + Sync {
    fn check_device_time(&self, device_time: NaiveDateTime, policy: &TimePolicy) -> TimeCheck;
}

/// Compares against the host clock shifted into the meter's timezone.
#[derive(Debug, Clone)]
pub struct SystemTimeSource {
    offset: FixedOffset,
}

impl SystemTimeSource {
    pub fn new(offset_minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(offset_minutes * 60).map(|offset| Self { offset })
    }

    fn now_local(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }
}

/// Shared decision logic, split out so it can be tested with a fixed "now".
pub fn check_against(device_time: NaiveDateTime, trusted: NaiveDateTime, policy: &TimePolicy) -> TimeCheck {
    let drift = (device_time - trusted).num_minutes().abs();
    if drift <= policy.tolerance_minutes {
        TimeCheck::InSync
    } else if policy.auto_correct {
        TimeCheck::NeedsUpdate(trusted)
    } else {
        TimeCheck::Unresolvable(format!(
            "device clock is off by {drift} minutes and automatic correction is disabled"
        ))
    }
}

impl TimeSource for SystemTimeSource {
    fn check_device_time(&self, device_time: NaiveDateTime, policy: &TimePolicy) -> TimeCheck {
        check_against(device_time, self.now_local(), policy)
    }
}

/// UTC metadata attached to every uploaded reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtcInfo {
    pub time: DateTime<Utc>,
    /// Minutes east of UTC
    pub timezone_offset: i32,
    /// Milliseconds added to device time to correct clock drift
    pub conversion_offset: i64,
}

pub trait TimeAnnotator: Send + Sync {
    /// `index` is the reading's position in device memory.
    fn annotate(&self, device_time: NaiveDateTime, index: usize) -> UtcInfo;

    /// Called once the meter clock has been rewritten this session.
    /// `offset` is trusted time minus the old device time.
    fn set_conversion_offset(&mut self, offset: TimeDelta);
}

/// Treats every reading as taken in one fixed timezone.
#[derive(Debug, Clone)]
pub struct FixedOffsetAnnotator {
    offset: FixedOffset,
    conversion_offset: TimeDelta,
}

impl FixedOffsetAnnotator {
    pub fn new(offset_minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(offset_minutes * 60).map(|offset| Self {
            offset,
            conversion_offset: TimeDelta::zero(),
        })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
            conversion_offset: TimeDelta::zero(),
        }
    }

    pub fn with_conversion_offset(mut self, offset: TimeDelta) -> Self {
        self.conversion_offset = offset;
        self
    }
}

impl TimeAnnotator for FixedOffsetAnnotator {
    fn annotate(&self, device_time: NaiveDateTime, _index: usize) -> UtcInfo {
        let corrected = device_time + self.conversion_offset;
        let time = self
            .offset
            .from_local_datetime(&corrected)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| corrected.and_utc());
        UtcInfo {
            time,
            timezone_offset: self.offset.local_minus_utc() / 60,
            conversion_offset: self.conversion_offset.num_milliseconds(),
        }
    }

    fn set_conversion_offset(&mut self, offset: TimeDelta) {
        self.conversion_offset = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_within_tolerance() {
        assert_eq!(check_against(at(10, 0), at(10, 10), &TimePolicy::default()), TimeCheck::InSync);
    }

    #[test]
    fn test_needs_update() {
        assert_eq!(
            check_against(at(9, 0), at(10, 0), &TimePolicy::default()),
            TimeCheck::NeedsUpdate(at(10, 0))
        );
    }

    #[test]
    fn test_unresolvable_without_auto_correct() {
        let policy = TimePolicy {
            auto_correct: false,
            ..TimePolicy::default()
        };
        assert!(matches!(
            check_against(at(9, 0), at(10, 0), &policy),
            TimeCheck::Unresolvable(_)
        ));
    }

    #[test]
    fn test_fixed_offset_annotation() {
        let annotator = FixedOffsetAnnotator::new(120).unwrap();
        let info = annotator.annotate(at(10, 0), 0);
        assert_eq!(info.time.to_rfc3339(), "2024-03-15T08:00:00+00:00");
        assert_eq!(info.timezone_offset, 120);
        assert_eq!(info.conversion_offset, 0);
    }

    #[test]
    fn test_conversion_offset_applied() {
        let annotator = FixedOffsetAnnotator::utc().with_conversion_offset(TimeDelta::minutes(30));
        let info = annotator.annotate(at(10, 0), 3);
        assert_eq!(info.time.to_rfc3339(), "2024-03-15T10:30:00+00:00");
        assert_eq!(info.conversion_offset, 30 * 60 * 1000);
    }

    #[test]
    fn test_conversion_offset_set_through_trait() {
        let mut annotator: Box<dyn TimeAnnotator> = Box::new(FixedOffsetAnnotator::new(60).unwrap());
        annotator.set_conversion_offset(TimeDelta::hours(-2));
        let info = annotator.annotate(at(10, 0), 0);
        assert_eq!(info.time.to_rfc3339(), "2024-03-15T07:00:00+00:00");
        assert_eq!(info.timezone_offset, 60);
        assert_eq!(info.conversion_offset, -2 * 3600 * 1000);
    }
}
