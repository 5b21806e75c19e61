//! Attendance ledger: at most one mark per identity per attendance window.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid attendance window: {0}")]
    InvalidWindow(String),
    #[error("ledger storage: {0}")]
    Storage(String),
}

/// Key identifying one attendance window, e.g. `2026-10-19` or `2026-10-19/p1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowKey(pub String);

impl WindowKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How timestamps are bucketed into attendance windows.
///
/// Days are taken at a fixed UTC offset; `period_hours` splits each day
/// into equal windows (24 = one window per calendar day).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceWindow {
    offset: FixedOffset,
    period_hours: u32,
}

impl AttendanceWindow {
    pub fn new(offset: FixedOffset, period_hours: u32) -> Result<Self, LedgerError> {
        if period_hours == 0 || period_hours > 24 || 24 % period_hours != 0 {
            return Err(LedgerError::InvalidWindow(format!(
                "period_hours must divide 24, got {period_hours}"
            )));
        }
        Ok(Self {
            offset,
            period_hours,
        })
    }

    /// One window per calendar day at `offset`.
    pub fn daily(offset: FixedOffset) -> Self {
        Self {
            offset,
            period_hours: 24,
        }
    }

    /// One window per calendar day at the host's current UTC offset.
    pub fn local_daily() -> Self {
        Self::daily(Local::now().offset().fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn period_hours(&self) -> u32 {
        self.period_hours
    }

    /// Calendar date of `at` in this window's offset.
    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn key(&self, at: DateTime<Utc>) -> WindowKey {
        let local = at.with_timezone(&self.offset);
        let date = local.date_naive().format("%Y-%m-%d");
        if self.period_hours == 24 {
            WindowKey(date.to_string())
        } else {
            WindowKey(format!("{date}/p{}", local.hour() / self.period_hours))
        }
    }
}

impl Default for AttendanceWindow {
    fn default() -> Self {
        Self::local_daily()
    }
}

/// One marked attendance. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub display_name: String,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    /// Match similarity that produced the mark.
    pub confidence: f32,
    /// Calendar date of the window.
    pub date: NaiveDate,
    pub window: WindowKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkOutcome {
    Marked,
    AlreadyPresent,
}

/// Storage seam for attendance records.
///
/// `insert_if_absent` must be atomic per `(identity_id, window)`: of any
/// number of concurrent calls for the same pair, exactly one returns `true`.
pub trait LedgerBackend: Send + Sync {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, LedgerError>;
    /// Records whose window falls on `date`, in any order.
    fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError>;
}

/// Mutex-guarded in-memory backend.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<(String, WindowKey), AttendanceRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerBackend for MemoryLedger {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<bool, LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (record.identity_id.clone(), record.window.clone());
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record.clone());
        Ok(true)
    }

    fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().filter(|r| r.date == date).cloned().collect())
    }
}

/// Per-day attendance report.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceSummary {
    pub date: NaiveDate,
    /// Distinct identities with at least one mark on `date`.
    pub total_present: usize,
    pub records: Vec<AttendanceRecord>,
}

pub struct AttendanceLedger {
    backend: Arc<dyn LedgerBackend>,
    window: AttendanceWindow,
}

impl AttendanceLedger {
    pub fn new(backend: Arc<dyn LedgerBackend>, window: AttendanceWindow) -> Self {
        Self { backend, window }
    }

    /// In-memory ledger with daily windows at the local offset.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedger::new()), AttendanceWindow::local_daily())
    }

    pub fn window(&self) -> &AttendanceWindow {
        &self.window
    }

    /// Mark `identity_id` present unless it already is for the window of `at`.
    pub fn record_if_new(
        &self,
        identity_id: &str,
        display_name: &str,
        camera_id: &str,
        confidence: f32,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, LedgerError> {
        let record = AttendanceRecord {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            timestamp: at,
            camera_id: camera_id.to_string(),
            confidence,
            date: self.window.date_of(at),
            window: self.window.key(at),
        };

        if self.backend.insert_if_absent(&record)? {
            tracing::info!(
                identity_id,
                camera_id,
                confidence,
                window = %record.window,
                "attendance marked"
            );
            Ok(MarkOutcome::Marked)
        } else {
            tracing::debug!(identity_id, window = %record.window, "already present");
            Ok(MarkOutcome::AlreadyPresent)
        }
    }

    pub fn summary(&self, date: NaiveDate) -> Result<AttendanceSummary, LedgerError> {
        let mut records = self.backend.records_on(date)?;
        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });

        let mut present: Vec<&str> = records.iter().map(|r| r.identity_id.as_str()).collect();
        present.sort_unstable();
        present.dedup();
        let total_present = present.len();

        Ok(AttendanceSummary {
            date,
            total_present,
            records,
        })
    }

    /// Summary for the current date in the window's offset.
    pub fn today(&self) -> Result<AttendanceSummary, LedgerError> {
        self.summary(self.window.date_of(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn ledger(window: AttendanceWindow) -> AttendanceLedger {
        AttendanceLedger::new(Arc::new(MemoryLedger::new()), window)
    }

    fn utc_daily() -> AttendanceWindow {
        AttendanceWindow::daily(FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn test_first_mark_then_already_present() {
        let ledger = ledger(utc_daily());
        let t0 = utc("2026-10-19T08:00:00Z");
        assert_eq!(
            ledger.record_if_new("x", "X", "camera_0", 0.9, t0).unwrap(),
            MarkOutcome::Marked
        );
        for minutes in [1, 30, 600] {
            let t = t0 + Duration::minutes(minutes);
            assert_eq!(
                ledger.record_if_new("x", "X", "camera_1", 0.95, t).unwrap(),
                MarkOutcome::AlreadyPresent
            );
        }

        let summary = ledger.summary(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()).unwrap();
        assert_eq!(summary.total_present, 1);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].camera_id, "camera_0");
        assert!((summary.records[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_new_day_marks_again() {
        let ledger = ledger(utc_daily());
        ledger.record_if_new("x", "X", "cam", 0.9, utc("2026-10-19T23:59:00Z")).unwrap();
        assert_eq!(
            ledger.record_if_new("x", "X", "cam", 0.9, utc("2026-10-20T00:01:00Z")).unwrap(),
            MarkOutcome::Marked
        );
    }

    #[test]
    fn test_window_uses_configured_offset() {
        // 23:30 UTC is already the next day at UTC+2.
        let window = AttendanceWindow::daily(FixedOffset::east_opt(2 * 3600).unwrap());
        let at = utc("2026-10-19T23:30:00Z");
        assert_eq!(window.key(at).as_str(), "2026-10-20");
        assert_eq!(window.date_of(at), NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());
    }

    #[test]
    fn test_sub_day_windows() {
        let window = AttendanceWindow::new(FixedOffset::east_opt(0).unwrap(), 12).unwrap();
        assert_eq!(window.key(utc("2026-10-19T08:00:00Z")).as_str(), "2026-10-19/p0");
        assert_eq!(window.key(utc("2026-10-19T13:00:00Z")).as_str(), "2026-10-19/p1");

        let ledger = ledger(window);
        ledger.record_if_new("x", "X", "cam", 0.9, utc("2026-10-19T08:00:00Z")).unwrap();
        assert_eq!(
            ledger.record_if_new("x", "X", "cam", 0.9, utc("2026-10-19T13:00:00Z")).unwrap(),
            MarkOutcome::Marked
        );
        let summary = ledger.summary(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()).unwrap();
        assert_eq!(summary.records.len(), 2);
        assert_eq!(summary.total_present, 1);
    }

    #[test]
    fn test_invalid_period_rejected() {
        let offset = FixedOffset::east_opt(0).unwrap();
        assert!(AttendanceWindow::new(offset, 0).is_err());
        assert!(AttendanceWindow::new(offset, 5).is_err());
        assert!(AttendanceWindow::new(offset, 25).is_err());
        assert!(AttendanceWindow::new(offset, 8).is_ok());
    }

    #[test]
    fn test_concurrent_marks_write_once() {
        let ledger = Arc::new(ledger(utc_daily()));
        let at = utc("2026-10-19T09:00:00Z");
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    ledger
                        .record_if_new("x", "X", &format!("camera_{}", i % 2), 0.8, at)
                        .unwrap()
                })
            })
            .collect();

        let marked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == MarkOutcome::Marked)
            .count();
        assert_eq!(marked, 1);
        assert_eq!(ledger.summary(ledger.window().date_of(at)).unwrap().records.len(), 1);
    }

    #[test]
    fn test_summary_orders_by_time_and_filters_date() {
        let ledger = ledger(utc_daily());
        ledger.record_if_new("b", "B", "cam", 0.8, utc("2026-10-19T10:00:00Z")).unwrap();
        ledger.record_if_new("a", "A", "cam", 0.8, utc("2026-10-19T09:00:00Z")).unwrap();
        ledger.record_if_new("c", "C", "cam", 0.8, utc("2026-10-18T09:00:00Z")).unwrap();

        let summary = ledger.summary(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()).unwrap();
        let ids: Vec<&str> = summary.records.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(summary.total_present, 2);
    }

    #[test]
    fn test_record_serializes_mark_time_as_time() {
        let ledger = ledger(utc_daily());
        ledger.record_if_new("x", "X", "/dev/video0", 0.9, utc("2026-10-19T08:00:00Z")).unwrap();
        let summary = ledger.summary(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()).unwrap();

        let v = serde_json::to_value(&summary.records[0]).unwrap();
        assert_eq!(v["time"], "2026-10-19T08:00:00Z");
        assert!(v.get("timestamp").is_none());
        assert_eq!(v["date"], "2026-10-19");

        let back: AttendanceRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, summary.records[0]);
    }
}
