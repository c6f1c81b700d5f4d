//! Append-only attendance log.
//!
//! One CSV row per mark, no header: `date,time,name,roll`. Rows are never
//! rewritten; readers de-duplicate.

use crate::types::IdentityLabel;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance ledger write failed: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub name: String,
    pub roll: String,
}

impl AttendanceRecord {
    pub fn label(&self) -> IdentityLabel {
        IdentityLabel::new(self.name.clone(), self.roll.clone())
    }
}

pub struct AttendanceLedger {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AttendanceLedger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a row stamped with the current local date and time.
    ///
    /// The label is not checked against the template store.
    pub fn mark(&self, label: &IdentityLabel) -> Result<AttendanceRecord, LedgerError> {
        self.mark_at(label, Local::now().naive_local())
    }

    pub fn mark_at(
        &self,
        label: &IdentityLabel,
        at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let record = AttendanceRecord {
            date: at.date(),
            time: at.time().with_nanosecond(0).unwrap_or_else(|| at.time()),
            name: label.name.clone(),
            roll: label.roll.clone(),
        };

        let date = record.date.format(DATE_FORMAT).to_string();
        let time = record.time.format(TIME_FORMAT).to_string();

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record([
            date.as_str(),
            time.as_str(),
            record.name.as_str(),
            record.roll.as_str(),
        ])?;
        writer.flush()?;

        tracing::info!(name = %record.name, roll = %record.roll, %date, %time, "attendance marked");
        Ok(record)
    }

    /// Lazily scan the whole log for rows dated `date`.
    ///
    /// Each call starts a fresh scan. A missing log yields nothing.
    pub fn records_for_date(&self, date: NaiveDate) -> Result<DayRecords, LedgerError> {
        match File::open(&self.path) {
            Ok(file) => Ok(DayRecords::from_reader(file, date)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DayRecords::empty(date)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Iterator over one day's ledger rows.
///
/// Malformed rows are skipped. A read failure is yielded once as
/// `LedgerError::Io` and ends the scan.
pub struct DayRecords<R = File> {
    rows: Option<csv::StringRecordsIntoIter<R>>,
    date: NaiveDate,
}

impl<R: Read> DayRecords<R> {
    fn from_reader(reader: R, date: NaiveDate) -> Self {
        let rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_records();
        Self {
            rows: Some(rows),
            date,
        }
    }

    fn empty(date: NaiveDate) -> Self {
        Self { rows: None, date }
    }
}

impl<R: Read> Iterator for DayRecords<R> {
    type Item = Result<AttendanceRecord, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.rows.as_mut()?.next() {
                None => {
                    self.rows = None;
                    return None;
                }
                Some(Ok(row)) => row,
                Some(Err(e)) => match e.into_kind() {
                    csv::ErrorKind::Io(io) => {
                        self.rows = None;
                        return Some(Err(LedgerError::Io(io)));
                    }
                    kind => {
                        tracing::debug!(error = ?kind, "skipping unreadable ledger row");
                        continue;
                    }
                },
            };

            match parse_row(&row) {
                Some(record) if record.date == self.date => return Some(Ok(record)),
                Some(_) => continue,
                None => {
                    tracing::debug!(fields = row.len(), "skipping malformed ledger row");
                    continue;
                }
            }
        }
    }
}

fn parse_row(row: &csv::StringRecord) -> Option<AttendanceRecord> {
    if row.len() != 4 {
        return None;
    }
    Some(AttendanceRecord {
        date: NaiveDate::parse_from_str(row.get(0)?, DATE_FORMAT).ok()?,
        time: NaiveTime::parse_from_str(row.get(1)?, TIME_FORMAT).ok()?,
        name: row.get(2)?.to_string(),
        roll: row.get(3)?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Serves `data`, then fails every further read.
    struct BrokenAfter {
        data: Cursor<Vec<u8>>,
    }

    impl Read for BrokenAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(std::io::Error::other("disk went away")),
                n => Ok(n),
            }
        }
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn day(date: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_mark_writes_row_format() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        ledger
            .mark_at(&IdentityLabel::new("Asha", "7"), at("2024-03-05", "09:15:02"))
            .unwrap();

        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(raw, "2024-03-05,09:15:02,Asha,7\n");
    }

    #[test]
    fn test_double_mark_produces_two_rows() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        let label = IdentityLabel::new("Asha", "7");
        ledger.mark_at(&label, at("2024-03-05", "09:00:00")).unwrap();
        ledger.mark_at(&label, at("2024-03-05", "10:00:00")).unwrap();

        let rows: Vec<AttendanceRecord> = ledger.records_for_date(day("2024-03-05")).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.label() == label));
    }

    #[test]
    fn test_records_filtered_by_date() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        ledger.mark_at(&IdentityLabel::new("a", "1"), at("2024-03-04", "09:00:00")).unwrap();
        ledger.mark_at(&IdentityLabel::new("b", "2"), at("2024-03-05", "09:00:00")).unwrap();

        let names: Vec<_> = ledger
            .records_for_date(day("2024-03-05"))
            .unwrap()
            .map(|r| r.unwrap().name)
            .collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("nested/attendance.csv")).unwrap();
        assert_eq!(ledger.records_for_date(day("2024-03-05")).unwrap().count(), 0);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attendance.csv");
        fs::write(
            &path,
            "2024-03-05,09:00:00,Asha,7\n\
             2024-03-05,09:00:00,short\n\
             2024-03-05,09:00:00,too,many,fields\n\
             not-a-date,09:00:00,x,1\n\
             2024-03-05,25:99:00,bad-time,1\n\
             2024-03-05,09:30:00,Ben,8\n",
        )
        .unwrap();
        let ledger = AttendanceLedger::open(&path).unwrap();

        let names: Vec<_> = ledger
            .records_for_date(day("2024-03-05"))
            .unwrap()
            .map(|r| r.unwrap().name)
            .collect();
        assert_eq!(names, vec!["Asha".to_string(), "Ben".to_string()]);
    }

    #[test]
    fn test_scan_is_restartable() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        ledger.mark_at(&IdentityLabel::new("a", "1"), at("2024-03-05", "09:00:00")).unwrap();

        let first: Vec<AttendanceRecord> = ledger.records_for_date(day("2024-03-05")).unwrap().collect::<Result<_, _>>().unwrap();
        ledger.mark_at(&IdentityLabel::new("b", "2"), at("2024-03-05", "09:05:00")).unwrap();
        let second: Vec<AttendanceRecord> = ledger.records_for_date(day("2024-03-05")).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_fields_with_delimiters_round_trip() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        let label = IdentityLabel::new("Doe, Jane \"JD\"", "7");
        ledger.mark_at(&label, at("2024-03-05", "09:00:00")).unwrap();

        let rows: Vec<AttendanceRecord> = ledger.records_for_date(day("2024-03-05")).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows[0].label(), label);
    }

    #[test]
    fn test_concurrent_marks_keep_rows_intact() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .mark_at(&IdentityLabel::new(format!("s{i}"), i.to_string()), at("2024-03-05", "09:00:00"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.records_for_date(day("2024-03-05")).unwrap().count(), 16);
    }

    #[test]
    fn test_mark_uses_today() {
        let dir = TempDir::new().unwrap();
        let ledger = AttendanceLedger::open(dir.path().join("attendance.csv")).unwrap();
        let record = ledger.mark(&IdentityLabel::new("a", "1")).unwrap();
        assert_eq!(record.time.nanosecond(), 0);
        assert!(record.date >= Local::now().date_naive().pred_opt().unwrap());
    }

    #[test]
    fn test_read_failure_surfaces_as_io_error() {
        let reader = BrokenAfter {
            data: Cursor::new(b"2024-03-05,09:00:00,Asha,7\n2024-03-05,09:05:00,Ben,8\n2024-03-05,09:1".to_vec()),
        };
        let mut records = DayRecords::from_reader(reader, day("2024-03-05"));

        assert_eq!(records.next().unwrap().unwrap().name, "Asha");
        assert_eq!(records.next().unwrap().unwrap().name, "Ben");
        assert!(matches!(records.next(), Some(Err(LedgerError::Io(_)))));
        assert!(records.next().is_none());
    }

    #[test]
    fn test_read_failure_fails_collect() {
        let reader = BrokenAfter {
            data: Cursor::new(b"2024-03-05,09:00:00,Asha,7\n".to_vec()),
        };
        let collected: Result<Vec<_>, _> = DayRecords::from_reader(reader, day("2024-03-05")).collect();
        assert!(matches!(collected, Err(LedgerError::Io(_))));
    }
}
