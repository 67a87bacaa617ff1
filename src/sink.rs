use crate::record::LogRecord;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Append-only destination for finished records.
pub trait RecordSink: Send {
    fn append(&mut self, record: &LogRecord) -> Result<()>;
}

/// Comma-separated text file, one record per line, CRLF terminated. The
/// header is written only when the file is first created, so restarts keep
/// appending to the same log instead of salting it with headers.
pub struct CsvSink {
    path: PathBuf,
    header: String,
}

impl CsvSink {
    pub fn new(path: PathBuf, field_names: &[String]) -> Self {
        Self {
            header: LogRecord::csv_header(field_names),
            path,
        }
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &LogRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        if file.metadata()?.len() == 0 {
            file.write_all(self.header.as_bytes())?;
        }
        file.write_all(record.to_csv_line().as_bytes())?;
        file.sync_data().ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Reading;
    use crate::record::FieldValue;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(second: u32, value: f64) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, second).unwrap(),
            fields: vec![(
                "ec".to_string(),
                FieldValue::Reading(Reading {
                    value,
                    retained: 4,
                    window: (value, value),
                }),
            )],
        }
    }

    #[test]
    fn header_written_once_across_appends_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage").join("samplelog.csv");
        let names = vec!["ec".to_string()];

        let mut sink = CsvSink::new(path.clone(), &names);
        sink.append(&record(1, 10.0)).unwrap();
        sink.append(&record(2, 11.0)).unwrap();

        // a fresh sink over the same file models a process restart
        let mut sink = CsvSink::new(path.clone(), &names);
        sink.append(&record(3, 12.0)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let headers = contents.matches("timestamp,ec").count();
        assert_eq!(headers, 1);
        assert_eq!(contents.matches("\r\n").count(), 4);
        assert!(contents.starts_with("timestamp,ec\r\n"));
        assert!(contents.ends_with("12.0000\r\n"));
    }

    #[test]
    fn append_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("log.csv");
        let mut sink = CsvSink::new(path.clone(), &["ec".to_string()]);
        sink.append(&record(1, 5.0)).unwrap();
        assert!(path.exists());
    }
}
