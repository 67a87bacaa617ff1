use crate::aggregate::Reading;
use crate::channel::ChannelError;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;

/// Fixed out-of-range marker written for any field that failed to read.
pub const SENTINEL: f64 = -999.0;

#[derive(Debug, Clone)]
pub enum FieldValue {
    Reading(Reading),
    Failed(ChannelError),
}

impl FieldValue {
    pub fn numeric(&self) -> f64 {
        match self {
            FieldValue::Reading(reading) => reading.value,
            FieldValue::Failed(_) => SENTINEL,
        }
    }
}

/// One finished cycle: a timestamp plus per-channel values in declared
/// order. Appended once and never mutated.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub fields: Vec<(String, FieldValue)>,
}

impl LogRecord {
    pub fn csv_header(names: &[String]) -> String {
        let mut line = String::from("timestamp");
        for name in names {
            line.push(',');
            line.push_str(name);
        }
        line.push_str("\r\n");
        line
    }

    pub fn to_csv_line(&self) -> String {
        let mut line = self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        for (_, field) in &self.fields {
            match field {
                FieldValue::Reading(reading) => {
                    let _ = write!(line, ",{:.4}", reading.value);
                }
                FieldValue::Failed(_) => line.push_str(",-999"),
            }
        }
        line.push_str("\r\n");
        line
    }
}
