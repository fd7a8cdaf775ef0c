//! Immutable per-update records and their CSV encoding.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::{AlarmStatus, PvValue, Severity};

/// Column names, in output order.
pub const COLUMNS: [&str; 14] = [
    "sequence_number",
    "pv_name",
    "pv_value",
    "pv_type",
    "epics_timestamp",
    "epics_datetime",
    "local_datetime",
    "clock_skew_seconds",
    "clock_offset_applied",
    "previous_value",
    "value_changed",
    "connection_status",
    "severity",
    "alarm_status",
];

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// One logged observation of an update. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub sequence_number: u64,
    pub channel: String,
    pub value: PvValue,
    /// Raw source timestamp as delivered, seconds since the epoch.
    pub source_timestamp: f64,
    /// Source timestamp with the clock offset applied.
    pub source_datetime: DateTime<Utc>,
    pub local_datetime: DateTime<Utc>,
    pub clock_skew_seconds: f64,
    pub clock_offset: f64,
    pub previous_value: Option<PvValue>,
    pub value_changed: bool,
    pub connected: bool,
    pub severity: Severity,
    pub alarm_status: AlarmStatus,
}

/// Everything needed to build a [`Record`] except its sequence number,
/// which is only assigned at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub channel: String,
    pub value: PvValue,
    pub source_timestamp: f64,
    pub source_datetime: DateTime<Utc>,
    pub local_datetime: DateTime<Utc>,
    pub clock_skew_seconds: f64,
    pub clock_offset: f64,
    pub previous_value: Option<PvValue>,
    pub value_changed: bool,
    pub connected: bool,
    pub severity: Severity,
    pub alarm_status: AlarmStatus,
}

impl Observation {
    pub fn into_record(self, sequence_number: u64) -> Record {
        Record {
            sequence_number,
            channel: self.channel,
            value: self.value,
            source_timestamp: self.source_timestamp,
            source_datetime: self.source_datetime,
            local_datetime: self.local_datetime,
            clock_skew_seconds: self.clock_skew_seconds,
            clock_offset: self.clock_offset,
            previous_value: self.previous_value,
            value_changed: self.value_changed,
            connected: self.connected,
            severity: self.severity,
            alarm_status: self.alarm_status,
        }
    }
}

/// Render an instant the way every timestamp column is written.
pub fn format_datetime(t: &DateTime<Utc>) -> String {
    t.format(DATETIME_FORMAT).to_string()
}

/// The header line, without a trailing newline.
pub fn header_line() -> String {
    COLUMNS.join(",")
}

impl Record {
    /// Column values in [`COLUMNS`] order, unescaped.
    pub fn fields(&self) -> [String; 14] {
        [
            self.sequence_number.to_string(),
            self.channel.clone(),
            self.value.to_string(),
            self.value.type_tag().to_string(),
            format!("{:.6}", self.source_timestamp),
            format_datetime(&self.source_datetime),
            format_datetime(&self.local_datetime),
            format!("{:.6}", self.clock_skew_seconds),
            self.clock_offset.to_string(),
            self.previous_value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            self.value_changed.to_string(),
            self.connected.to_string(),
            self.severity.as_str().to_string(),
            self.alarm_status.as_str().to_string(),
        ]
    }

    /// The record as one CSV line, without a trailing newline.
    pub fn csv_line(&self) -> String {
        let fields = self.fields();
        let escaped: Vec<String> = fields.iter().map(|f| escape_field(f)).collect();
        escaped.join(",")
    }
}

/// Quote a field if it contains a delimiter, quote or line break.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
