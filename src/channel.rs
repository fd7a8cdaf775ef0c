//! Channel identity, value payloads and per-channel state.
//!
//! Channels live in a flat [`ChannelTable`]: a vector of slots plus a
//! name index, built once when monitoring starts and never resized
//! afterwards. Each slot guards its own [`ChannelState`] so updates for
//! different channels never contend on a shared lock.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A named, independently subscribable value source.
///
/// The name is fully qualified: any configured prefix has already been
/// applied when the channel is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel {
    name: String,
}

impl Channel {
    /// Create a channel from an already fully-qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Create a channel by concatenating `prefix` and `name`.
    pub fn with_prefix(prefix: &str, name: &str) -> Self {
        Self {
            name: format!("{prefix}{name}"),
        }
    }

    /// The fully-qualified channel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Build channels from short names, applying `prefix` exactly once.
pub fn channels_from_names<S: AsRef<str>>(prefix: &str, names: &[S]) -> Vec<Channel> {
    names
        .iter()
        .map(|n| Channel::with_prefix(prefix, n.as_ref()))
        .collect()
}

/// An opaque value payload delivered by the transport.
///
/// The monitor only ever compares payloads for equality; it never does
/// arithmetic on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    Int(i64),
    Double(f64),
    Str(String),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
}

impl PvValue {
    /// Short tag describing the payload type.
    pub fn type_tag(&self) -> &'static str {
        match self {
            PvValue::Int(_) => "int",
            PvValue::Double(_) => "double",
            PvValue::Str(_) => "string",
            PvValue::IntArray(_) => "int_array",
            PvValue::DoubleArray(_) => "double_array",
        }
    }
}

fn same_double(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl PartialEq for PvValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PvValue::Int(a), PvValue::Int(b)) => a == b,
            (PvValue::Double(a), PvValue::Double(b)) => same_double(*a, *b),
            (PvValue::Str(a), PvValue::Str(b)) => a == b,
            (PvValue::IntArray(a), PvValue::IntArray(b)) => a == b,
            (PvValue::DoubleArray(a), PvValue::DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_double(*x, *y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Double(v) => write!(f, "{v:?}"),
            PvValue::Str(v) => f.write_str(v),
            PvValue::IntArray(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            PvValue::DoubleArray(values) => {
                let parts: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Double(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Str(v.to_string())
    }
}

/// Alarm severity reported alongside each update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    NoAlarm,
    Minor,
    Major,
    Invalid,
    #[default]
    Unknown,
}

impl Severity {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Severity::NoAlarm,
            1 => Severity::Minor,
            2 => Severity::Major,
            3 => Severity::Invalid,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
            Severity::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm status mnemonics, indexed by status code.
const ALARM_STATUS_NAMES: &[&str] = &[
    "NO_ALARM",
    "READ",
    "WRITE",
    "HIHI",
    "HIGH",
    "LOLO",
    "LOW",
    "STATE",
    "COS",
    "COMM",
    "TIMEOUT",
    "HWLIMIT",
    "CALC",
    "SCAN",
    "LINK",
    "SOFT",
    "BAD_SUB",
    "UDF",
    "DISABLE",
    "SIMM",
    "READ_ACCESS",
    "WRITE_ACCESS",
];

/// Alarm status reported alongside each update.
///
/// Wraps the numeric status code; codes outside the known table and the
/// pre-first-update default both render as `UNKNOWN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmStatus(Option<u16>);

impl AlarmStatus {
    pub fn from_code(code: u16) -> Self {
        AlarmStatus(Some(code))
    }

    pub fn code(&self) -> Option<u16> {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        self.0
            .and_then(|code| ALARM_STATUS_NAMES.get(code as usize).copied())
            .unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AlarmStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Mutable per-channel record of the latest observation.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    pub connected: bool,
    /// Set on the first connection and never cleared.
    pub ever_connected: bool,
    pub last_value: Option<PvValue>,
    pub previous_value: Option<PvValue>,
    /// Raw source timestamp, seconds since the Unix epoch.
    pub last_source_timestamp: Option<f64>,
    pub update_count: u64,
    pub change_count: u64,
    pub severity: Severity,
    pub alarm_status: AlarmStatus,
}

/// Outcome of applying one update to a [`ChannelState`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub value_changed: bool,
    pub previous_value: Option<PvValue>,
}

impl ChannelState {
    /// Apply a delivered value, rotating `previous_value` and counting
    /// changes.
    ///
    /// The first update has nothing to compare against and is never
    /// counted as a change.
    pub fn apply(
        &mut self,
        value: PvValue,
        source_timestamp: f64,
        severity: Severity,
        alarm_status: AlarmStatus,
    ) -> AppliedUpdate {
        self.update_count += 1;

        let value_changed = matches!(&self.last_value, Some(last) if *last != value);
        if value_changed {
            self.change_count += 1;
        }

        self.previous_value = self.last_value.replace(value);
        self.last_source_timestamp = Some(source_timestamp);
        self.severity = severity;
        self.alarm_status = alarm_status;

        AppliedUpdate {
            value_changed,
            previous_value: self.previous_value.clone(),
        }
    }

    /// Record a connection state change. Returns the previous state.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        let was = self.connected;
        self.connected = connected;
        if connected {
            self.ever_connected = true;
        }
        was
    }
}

/// One channel and its guarded state.
#[derive(Debug)]
pub struct ChannelSlot {
    pub channel: Channel,
    pub state: Mutex<ChannelState>,
}

/// Fixed set of monitored channels, keyed by name.
#[derive(Debug, Default)]
pub struct ChannelTable {
    slots: Vec<ChannelSlot>,
    index: HashMap<String, usize>,
}

impl ChannelTable {
    /// Build the table. Duplicate names collapse into a single slot.
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut table = ChannelTable::default();
        for channel in channels {
            if table.index.contains_key(channel.name()) {
                tracing::warn!(channel = %channel, "Ignoring duplicate channel");
                continue;
            }
            table.index.insert(channel.name().to_string(), table.slots.len());
            table.slots.push(ChannelSlot {
                channel,
                state: Mutex::new(ChannelState::default()),
            });
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&ChannelSlot> {
        self.index.get(name).map(|&i| &self.slots[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
