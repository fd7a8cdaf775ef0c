//! Run statistics: snapshots, status lines and the final report.
//!
//! Statistics are derived from the channel table on demand rather than
//! maintained separately, so a snapshot can never disagree with the
//! per-channel counters it summarizes.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::{AlarmStatus, ChannelTable, Severity};
use crate::duration::format_duration;
use crate::error::{MonitorError, Result};

/// Per-channel view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub connected: bool,
    pub ever_connected: bool,
    pub update_count: u64,
    pub change_count: u64,
    pub last_value: Option<String>,
    pub severity: Severity,
    pub alarm_status: AlarmStatus,
}

/// Engine-level counters that do not live in channel state.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub records_written: u64,
    pub late_updates: u64,
    pub sink_write_errors: u64,
    pub data_file: Option<PathBuf>,
}

/// Aggregate statistics for a run, at the instant they were taken.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_updates: u64,
    pub total_changes: u64,
    pub channel_count: usize,
    pub connected_count: usize,
    pub records_written: u64,
    pub late_updates: u64,
    pub sink_write_errors: u64,
    pub data_file: Option<PathBuf>,
    /// Sorted by channel name.
    pub channels: Vec<ChannelStats>,
}

/// Rolls channel counters up into [`RunStatistics`].
#[derive(Debug, Clone)]
pub struct StatisticsAggregator {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StatisticsAggregator {
    /// Start the run clock now.
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take a snapshot. Each channel lock is held only long enough to
    /// copy its counters.
    pub fn snapshot(&self, table: &ChannelTable, diagnostics: Diagnostics) -> RunStatistics {
        let mut channels: Vec<ChannelStats> = table
            .iter()
            .map(|slot| {
                let state = slot.state.lock();
                ChannelStats {
                    name: slot.channel.name().to_string(),
                    connected: state.connected,
                    ever_connected: state.ever_connected,
                    update_count: state.update_count,
                    change_count: state.change_count,
                    last_value: state.last_value.as_ref().map(ToString::to_string),
                    severity: state.severity,
                    alarm_status: state.alarm_status,
                }
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        RunStatistics {
            started_at: self.started_at,
            elapsed_secs: self.elapsed().as_secs_f64(),
            total_updates: channels.iter().map(|c| c.update_count).sum(),
            total_changes: channels.iter().map(|c| c.change_count).sum(),
            channel_count: channels.len(),
            connected_count: channels.iter().filter(|c| c.connected).count(),
            records_written: diagnostics.records_written,
            late_updates: diagnostics.late_updates,
            sink_write_errors: diagnostics.sink_write_errors,
            data_file: diagnostics.data_file,
            channels,
        }
    }
}

impl RunStatistics {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }

    /// One-line summary for periodic status output.
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "Status: {} updates recorded, {} value changes across {} channels ({} connected), elapsed {}",
            self.total_updates,
            self.total_changes,
            self.channel_count,
            self.connected_count,
            format_duration(self.elapsed()),
        );
        if let Some(path) = &self.data_file {
            line.push_str(&format!(" (saved to {})", path.display()));
        }
        line
    }

    /// Lines of the final report, in output order.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Monitoring duration: {}", format_duration(self.elapsed())),
            format!("Total channel updates recorded: {}", self.total_updates),
            format!("Total value changes: {}", self.total_changes),
            format!("Monitored channels: {}", self.channel_count),
        ];
        if self.late_updates > 0 {
            lines.push(format!(
                "Updates received after shutdown began: {}",
                self.late_updates
            ));
        }
        if self.sink_write_errors > 0 {
            lines.push(format!("Failed record writes: {}", self.sink_write_errors));
        }
        for channel in &self.channels {
            let mut line = format!(
                "  {}: {} updates, {} changes",
                channel.name, channel.update_count, channel.change_count
            );
            if !channel.ever_connected {
                line.push_str(" (never connected)");
            }
            lines.push(line);
        }
        if let Some(path) = &self.data_file {
            lines.push(format!("Dataset saved to {}", path.display()));
            lines.push(format!("Total records written: {}", self.records_written));
        }
        lines
    }

    /// Write the statistics to `path` as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MonitorError::io(path, std::io::Error::other(e)))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| MonitorError::io(parent, e))?;
        }
        std::fs::write(path, json).map_err(|e| MonitorError::io(path, e))
    }
}
