//! # pvwatch
//!
//! Multi-channel change monitor and logger for remotely published process
//! variables ("channels").
//!
//! Every update delivered by the transport becomes one CSV record carrying
//! a global sequence number, the source and local timestamps, the clock
//! skew between them, the previous value and the alarm metadata. Per-channel
//! counters feed a periodic status line and a final report.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        MonitorEngine                         │
//! │                                                              │
//! │  Transport ──▶ on_value ──▶ ChannelState ──▶ Record ──▶ Sink │
//! │  (stream |      (gate)      (per-channel     (seq no.)  (CSV)│
//! │   simulated)                  lock)                          │
//! │                   │                                          │
//! │                   ▼                                          │
//! │              SkewEstimator        StatisticsAggregator       │
//! │                                   (status line, report)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`engine`]**: lifecycle, update routing and the stop barrier
//! - **[`channel`]**: channel identity, values, alarm metadata and state
//! - **[`skew`]**: clock skew estimation and classification
//! - **[`record`]** / **[`sink`]**: the record layout and its CSV writer
//! - **[`stats`]**: run statistics, status lines and the final report
//! - **[`transport`]**: the [`Transport`] trait with stream and simulated
//!   implementations
//!
//! ## Usage
//!
//! ### As a CLI tool
//!
//! ```bash
//! # Watch two channels from the built-in simulator and log to data/run.csv
//! pvwatch --simulate -d run.csv TEST:HEARTBEAT TEST:COUNTER
//!
//! # Read events as JSON lines from a gateway
//! pvwatch --connect localhost:5065 -f channels.txt
//! ```
//!
//! ### As a library
//!
//! ```no_run
//! use std::sync::Arc;
//! use pvwatch::{channels_from_names, EngineSettings, MonitorEngine, StreamTransport};
//!
//! # async fn run() -> pvwatch::Result<()> {
//! let stream = tokio::net::TcpStream::connect("localhost:5065").await.unwrap();
//! let transport = Arc::new(StreamTransport::spawn(stream, "localhost:5065"));
//!
//! let engine = MonitorEngine::new(transport, EngineSettings::default());
//! engine.start(channels_from_names("TEST:", &["TEMP", "STATUS"])).await?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod logging;
pub mod record;
pub mod sink;
pub mod skew;
pub mod stats;
pub mod transport;

pub use channel::{channels_from_names, AlarmStatus, Channel, ChannelState, PvValue, Severity};
pub use config::MonitorConfig;
pub use engine::{EngineSettings, EngineState, MonitorEngine};
pub use error::{MonitorError, Result};
pub use record::Record;
pub use sink::RecordSink;
pub use skew::{SkewEstimator, SkewLevel, SkewThresholds};
pub use stats::{RunStatistics, StatisticsAggregator};
pub use transport::{
    ChannelUpdate, SimulatedTransport, StreamTransport, SubscriptionHandle, Transport,
    UpdateHandler,
};
