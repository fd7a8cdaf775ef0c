//! The monitoring engine.
//!
//! [`MonitorEngine`] subscribes to every channel, turns each delivered
//! update into a [`Record`](crate::record::Record), and keeps the run
//! statistics that the periodic status line and the final report are
//! built from.
//!
//! ## Locking
//!
//! ```text
//! update for channel X
//!   gate (read)            ── shared by all in-flight updates
//!     X.state (mutex)      ── per channel, never global
//!       emitter (mutex)    ── sequence number + sink append, held briefly
//! ```
//!
//! Locks are always taken in this order. `stop()` takes the gate for
//! writing, which waits for every in-flight update to finish and keeps any
//! later one out of the sink.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::channel::{Channel, ChannelState, ChannelTable};
use crate::duration::format_duration;
use crate::error::{MonitorError, Result};
use crate::record::Observation;
use crate::sink::{RecordSink, DEFAULT_FLUSH_EVERY};
use crate::skew::{from_epoch_seconds, SkewEstimator, SkewLevel, SkewThresholds};
use crate::stats::{Diagnostics, RunStatistics, StatisticsAggregator};
use crate::transport::{ChannelUpdate, SubscriptionHandle, Transport, UpdateHandler};

/// Lifecycle of an engine.
///
/// `Idle → Starting → Running → Stopping → Stopped`. `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Runtime settings for an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Seconds added to source timestamps before skew is computed.
    pub clock_offset: f64,
    pub skew: SkewThresholds,
    /// Fully resolved CSV output path; `None` disables the sink.
    pub data_file: Option<PathBuf>,
    pub flush_every: usize,
    pub status_interval: Duration,
    /// Channels still unconnected after this long are reported.
    pub connect_timeout: Duration,
    /// Bound on each subscribe/unsubscribe call.
    pub transport_timeout: Duration,
    /// Where to write the final statistics as JSON.
    pub summary_file: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            clock_offset: 0.0,
            skew: SkewThresholds::default(),
            data_file: None,
            flush_every: DEFAULT_FLUSH_EVERY,
            status_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(5),
            summary_file: None,
        }
    }
}

/// Assigns sequence numbers and appends to the sink in one critical
/// section, so numbering matches file order.
#[derive(Debug)]
struct Emitter {
    last_sequence: u64,
    sink: RecordSink,
}

struct Ticker {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    settings: EngineSettings,
    skew: SkewEstimator,
    state: Mutex<EngineState>,
    channels: OnceLock<ChannelTable>,
    aggregator: OnceLock<StatisticsAggregator>,
    /// True while updates may be written. Cleared under the write lock.
    gate: RwLock<bool>,
    emitter: Mutex<Emitter>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    ticker: Mutex<Option<Ticker>>,
    late_updates: AtomicU64,
    sink_write_errors: AtomicU64,
}

/// Multi-channel change monitor.
///
/// Cheap to clone; clones share the same engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use pvwatch::{Channel, EngineSettings, MonitorEngine, SimulatedTransport};
///
/// #[tokio::main]
/// async fn main() -> pvwatch::Result<()> {
///     let transport = Arc::new(SimulatedTransport::new(Duration::from_secs(1)));
///     let engine = MonitorEngine::new(transport, EngineSettings::default());
///
///     engine.start(vec![Channel::new("TEST:HEARTBEAT")]).await?;
///     tokio::time::sleep(Duration::from_secs(5)).await;
///
///     if let Some(stats) = engine.stop().await {
///         println!("{} updates", stats.total_updates);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MonitorEngine {
    inner: Arc<EngineInner>,
}

impl MonitorEngine {
    pub fn new(transport: Arc<dyn Transport>, settings: EngineSettings) -> Self {
        let skew = SkewEstimator::new(settings.clock_offset, settings.skew);
        Self {
            inner: Arc::new(EngineInner {
                transport,
                skew,
                settings,
                state: Mutex::new(EngineState::Idle),
                channels: OnceLock::new(),
                aggregator: OnceLock::new(),
                gate: RwLock::new(false),
                emitter: Mutex::new(Emitter {
                    last_sequence: 0,
                    sink: RecordSink::disabled(),
                }),
                subscriptions: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
                late_updates: AtomicU64::new(0),
                sink_write_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Open the sink and subscribe to every channel.
    ///
    /// Returns once all subscribe calls have been issued; channels
    /// connect in the background. Fails with
    /// [`MonitorError::Configuration`] if `channels` is empty or the data
    /// file cannot be created.
    pub async fn start(&self, channels: Vec<Channel>) -> Result<()> {
        let inner = &self.inner;
        if channels.is_empty() {
            return Err(MonitorError::Configuration(
                "no channels to monitor".to_string(),
            ));
        }
        let table = inner.prepare(channels)?;

        tracing::info!(
            "Starting monitor for {} channel(s) via {}",
            table.len(),
            inner.transport.description()
        );
        for slot in table.iter() {
            tracing::info!("  - {}", slot.channel);
        }
        tracing::info!("Clock offset: {:.1}s", inner.skew.offset());
        match &inner.settings.data_file {
            Some(path) => tracing::info!("Dataset will be saved to: {}", path.display()),
            None => tracing::info!("No dataset file specified - data will not be saved"),
        }

        let handles = inner.subscribe_all(table, Arc::downgrade(inner)).await;
        inner.subscriptions.lock().extend(handles);

        let running = {
            let mut state = inner.state.lock();
            if *state == EngineState::Starting {
                *state = EngineState::Running;
                // Installed under the state lock so stop() either finds it
                // or never lets it start
                self.spawn_ticker();
                true
            } else {
                false
            }
        };

        if !running {
            // stop() ran while we were subscribing and has already
            // drained the subscription list it saw
            let leftover = std::mem::take(&mut *inner.subscriptions.lock());
            inner.unsubscribe_all(leftover).await;
            return Ok(());
        }

        tracing::info!("Monitoring {} channel(s)", table.len());
        Ok(())
    }

    /// Process one update delivered now.
    pub fn on_update(&self, update: ChannelUpdate) {
        self.inner.handle_update(update, Utc::now());
    }

    /// Process one update with an explicit local delivery time.
    pub fn on_update_at(&self, update: ChannelUpdate, local: DateTime<Utc>) {
        self.inner.handle_update(update, local);
    }

    /// Record a connection state change for `channel`.
    pub fn on_connection_change(&self, channel: &str, connected: bool) {
        self.inner.handle_connection(channel, connected);
    }

    /// Emit one status line and flush the sink.
    pub fn periodic_status_tick(&self) {
        self.inner.status_tick();
    }

    /// Current run statistics, or `None` before `start()`.
    pub fn snapshot(&self) -> Option<RunStatistics> {
        self.inner.snapshot()
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    /// A copy of one channel's state.
    pub fn channel_state(&self, name: &str) -> Option<ChannelState> {
        let table = self.inner.channels.get()?;
        table.get(name).map(|slot| slot.state.lock().clone())
    }

    /// Updates that arrived after shutdown began and were not recorded.
    pub fn late_updates(&self) -> u64 {
        self.inner.late_updates.load(Ordering::Relaxed)
    }

    /// Stop monitoring and emit the final report.
    ///
    /// Waits for in-flight updates, then unsubscribes every channel
    /// (each call bounded by the transport timeout), closes the sink and
    /// logs the report. Returns the final statistics on the first call
    /// and `None` on any later one.
    pub async fn stop(&self) -> Option<RunStatistics> {
        let inner = &self.inner;
        match inner.transition(
            &[EngineState::Starting, EngineState::Running],
            EngineState::Stopping,
        ) {
            Ok(_) => {}
            Err(EngineState::Idle) => {
                *inner.state.lock() = EngineState::Stopped;
                return None;
            }
            Err(_) => return None,
        }

        tracing::info!("Shutting down...");

        // Barrier: in-flight updates finish, later ones stay out of the sink
        *inner.gate.write() = false;

        let ticker = inner.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.stop_tx.send(true);
            let abort = ticker.task.abort_handle();
            if tokio::time::timeout(inner.settings.transport_timeout, ticker.task)
                .await
                .is_err()
            {
                tracing::warn!("Status ticker did not stop in time; aborting it");
                abort.abort();
            }
        }

        let handles = std::mem::take(&mut *inner.subscriptions.lock());
        inner.unsubscribe_all(handles).await;

        {
            let mut emitter = inner.emitter.lock();
            if let Err(e) = emitter.sink.close() {
                tracing::error!("Failed to close dataset file: {}", e);
            }
        }

        let stats = inner.snapshot();
        if let Some(stats) = &stats {
            for line in stats.report_lines() {
                tracing::info!("{}", line);
            }
            if let Some(path) = &inner.settings.summary_file {
                match stats.write_json(path) {
                    Ok(()) => tracing::info!("Run summary written to {}", path.display()),
                    Err(e) => tracing::error!("Failed to write run summary: {}", e),
                }
            }
        }

        *inner.state.lock() = EngineState::Stopped;
        tracing::info!("Monitoring stopped");
        stats
    }

    fn spawn_ticker(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.status_interval;
        let connect_timeout = self.inner.settings.connect_timeout;

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut status = tokio::time::interval_at(start + interval, interval);
            let connect_check = tokio::time::sleep(connect_timeout);
            tokio::pin!(connect_check);
            let mut checked = false;

            loop {
                tokio::select! {
                    _ = status.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.status_tick();
                    }
                    _ = &mut connect_check, if !checked => {
                        checked = true;
                        let Some(inner) = weak.upgrade() else { break };
                        inner.report_unconnected();
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        *self.inner.ticker.lock() = Some(Ticker { stop_tx, task });
    }
}

impl std::fmt::Debug for MonitorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorEngine")
            .field("state", &self.state())
            .field("transport", &self.inner.transport.description())
            .finish()
    }
}

impl EngineInner {
    /// Open the sink, build the channel table and open the gate, then
    /// publish `Starting`.
    ///
    /// Runs under the state lock, so `stop()` sees either an untouched
    /// engine or a fully prepared one. The gate is only ever opened here.
    fn prepare(&self, channels: Vec<Channel>) -> Result<&ChannelTable> {
        let mut state = self.state.lock();
        if *state != EngineState::Idle {
            return Err(MonitorError::InvalidState {
                expected: EngineState::Idle.as_str(),
                found: state.as_str(),
            });
        }

        let sink = match &self.settings.data_file {
            Some(path) => RecordSink::open(path, self.settings.flush_every).map_err(|e| {
                MonitorError::Configuration(format!("cannot open data file: {e}"))
            })?,
            None => RecordSink::disabled(),
        };
        self.emitter.lock().sink = sink;

        let table = self.channels.get_or_init(|| ChannelTable::new(channels));
        self.aggregator.get_or_init(StatisticsAggregator::start);
        *self.gate.write() = true;
        *state = EngineState::Starting;
        Ok(table)
    }

    /// Move to `to` if the current state is one of `from`. On failure
    /// returns the state that was found.
    fn transition(
        &self,
        from: &[EngineState],
        to: EngineState,
    ) -> std::result::Result<EngineState, EngineState> {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            let previous = *state;
            *state = to;
            Ok(previous)
        } else {
            Err(*state)
        }
    }

    async fn subscribe_all(
        &self,
        table: &ChannelTable,
        weak: Weak<EngineInner>,
    ) -> Vec<SubscriptionHandle> {
        let handler: Arc<dyn UpdateHandler> = Arc::new(EngineHandler(weak));
        let timeout = self.settings.transport_timeout;

        let mut pending = JoinSet::new();
        for slot in table.iter() {
            let transport = self.transport.clone();
            let handler = handler.clone();
            let channel = slot.channel.clone();
            pending.spawn(async move {
                let result = tokio::time::timeout(timeout, transport.subscribe(&channel, handler)).await;
                (channel, result)
            });
        }

        let mut handles = Vec::with_capacity(table.len());
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((_, Ok(Ok(handle)))) => handles.push(handle),
                Ok((channel, Ok(Err(e)))) => {
                    let err = MonitorError::Connection {
                        channel: channel.name().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::error!("{}", err);
                }
                Ok((channel, Err(_))) => {
                    let err = MonitorError::Timeout {
                        operation: format!("subscribe to {}", channel),
                        after: timeout,
                    };
                    tracing::error!("{}", err);
                }
                Err(e) => tracing::error!("Subscribe task failed: {}", e),
            }
        }
        handles
    }

    async fn unsubscribe_all(&self, handles: Vec<SubscriptionHandle>) {
        let timeout = self.settings.transport_timeout;
        let mut pending = JoinSet::new();
        for handle in handles {
            let transport = self.transport.clone();
            pending.spawn(async move {
                let channel = handle.channel().to_string();
                let result = tokio::time::timeout(timeout, transport.unsubscribe(handle)).await;
                (channel, result)
            });
        }

        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((channel, Ok(Err(e)))) => {
                    tracing::warn!(channel = %channel, "Unsubscribe failed: {}", e)
                }
                Ok((channel, Err(_))) => {
                    let err = MonitorError::Timeout {
                        operation: format!("unsubscribe from {}", channel),
                        after: timeout,
                    };
                    tracing::warn!("{}; proceeding with shutdown", err);
                }
                Err(e) => tracing::warn!("Unsubscribe task failed: {}", e),
            }
        }
    }

    fn handle_update(&self, update: ChannelUpdate, local: DateTime<Utc>) {
        let Some(slot) = self.channels.get().and_then(|t| t.get(&update.channel)) else {
            tracing::debug!(channel = %update.channel, "Ignoring update for unmonitored channel");
            return;
        };

        let gate = self.gate.read();
        if !*gate {
            self.late_updates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                channel = %update.channel,
                value = %update.value,
                "Update arrived after shutdown began; not recorded"
            );
            return;
        }

        let mut state = slot.state.lock();
        let skew = self.skew.estimate(update.timestamp, local);
        let value = update.value.clone();
        let applied = state.apply(
            update.value,
            update.timestamp,
            update.severity,
            update.alarm_status,
        );

        tracing::debug!(
            channel = %update.channel,
            value = %value,
            "PV {} changed to {} at {} (skew {:+.3}s {})",
            update.channel,
            value,
            local.format("%H:%M:%S%.3f"),
            skew.seconds,
            skew.level.symbol()
        );

        match skew.level {
            SkewLevel::Normal => {}
            SkewLevel::Warning => tracing::warn!(
                channel = %update.channel,
                "Minor clock skew: local time {:+.3}s relative to source timestamp",
                skew.seconds
            ),
            SkewLevel::Critical => tracing::error!(
                channel = %update.channel,
                "Clock skew detected: local time {:+.3}s relative to source timestamp",
                skew.seconds
            ),
        }

        if applied.value_changed {
            tracing::info!(
                "Change #{}: {} = {} (was {})",
                state.change_count,
                update.channel,
                value,
                applied
                    .previous_value
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
        }

        let observation = Observation {
            channel: update.channel,
            value,
            source_timestamp: update.timestamp,
            source_datetime: from_epoch_seconds(self.skew.adjusted_source(update.timestamp)),
            local_datetime: local,
            clock_skew_seconds: skew.seconds,
            clock_offset: self.skew.offset(),
            previous_value: applied.previous_value,
            value_changed: applied.value_changed,
            connected: state.connected,
            severity: state.severity,
            alarm_status: state.alarm_status,
        };
        self.emit(observation);
    }

    fn emit(&self, observation: Observation) {
        let mut emitter = self.emitter.lock();
        emitter.last_sequence += 1;
        let record = observation.into_record(emitter.last_sequence);
        if let Err(e) = emitter.sink.append(&record) {
            self.sink_write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                sequence = record.sequence_number,
                channel = %record.channel,
                "{}",
                e
            );
        }
    }

    fn handle_connection(&self, channel: &str, connected: bool) {
        let Some(slot) = self.channels.get().and_then(|t| t.get(channel)) else {
            tracing::debug!(channel = %channel, "Ignoring connection event for unmonitored channel");
            return;
        };

        let was_connected = slot.state.lock().set_connected(connected);
        match (was_connected, connected) {
            (true, false) => {
                let err = MonitorError::Connection {
                    channel: channel.to_string(),
                    reason: "disconnected; waiting for reconnect".to_string(),
                };
                tracing::warn!("{}", err);
            }
            (false, true) => tracing::info!("Connected to {}", channel),
            _ => tracing::debug!(channel = %channel, connected, "Connection state unchanged"),
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        let emitter = self.emitter.lock();
        Diagnostics {
            records_written: emitter.sink.records_written(),
            late_updates: self.late_updates.load(Ordering::Relaxed),
            sink_write_errors: self.sink_write_errors.load(Ordering::Relaxed),
            data_file: emitter.sink.path().map(|p| p.to_path_buf()),
        }
    }

    fn snapshot(&self) -> Option<RunStatistics> {
        let table = self.channels.get()?;
        let aggregator = self.aggregator.get()?;
        Some(aggregator.snapshot(table, self.diagnostics()))
    }

    fn status_tick(&self) {
        if let Some(stats) = self.snapshot() {
            tracing::info!("{}", stats.status_line());
        }
        if let Err(e) = self.emitter.lock().sink.flush() {
            self.sink_write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Failed to flush dataset file: {}", e);
        }
    }

    fn report_unconnected(&self) {
        let Some(table) = self.channels.get() else {
            return;
        };
        for slot in table.iter() {
            if !slot.state.lock().ever_connected {
                let err = MonitorError::Connection {
                    channel: slot.channel.name().to_string(),
                    reason: format!(
                        "not connected after {}; still waiting",
                        format_duration(self.settings.connect_timeout)
                    ),
                };
                tracing::warn!("{}", err);
            }
        }
    }
}

/// Transport-facing handler. Holds the engine weakly so a transport that
/// outlives the engine does not keep it alive.
struct EngineHandler(Weak<EngineInner>);

impl UpdateHandler for EngineHandler {
    fn on_value(&self, update: ChannelUpdate) {
        let local = Utc::now();
        if let Some(inner) = self.0.upgrade() {
            inner.handle_update(update, local);
        }
    }

    fn on_connection(&self, channel: &str, connected: bool) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_connection(channel, connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::failing_sink;
    use async_trait::async_trait;

    /// Accepts every subscription after yielding once, so start() spends
    /// real time in `Starting`.
    #[derive(Debug, Default)]
    struct YieldingTransport;

    #[async_trait]
    impl Transport for YieldingTransport {
        async fn subscribe(
            &self,
            channel: &Channel,
            handler: Arc<dyn UpdateHandler>,
        ) -> Result<SubscriptionHandle> {
            tokio::task::yield_now().await;
            handler.on_connection(channel.name(), true);
            Ok(SubscriptionHandle::new(1, channel.name()))
        }

        async fn unsubscribe(&self, _handle: SubscriptionHandle) -> Result<()> {
            Ok(())
        }

        fn description(&self) -> &str {
            "yielding"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_start_always_closes_the_gate() {
        let dir = tempfile::tempdir().unwrap();

        for run in 0..500 {
            let settings = EngineSettings {
                data_file: Some(dir.path().join(format!("run-{run}.csv"))),
                status_interval: Duration::from_millis(1),
                ..Default::default()
            };
            let engine = MonitorEngine::new(Arc::new(YieldingTransport), settings);

            let starter = engine.clone();
            let stopper = engine.clone();
            let start = tokio::spawn(async move {
                starter
                    .start(vec![Channel::new("A"), Channel::new("B")])
                    .await
            });
            let stop = tokio::spawn(async move { stopper.stop().await });
            let _ = start.await.unwrap();
            stop.await.unwrap();

            assert_eq!(engine.state(), EngineState::Stopped, "run {run}");
            assert!(!*engine.inner.gate.read(), "gate open after stop, run {run}");
            assert!(engine.inner.ticker.lock().is_none(), "ticker alive, run {run}");
            assert!(!engine.inner.emitter.lock().sink.is_open(), "sink open, run {run}");

            let late_before = engine.late_updates();
            engine.on_update(ChannelUpdate::new("A", 1i64, 0.0));
            let recorded = engine.channel_state("A").map_or(0, |s| s.update_count);
            assert_eq!(recorded, 0, "update recorded after stop, run {run}");
            if engine.inner.channels.get().is_some() {
                assert_eq!(engine.late_updates(), late_before + 1);
            }
        }
    }

    #[tokio::test]
    async fn sink_write_failures_do_not_stop_monitoring() {
        let engine = MonitorEngine::new(Arc::new(YieldingTransport), EngineSettings::default());
        engine.start(vec![Channel::new("A")]).await.unwrap();
        engine.inner.emitter.lock().sink = failing_sink("full.csv");

        for v in [1i64, 2, 3] {
            engine.on_update(ChannelUpdate::new("A", v, 0.0));
        }

        let state = engine.channel_state("A").unwrap();
        assert_eq!(state.update_count, 3);
        assert_eq!(state.change_count, 2);

        let stats = engine.stop().await.unwrap();
        assert_eq!(stats.total_updates, 3);
        assert_eq!(stats.sink_write_errors, 3);
        assert_eq!(stats.records_written, 0);
        assert!(stats
            .report_lines()
            .contains(&"Failed record writes: 3".to_string()));
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
