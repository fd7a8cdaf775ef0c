//! Simulated soft IOC.
//!
//! Every subscribed channel gets its own task, so callbacks for
//! different channels arrive concurrently just as they would from a
//! real network client. The signal a channel produces is chosen from the
//! last segment of its name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{ChannelUpdate, SubscriptionHandle, Transport, UpdateHandler};
use crate::channel::{AlarmStatus, Channel, PvValue, Severity};
use crate::error::Result;
use crate::skew::epoch_seconds;

/// Alarm status code for a HIGH limit violation.
const STATUS_HIGH: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Heartbeat,
    Counter,
    Status,
    Waveform,
    Analog,
    /// Never connects.
    Missing,
}

impl Signal {
    fn for_channel(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.contains("MISSING") {
            return Signal::Missing;
        }
        let field = upper.rsplit(':').next().unwrap_or(&upper);
        match field {
            f if f.ends_with("HEARTBEAT") => Signal::Heartbeat,
            f if f.ends_with("COUNTER") => Signal::Counter,
            f if f.ends_with("STATUS") => Signal::Status,
            f if f.ends_with("WAVEFORM") => Signal::Waveform,
            _ => Signal::Analog,
        }
    }

    /// Value and alarm state at tick `step`.
    fn sample(&self, step: u64) -> (PvValue, Severity, AlarmStatus) {
        let ok = (Severity::NoAlarm, AlarmStatus::from_code(0));
        let (value, (severity, status)) = match self {
            Signal::Heartbeat => (PvValue::Double((step % 2) as f64), ok),
            Signal::Counter => (PvValue::Int(step as i64), ok),
            Signal::Status => (PvValue::Str("RUNNING".to_string()), ok),
            Signal::Waveform => {
                let phase = step as f64 * 0.25;
                let samples = (0..8)
                    .map(|i| ((phase + i as f64 * 0.785).sin() * 100.0).round() / 100.0)
                    .collect();
                (PvValue::DoubleArray(samples), ok)
            }
            Signal::Analog | Signal::Missing => {
                // Rounded to a tenth so consecutive samples sometimes repeat
                let temp = ((20.0 + 2.0 * (step as f64 * 0.1).sin()) * 10.0).round() / 10.0;
                let alarm = if temp > 21.5 {
                    (Severity::Minor, AlarmStatus::from_code(STATUS_HIGH))
                } else {
                    ok
                };
                (PvValue::Double(temp), alarm)
            }
        };
        (value, severity, status)
    }
}

/// A transport that fabricates channel data locally.
///
/// | Name ends with | Signal |
/// |---|---|
/// | `HEARTBEAT` | toggles 0.0 / 1.0 |
/// | `COUNTER` | increments every period |
/// | `STATUS` | constant string `RUNNING` |
/// | `WAVEFORM` | 8-sample double array |
/// | anything else | analog value around 20.0, MINOR alarm above 21.5 |
///
/// Any name containing `MISSING` is accepted but never connects.
#[derive(Debug)]
pub struct SimulatedTransport {
    period: Duration,
    connect_delay: Duration,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl SimulatedTransport {
    /// Channels publish once per `period` after a short connect delay.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            connect_delay: Duration::from_millis(50),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Number of channels currently being simulated.
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

async fn run_channel(
    name: String,
    signal: Signal,
    period: Duration,
    connect_delay: Duration,
    handler: Arc<dyn UpdateHandler>,
) {
    tokio::time::sleep(connect_delay).await;
    if signal == Signal::Missing {
        return;
    }
    handler.on_connection(&name, true);

    let mut ticker = tokio::time::interval(period);
    let mut step = 0u64;
    loop {
        ticker.tick().await;
        let (value, severity, alarm_status) = signal.sample(step);
        handler.on_value(ChannelUpdate {
            channel: name.clone(),
            value,
            timestamp: epoch_seconds(Utc::now()),
            severity,
            alarm_status,
        });
        step += 1;
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<SubscriptionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = Signal::for_channel(channel.name());
        let task = tokio::spawn(run_channel(
            channel.name().to_string(),
            signal,
            self.period,
            self.connect_delay,
            handler,
        ));
        self.tasks.lock().insert(id, task);
        Ok(SubscriptionHandle::new(id, channel.name()))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if let Some(task) = self.tasks.lock().remove(&handle.id()) {
            task.abort();
        }
        Ok(())
    }

    fn description(&self) -> &str {
        "simulated soft IOC"
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        values: Mutex<Vec<ChannelUpdate>>,
        connected: Mutex<Vec<String>>,
    }

    impl UpdateHandler for Counter {
        fn on_value(&self, update: ChannelUpdate) {
            self.values.lock().push(update);
        }

        fn on_connection(&self, channel: &str, connected: bool) {
            if connected {
                self.connected.lock().push(channel.to_string());
            }
        }
    }

    #[test]
    fn signal_selection() {
        assert_eq!(Signal::for_channel("TEST:HEARTBEAT"), Signal::Heartbeat);
        assert_eq!(Signal::for_channel("test:counter"), Signal::Counter);
        assert_eq!(Signal::for_channel("TEST:MISSING:TEMP"), Signal::Missing);
        assert_eq!(Signal::for_channel("TEMPERATURE"), Signal::Analog);
    }

    #[test]
    fn heartbeat_toggles() {
        let values: Vec<PvValue> = (0..4).map(|s| Signal::Heartbeat.sample(s).0).collect();
        assert_eq!(
            values,
            vec![
                PvValue::Double(0.0),
                PvValue::Double(1.0),
                PvValue::Double(0.0),
                PvValue::Double(1.0)
            ]
        );
    }

    #[test]
    fn analog_raises_minor_alarm_when_high() {
        let alarmed = (0..100)
            .map(|s| Signal::Analog.sample(s))
            .find(|(_, severity, _)| *severity == Severity::Minor);
        let (_, _, status) = alarmed.unwrap();
        assert_eq!(status.as_str(), "HIGH");
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_until_unsubscribed() {
        let transport = SimulatedTransport::new(Duration::from_millis(100));
        let handler = Arc::new(Counter::default());

        let handle = transport
            .subscribe(&Channel::new("SIM:COUNTER"), handler.clone())
            .await
            .unwrap();
        let _missing = transport
            .subscribe(&Channel::new("SIM:MISSING"), handler.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(360)).await;
        transport.unsubscribe(handle).await.unwrap();
        let seen = handler.values.lock().len();
        assert!(seen >= 3, "expected at least 3 updates, got {seen}");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.values.lock().len(), seen);
        assert_eq!(handler.connected.lock().clone(), vec!["SIM:COUNTER".to_string()]);
        assert_eq!(transport.active(), 1);
    }
}
