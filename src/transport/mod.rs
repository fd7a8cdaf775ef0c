//! Subscription transport abstraction.
//!
//! A [`Transport`] connects to channels and delivers their updates to an
//! [`UpdateHandler`]. Delivery for a single channel is ordered; different
//! channels may deliver concurrently from different threads.
//!
//! Two transports ship with the crate:
//!
//! - [`StreamTransport`]: newline-delimited JSON events from any async
//!   reader (TCP socket, stdin, a file)
//! - [`SimulatedTransport`]: a soft IOC generating heartbeat, counter and
//!   analog signals, one task per channel

mod simulated;
mod stream;

pub use simulated::SimulatedTransport;
pub use stream::{StreamTransport, WireEvent};

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{AlarmStatus, Channel, PvValue, Severity};
use crate::error::Result;

/// One delivered value with its source-side metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub channel: String,
    pub value: PvValue,
    /// Source timestamp, seconds since the Unix epoch.
    pub timestamp: f64,
    pub severity: Severity,
    pub alarm_status: AlarmStatus,
}

impl ChannelUpdate {
    /// An update with no alarm.
    pub fn new(channel: impl Into<String>, value: impl Into<PvValue>, timestamp: f64) -> Self {
        Self {
            channel: channel.into(),
            value: value.into(),
            timestamp,
            severity: Severity::NoAlarm,
            alarm_status: AlarmStatus::from_code(0),
        }
    }

    pub fn with_alarm(mut self, severity: Severity, alarm_status: AlarmStatus) -> Self {
        self.severity = severity;
        self.alarm_status = alarm_status;
        self
    }
}

/// Receiver of transport callbacks.
pub trait UpdateHandler: Send + Sync {
    /// A new value arrived for a subscribed channel.
    fn on_value(&self, update: ChannelUpdate);

    /// A subscribed channel connected or disconnected.
    fn on_connection(&self, channel: &str, connected: bool);
}

/// Identifies one active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
}

impl SubscriptionHandle {
    pub fn new(id: u64, channel: impl Into<String>) -> Self {
        Self {
            id,
            channel: channel.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Trait for subscribing to channels over some protocol.
///
/// `subscribe` only submits the subscription; connection happens
/// asynchronously and is reported through
/// [`UpdateHandler::on_connection`].
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Human-readable description used in log output.
    fn description(&self) -> &str;
}
