//! Stream-based transport.
//!
//! Receives channel events from an async byte stream as newline-delimited
//! JSON. This is useful for bridging from an external gateway over TCP or
//! for replaying captured events from a file or stdin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::{ChannelUpdate, SubscriptionHandle, Transport, UpdateHandler};
use crate::channel::{AlarmStatus, Channel, PvValue, Severity};
use crate::error::Result;
use crate::skew::epoch_seconds;

/// One line of the event stream.
///
/// ```text
/// {"channel":"TEST:TEMP","value":20.5,"timestamp":1700000000.25,"severity":0,"status":0}
/// {"channel":"TEST:TEMP","connected":false}
/// ```
///
/// A missing `timestamp` is filled in with the local receive time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireEvent {
    Value {
        channel: String,
        value: PvValue,
        #[serde(default)]
        timestamp: Option<f64>,
        #[serde(default)]
        severity: Option<u16>,
        #[serde(default)]
        status: Option<u16>,
    },
    Connection {
        channel: String,
        connected: bool,
    },
}

type Subscribers = RwLock<HashMap<String, (u64, Arc<dyn UpdateHandler>)>>;

/// A transport fed by newline-delimited JSON events.
///
/// A background task reads the stream and dispatches each event to the
/// handler subscribed to its channel. Subscribed channels count as
/// connected while the stream is open; at end of stream or on a read
/// error every subscriber is told its channel disconnected.
pub struct StreamTransport {
    description: String,
    subscribers: Arc<Subscribers>,
    open: Arc<AtomicBool>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Spawn a background task that reads events from `reader`.
    ///
    /// Events for channels nobody has subscribed to are ignored, so
    /// subscribe before the producer starts sending.
    pub fn spawn<R>(reader: R, description: &str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let subscribers: Arc<Subscribers> = Arc::new(RwLock::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(read_events(reader, subscribers.clone(), open.clone()));

        Self {
            description: format!("stream: {}", description),
            subscribers,
            open,
            next_id: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
        }
    }

    /// Returns false once the stream has ended.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

async fn read_events<R>(reader: R, subscribers: Arc<Subscribers>, open: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::info!("Event stream closed");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(trimmed) {
                    Ok(event) => dispatch(&subscribers, event),
                    Err(e) => tracing::warn!("Skipping malformed event: {}", e),
                }
            }
            Err(e) => {
                tracing::error!("Event stream read error: {}", e);
                break;
            }
        }
    }

    open.store(false, Ordering::Release);
    let handlers: Vec<(String, Arc<dyn UpdateHandler>)> = subscribers
        .read()
        .iter()
        .map(|(name, (_, handler))| (name.clone(), handler.clone()))
        .collect();
    for (name, handler) in handlers {
        handler.on_connection(&name, false);
    }
}

fn dispatch(subscribers: &Subscribers, event: WireEvent) {
    let channel = match &event {
        WireEvent::Value { channel, .. } | WireEvent::Connection { channel, .. } => channel,
    };

    // Clone the handler out so no lock is held during the callback
    let Some(handler) = subscribers.read().get(channel).map(|(_, h)| h.clone()) else {
        tracing::trace!(channel = %channel, "Ignoring event for unsubscribed channel");
        return;
    };

    match event {
        WireEvent::Value {
            channel,
            value,
            timestamp,
            severity,
            status,
        } => handler.on_value(ChannelUpdate {
            channel,
            value,
            timestamp: timestamp.unwrap_or_else(|| epoch_seconds(Utc::now())),
            severity: severity.map_or(Severity::Unknown, Severity::from_code),
            alarm_status: status.map(AlarmStatus::from_code).unwrap_or_default(),
        }),
        WireEvent::Connection { channel, connected } => handler.on_connection(&channel, connected),
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn subscribe(
        &self,
        channel: &Channel,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<SubscriptionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .insert(channel.name().to_string(), (id, handler.clone()));

        if self.is_open() {
            handler.on_connection(channel.name(), true);
        }
        Ok(SubscriptionHandle::new(id, channel.name()))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut subscribers = self.subscribers.write();
        if subscribers.get(handle.channel()).map(|(id, _)| *id) == Some(handle.id()) {
            subscribers.remove(handle.channel());
        }
        Ok(())
    }

    fn description(&self) -> &str {
        &self.description
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("description", &self.description)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Default)]
    struct Collector {
        values: Mutex<Vec<ChannelUpdate>>,
        connections: Mutex<Vec<(String, bool)>>,
    }

    impl UpdateHandler for Collector {
        fn on_value(&self, update: ChannelUpdate) {
            self.values.lock().push(update);
        }

        fn on_connection(&self, channel: &str, connected: bool) {
            self.connections.lock().push((channel.to_string(), connected));
        }
    }

    #[test]
    fn wire_event_shapes() {
        let event: WireEvent =
            serde_json::from_str(r#"{"channel":"A","value":1.5,"timestamp":10.0,"severity":1}"#)
                .unwrap();
        assert_eq!(
            event,
            WireEvent::Value {
                channel: "A".to_string(),
                value: PvValue::Double(1.5),
                timestamp: Some(10.0),
                severity: Some(1),
                status: None,
            }
        );

        let event: WireEvent =
            serde_json::from_str(r#"{"channel":"A","connected":false}"#).unwrap();
        assert_eq!(
            event,
            WireEvent::Connection {
                channel: "A".to_string(),
                connected: false,
            }
        );
    }

    #[tokio::test]
    async fn test_stream_transport_dispatch() {
        // A duplex pipe keeps the stream open until we've subscribed
        let (mut client, server) = tokio::io::duplex(1024);
        let transport = StreamTransport::spawn(server, "test");
        let collector = Arc::new(Collector::default());

        transport
            .subscribe(&Channel::new("TEST:A"), collector.clone())
            .await
            .unwrap();

        use tokio::io::AsyncWriteExt;
        client
            .write_all(
                b"{\"channel\":\"TEST:A\",\"value\":1,\"timestamp\":5.0,\"severity\":2,\"status\":4}\n\
                  {\"channel\":\"TEST:B\",\"value\":2}\n\
                  not json\n\
                  {\"channel\":\"TEST:A\",\"value\":\"text\"}\n",
            )
            .await
            .unwrap();
        drop(client);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let values = collector.values.lock().clone();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, PvValue::Int(1));
        assert_eq!(values[0].timestamp, 5.0);
        assert_eq!(values[0].severity, Severity::Major);
        assert_eq!(values[0].alarm_status.as_str(), "HIGH");
        assert_eq!(values[1].value, PvValue::Str("text".to_string()));

        let connections = collector.connections.lock().clone();
        assert_eq!(
            connections,
            vec![("TEST:A".to_string(), true), ("TEST:A".to_string(), false)]
        );
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_stream_transport_unsubscribe_stops_delivery() {
        let (mut client, server) = tokio::io::duplex(1024);
        let transport = StreamTransport::spawn(server, "test");
        let collector = Arc::new(Collector::default());

        let handle = transport
            .subscribe(&Channel::new("TEST:A"), collector.clone())
            .await
            .unwrap();
        transport.unsubscribe(handle).await.unwrap();

        use tokio::io::AsyncWriteExt;
        client
            .write_all(b"{\"channel\":\"TEST:A\",\"value\":1}\n")
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(collector.values.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stream_transport_description() {
        let transport = StreamTransport::spawn(Cursor::new(Vec::new()), "tcp://localhost:5064");
        assert_eq!(transport.description(), "stream: tcp://localhost:5064");
    }
}
