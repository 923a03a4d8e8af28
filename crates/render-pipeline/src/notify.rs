//! Best-effort fan-out of generation progress to connected push clients

use crate::error::Result;
use crate::protocol::WireMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// The outbound half of a push connection. Implementations serialize their
/// own writes, so concurrent senders never interleave messages.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn send(&self, message: WireMessage) -> Result<()>;

    fn is_open(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    GenerationStarted,
    GenerationFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub file_id: String,
    pub root_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, file_id: impl Into<String>, root_id: Option<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            root_id,
            at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

const EVENT_QUEUE_DEPTH: usize = 1024;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry of open push connections.
///
/// Published events go through one queue and are broadcast in publish
/// order. A channel that does not accept a message within
/// `DELIVERY_TIMEOUT` misses that event.
#[derive(Default)]
pub struct NotificationBus {
    channels: DashMap<ClientId, Arc<dyn ChannelWriter>>,
    queue: Mutex<Option<mpsc::Sender<Event>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, writer: Arc<dyn ChannelWriter>) -> ClientId {
        let id = ClientId::new();
        self.channels.insert(id, writer);
        debug!(client = %id, connected = self.channels.len(), "push client registered");
        id
    }

    pub fn unregister(&self, id: &ClientId) {
        if self.channels.remove(id).is_some() {
            debug!(client = %id, connected = self.channels.len(), "push client unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send `event` to every open channel, or only to `target`.
    /// Returns the number of channels that accepted it.
    pub async fn broadcast(&self, event: &Event, target: Option<&ClientId>) -> usize {
        // Clone the writers out so no map shard is held across an await
        let recipients: Vec<(ClientId, Arc<dyn ChannelWriter>)> = match target {
            Some(id) => self
                .channels
                .get(id)
                .map(|entry| vec![(*id, Arc::clone(entry.value()))])
                .unwrap_or_default(),
            None => self
                .channels
                .iter()
                .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                .collect(),
        };

        let text = event.to_json();
        let sends = recipients.iter().map(|(id, writer)| {
            let message = WireMessage::Text(text.clone());
            async move {
                if !writer.is_open() {
                    return (*id, false);
                }
                match tokio::time::timeout(DELIVERY_TIMEOUT, writer.send(message)).await {
                    Ok(Ok(())) => (*id, true),
                    Ok(Err(e)) => {
                        warn!(client = %id, error = %e, "notification delivery failed");
                        (*id, false)
                    }
                    Err(_) => {
                        warn!(client = %id, "notification delivery timed out");
                        (*id, false)
                    }
                }
            }
        });

        let mut delivered = 0;
        for (id, ok) in join_all(sends).await {
            if ok {
                delivered += 1;
                continue;
            }
            let closed = self
                .channels
                .get(&id)
                .map(|entry| !entry.value().is_open())
                .unwrap_or(false);
            if closed {
                self.unregister(&id);
            }
        }
        delivered
    }

    /// Queue `event` for broadcast to all channels. Events are delivered in
    /// publish order; when the queue is full the event is dropped.
    pub fn publish(self: &Arc<Self>, event: Event) {
        if self.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        let sender = queue.get_or_insert_with(|| spawn_dispatcher(Arc::downgrade(self)));
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(file_id = %event.file_id, "notification queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("notification dispatcher stopped");
            }
        }
    }
}

fn spawn_dispatcher(bus: Weak<NotificationBus>) -> mpsc::Sender<Event> {
    let (sender, mut events) = mpsc::channel::<Event>(EVENT_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(bus) = bus.upgrade() else {
                break;
            };
            bus.broadcast(&event, None).await;
        }
    });
    sender
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<WireMessage>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl ChannelWriter for RecordingWriter {
        async fn send(&self, message: WireMessage) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PipelineError::Channel("closed".to_string()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new(EventKind::GenerationStarted, "f1", Some("root-a".to_string()));
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "generationStarted");
        assert_eq!(value["fileId"], "f1");
        assert_eq!(value["rootId"], "root-a");
        assert!(value["at"].is_string());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_open_channels() {
        let bus = NotificationBus::new();
        let a = Arc::new(RecordingWriter::default());
        let b = Arc::new(RecordingWriter::default());
        bus.register(a.clone());
        bus.register(b.clone());

        let event = Event::new(EventKind::GenerationFinished, "f1", None);
        assert_eq!(bus.broadcast(&event, None).await, 2);
        assert_eq!(a.sent.lock().len(), 1);
        assert_eq!(b.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_channel_does_not_block_others() {
        let bus = NotificationBus::new();
        let healthy = Arc::new(RecordingWriter::default());
        let broken = Arc::new(RecordingWriter::default());
        broken.closed.store(true, Ordering::SeqCst);
        bus.register(healthy.clone());
        bus.register(broken.clone());

        let event = Event::new(EventKind::GenerationStarted, "f1", None);
        assert_eq!(bus.broadcast(&event, None).await, 1);
        assert_eq!(healthy.sent.lock().len(), 1);
        // Closed channels are dropped from the registry
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_targeted_broadcast() {
        let bus = NotificationBus::new();
        let a = Arc::new(RecordingWriter::default());
        let b = Arc::new(RecordingWriter::default());
        let id_a = bus.register(a.clone());
        bus.register(b.clone());

        let event = Event::new(EventKind::GenerationStarted, "f1", None);
        assert_eq!(bus.broadcast(&event, Some(&id_a)).await, 1);
        assert_eq!(a.sent.lock().len(), 1);
        assert!(b.sent.lock().is_empty());

        bus.unregister(&id_a);
        assert_eq!(bus.broadcast(&event, Some(&id_a)).await, 0);
    }

    /// Holds back "started" messages so a later event would overtake them
    /// if events were not delivered in order
    #[derive(Default)]
    struct SlowStartWriter {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelWriter for SlowStartWriter {
        async fn send(&self, message: WireMessage) -> Result<()> {
            if let WireMessage::Text(text) = message {
                if text.contains("generationStarted") {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                self.sent.lock().push(text);
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_published_events_keep_order() {
        let bus = Arc::new(NotificationBus::new());
        let writer = Arc::new(SlowStartWriter::default());
        bus.register(writer.clone());

        bus.publish(Event::new(EventKind::GenerationStarted, "f1", None));
        bus.publish(Event::new(EventKind::GenerationFinished, "f1", None));

        for _ in 0..200 {
            if writer.sent.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = writer.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("generationStarted"));
        assert!(sent[1].contains("generationFinished"));
    }

    #[tokio::test]
    async fn test_publish_without_channels_is_a_no_op() {
        let bus = Arc::new(NotificationBus::new());
        bus.publish(Event::new(EventKind::GenerationStarted, "f1", None));
        assert!(bus.queue.lock().is_none());
    }
}
