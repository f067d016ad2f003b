//! Publish/subscribe hub between task executors and observers.
//!
//! Every subscription gets its own delivery thread fed by a channel, so a
//! slow or failing handler only delays its own queue. Subscriptions are
//! scoped: dropping the returned [`Subscription`] unregisters the handler
//! and lets the bus release it.

use crate::models::{DownloadProgress, DownloadStatus, RowToken, TaskId, VideoInfo};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    /// Label used when forwarding engine output, e.g. `[yt-dlp Warning]`.
    pub fn engine_label(&self) -> &'static str {
        match self {
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged,
    ProgressUpdated,
    InfoExtracted,
    LogMessage,
    Completed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusChanged => "status_changed",
            EventKind::ProgressUpdated => "progress_updated",
            EventKind::InfoExtracted => "info_extracted",
            EventKind::LogMessage => "log_message",
            EventKind::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    pub row: Option<RowToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    StatusChanged {
        status: DownloadStatus,
    },
    ProgressUpdated {
        progress: DownloadProgress,
    },
    InfoExtracted {
        info: VideoInfo,
    },
    LogMessage {
        text: String,
        level: LogLevel,
    },
    Completed {
        success: bool,
        status: DownloadStatus,
        error: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StatusChanged { .. } => EventKind::StatusChanged,
            EventPayload::ProgressUpdated { .. } => EventKind::ProgressUpdated,
            EventPayload::InfoExtracted { .. } => EventKind::InfoExtracted,
            EventPayload::LogMessage { .. } => EventKind::LogMessage,
            EventPayload::Completed { .. } => EventKind::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub task: TaskRef,
    pub payload: EventPayload,
    pub source: String,
    pub timestamp_ms: i64,
}

impl Event {
    pub fn new(task: TaskRef, payload: EventPayload, source: &str) -> Self {
        Self {
            task,
            payload,
            source: source.to_string(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

struct Subscriber {
    id: u64,
    filter: Option<EventKind>,
    tx: Sender<Arc<Event>>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Scoped registration; the handler is unregistered when this is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Some(kind), handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(None, handler)
    }

    /// Forwards matching events into a channel the caller drains.
    pub fn subscribe_channel(&self, kind: Option<EventKind>) -> (Subscription, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sub = self.register(kind, move |event: &Event| {
            let sender = tx.lock().unwrap_or_else(|e| e.into_inner());
            sender.send(event.clone())?;
            Ok(())
        });
        (sub, rx)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let removed = self.inner.remove(subscription.id);
        drop(subscription);
        removed
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn subscriber_count(&self, kind: Option<EventKind>) -> usize {
        let subs = self.inner.lock();
        match kind {
            None => subs.len(),
            Some(k) => subs.iter().filter(|s| s.filter == Some(k)).count(),
        }
    }

    /// Queues `event` for every live matching subscriber and returns how
    /// many it was queued for. Never waits on handler execution.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let targets: Vec<Sender<Arc<Event>>> = {
            let subs = self.inner.lock();
            subs.iter()
                .filter(|s| s.filter.map_or(true, |f| f == kind))
                .map(|s| s.tx.clone())
                .collect()
        };

        let event = Arc::new(event);
        targets
            .into_iter()
            .filter(|tx| tx.send(Arc::clone(&event)).is_ok())
            .count()
    }

    fn register<F>(&self, filter: Option<EventKind>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<Arc<Event>>();

        let spawned = thread::Builder::new()
            .name(format!("event-sub-{id}"))
            .spawn(move || {
                for event in rx {
                    deliver(id, &handler, &event);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(subscription = id, error = %e, "failed to start event delivery thread");
        }

        self.inner.lock().push(Subscriber { id, filter, tx });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }
}

fn deliver<F>(id: u64, handler: &F, event: &Event)
where
    F: Fn(&Event) -> HandlerResult,
{
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                subscription = id,
                event = event.kind().as_str(),
                task_id = %event.task.id,
                error = %e,
                "event handler failed"
            );
        }
        Err(_) => {
            tracing::error!(
                subscription = id,
                event = event.kind().as_str(),
                task_id = %event.task.id,
                "event handler panicked"
            );
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn task() -> TaskRef {
        TaskRef {
            id: TaskId::new(),
            row: Some(RowToken(7)),
        }
    }

    fn status(task: TaskRef, status: DownloadStatus) -> Event {
        Event::new(task, EventPayload::StatusChanged { status }, "test")
    }

    fn log(task: TaskRef, text: &str) -> Event {
        Event::new(
            task,
            EventPayload::LogMessage {
                text: text.to_string(),
                level: LogLevel::Info,
            },
            "test",
        )
    }

    #[test]
    fn kind_filter_only_delivers_matching_events() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe_channel(Some(EventKind::StatusChanged));
        let t = task();

        bus.publish(log(t, "ignored"));
        bus.publish(status(t, DownloadStatus::FetchingInfo));

        let got = rx.recv_timeout(WAIT).expect("status event");
        assert_eq!(got.kind(), EventKind::StatusChanged);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn per_task_order_is_preserved_for_each_subscriber() {
        let bus = EventBus::new();
        let (_a, rx_a) = bus.subscribe_channel(None);
        let (_b, rx_b) = bus.subscribe_channel(None);
        let t = task();
        for i in 0..50 {
            bus.publish(log(t, &i.to_string()));
        }
        for rx in [rx_a, rx_b] {
            for i in 0..50 {
                match rx.recv_timeout(WAIT).expect("event").payload {
                    EventPayload::LogMessage { text, .. } => assert_eq!(text, i.to_string()),
                    other => panic!("unexpected payload {other:?}"),
                }
            }
        }
    }

    #[test]
    fn dropping_subscription_unregisters_and_releases_handler() {
        let bus = EventBus::new();
        let marker = Arc::new(());
        let held = Arc::clone(&marker);
        let sub = bus.subscribe_all(move |_| {
            let _ = &held;
            Ok(())
        });
        assert_eq!(bus.subscriber_count(None), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(None), 0);
        assert_eq!(bus.publish(log(task(), "nobody")), 0);

        let deadline = std::time::Instant::now() + WAIT;
        while Arc::strong_count(&marker) > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(Arc::strong_count(&marker), 1, "bus kept the handler alive");
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_block_others() {
        let bus = EventBus::new();
        let _err = bus.subscribe_all(|_| Err("boom".into()));
        let _panic = bus.subscribe_all(|_| panic!("handler bug"));
        let (_ok, rx) = bus.subscribe_channel(None);
        let t = task();

        assert_eq!(bus.publish(log(t, "first")), 3);
        bus.publish(log(t, "second"));

        assert!(rx.recv_timeout(WAIT).is_ok());
        assert!(rx.recv_timeout(WAIT).is_ok());
    }

    #[test]
    fn slow_handler_does_not_block_publisher() {
        let bus = EventBus::new();
        let _slow = bus.subscribe_all(|_| {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        let started = std::time::Instant::now();
        for _ in 0..10 {
            bus.publish(log(task(), "x"));
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn unsubscribe_and_clear() {
        let bus = EventBus::new();
        let a = bus.subscribe(EventKind::Completed, |_| Ok(()));
        let _b = bus.subscribe(EventKind::LogMessage, |_| Ok(()));
        assert_eq!(bus.subscriber_count(Some(EventKind::Completed)), 1);
        assert!(bus.unsubscribe(a));
        assert_eq!(bus.subscriber_count(None), 1);
        bus.clear();
        assert_eq!(bus.subscriber_count(None), 0);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let event = status(task(), DownloadStatus::Downloading);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["payload"]["type"], "status_changed");
        assert_eq!(json["payload"]["status"], "downloading");
    }
}
