//! Ordered event fan-out to external collaborators
//!
//! Every subscriber owns an unbounded FIFO queue. Events are pushed into all
//! matching queues while the bus lock is held, so each subscriber observes
//! the global production order with nothing dropped or merged.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::types::{Conversation, ConversationId, Device, Message};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Change notifications produced by the sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The connection state machine moved to a new state
    StateChanged(ConnectionState),
    DeviceConnected(Device),
    DeviceDisconnected(Device),
    ScanStarted,
    /// Candidates surfaced by a finished scan
    ScanCompleted(Vec<Device>),
    /// Full conversation list after a successful sync
    ConversationsUpdated(Vec<Conversation>),
    /// Full message list of one conversation after a successful sync
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageAdded(Message),
    MessageUpdated(Message),
}

/// Discriminant of [`SyncEvent`] used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChanged,
    DeviceConnected,
    DeviceDisconnected,
    ScanStarted,
    ScanCompleted,
    ConversationsUpdated,
    MessagesUpdated,
    MessageAdded,
    MessageUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::StateChanged,
        EventKind::DeviceConnected,
        EventKind::DeviceDisconnected,
        EventKind::ScanStarted,
        EventKind::ScanCompleted,
        EventKind::ConversationsUpdated,
        EventKind::MessagesUpdated,
        EventKind::MessageAdded,
        EventKind::MessageUpdated,
    ];
}

/// Title and body for a desktop notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::StateChanged(_) => EventKind::StateChanged,
            SyncEvent::DeviceConnected(_) => EventKind::DeviceConnected,
            SyncEvent::DeviceDisconnected(_) => EventKind::DeviceDisconnected,
            SyncEvent::ScanStarted => EventKind::ScanStarted,
            SyncEvent::ScanCompleted(_) => EventKind::ScanCompleted,
            SyncEvent::ConversationsUpdated(_) => EventKind::ConversationsUpdated,
            SyncEvent::MessagesUpdated { .. } => EventKind::MessagesUpdated,
            SyncEvent::MessageAdded(_) => EventKind::MessageAdded,
            SyncEvent::MessageUpdated(_) => EventKind::MessageUpdated,
        }
    }

    /// Summary suitable for a desktop notification, if the event warrants one
    ///
    /// Only connectivity changes and messages from other participants
    /// produce a notification.
    pub fn notification(&self) -> Option<Notification> {
        match self {
            SyncEvent::DeviceConnected(device) => Some(Notification {
                title: "Device connected".to_string(),
                body: format!("Connected to {}", device.name),
            }),
            SyncEvent::DeviceDisconnected(device) => Some(Notification {
                title: "Device disconnected".to_string(),
                body: format!("Disconnected from {}", device.name),
            }),
            SyncEvent::MessageAdded(message) if !message.is_from_me => Some(Notification {
                title: message.sender.clone(),
                body: message.preview(),
            }),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Bus
// ----------------------------------------------------------------------------

struct Subscriber {
    kinds: HashSet<EventKind>,
    sender: mpsc::UnboundedSender<SyncEvent>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multi-subscriber event bus with per-subscriber FIFO delivery
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given event kinds
    pub fn subscribe(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                kinds: kinds.into_iter().collect(),
                sender,
            },
        );

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to every event kind
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(EventKind::ALL)
    }

    /// Run `handler` on a background task for each matching event
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen<F>(&self, kinds: impl IntoIterator<Item = EventKind>, mut handler: F) -> ListenerHandle
    where
        F: FnMut(SyncEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(kinds);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
        });
        ListenerHandle { task }
    }

    /// Deliver `event` to every subscriber interested in its kind
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        let mut inner = lock(&self.inner);
        let mut closed = Vec::new();

        for (id, subscriber) in inner.subscribers.iter() {
            if subscriber.kinds.contains(&kind) && subscriber.sender.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            inner.subscribers.remove(&id);
        }
        trace!("Emitted {:?} event", kind);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receiving half of a bus subscription; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<SyncEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    /// Take the next queued event without waiting
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving events
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            lock(&bus).subscribers.remove(&self.id);
        }
    }
}

/// Handle to a background listener; dropping it stops the listener
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn cancel(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
