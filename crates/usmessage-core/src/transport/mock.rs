//! In-memory companion device for tests and demo mode
//!
//! [`MockTransport`] serves a scripted [`MockDevice`] over channels that
//! behave like a characteristic link. Each endpoint holds one value slot: a
//! write hands the request to the simulated device, which replaces the slot
//! value after a per-action delay, and the writer reads the next value that
//! lands in the slot. Two unserialized overlapping exchanges therefore read
//! each other's responses, which is the hazard [`RequestPipe`] exists to
//! prevent.
//!
//! [`RequestPipe`]: crate::transport::RequestPipe

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::DEFAULT_MAX_CHUNK_PAYLOAD;
use crate::connection::LinkMonitor;
use crate::errors::{Result, SyncError};
use crate::protocol::chunk::{split_into_frames, ChunkAssembler};
use crate::protocol::{
    Action, ConversationsPayload, MessagesPayload, Push, Request, Response, SendReceipt,
    WireAttachment, WireConversation, WireMessage,
};
use crate::transport::{Channel, DiscoveredDevice, Endpoint, Transport};
use crate::types::{
    AttachmentId, ConversationId, DeliveryStatus, Device, DeviceId, MessageId, Timestamp,
    TransportKind,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Simulated Device
// ----------------------------------------------------------------------------

/// Companion device state served by the mock transport
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub id: DeviceId,
    /// Advertised name; `None` advertises anonymously
    pub name: Option<String>,
    pub conversations: Vec<WireConversation>,
    pub messages: BTreeMap<ConversationId, Vec<WireMessage>>,
    pub attachments: HashMap<AttachmentId, Vec<u8>>,
    next_message: u64,
}

impl MockDevice {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            conversations: Vec::new(),
            messages: BTreeMap::new(),
            attachments: HashMap::new(),
            next_message: 1,
        }
    }

    /// A device that advertises no local name
    pub fn anonymous(id: impl Into<DeviceId>) -> Self {
        Self {
            name: None,
            ..Self::new(id, "")
        }
    }

    pub fn with_conversation(mut self, conversation: WireConversation) -> Self {
        self.messages.entry(conversation.id.clone()).or_default();
        self.conversations.push(conversation);
        self
    }

    pub fn with_message(mut self, conversation: &ConversationId, message: WireMessage) -> Self {
        self.messages
            .entry(conversation.clone())
            .or_default()
            .push(message);
        self
    }

    pub fn with_attachment(mut self, id: impl Into<AttachmentId>, bytes: impl Into<Vec<u8>>) -> Self {
        self.attachments.insert(id.into(), bytes.into());
        self
    }

    fn device(&self) -> Device {
        let name = self.name.clone().unwrap_or_else(|| self.id.to_string());
        Device::new(self.id.clone(), name, TransportKind::Bluetooth)
    }

    /// Device-side handling of one request/response exchange
    fn handle(&mut self, request: &Request, canonical_ids: bool) -> Result<Response> {
        match request.action {
            Action::GetConversations => Response::ok(&ConversationsPayload {
                conversations: self.conversations.clone(),
            }),
            Action::GetMessages => {
                let Some(conversation) = &request.conversation_id else {
                    return Ok(Response::err("conversationId is required"));
                };
                match self.messages.get(conversation) {
                    Some(messages) => Response::ok(&MessagesPayload {
                        messages: messages.clone(),
                    }),
                    None => Ok(Response::err(format!("unknown conversation {}", conversation))),
                }
            }
            Action::SendMessage => self.accept_message(request, canonical_ids),
            Action::GetAttachment => Ok(Response::err("attachments are served chunked")),
        }
    }

    fn accept_message(&mut self, request: &Request, canonical_ids: bool) -> Result<Response> {
        let (Some(conversation), Some(client_id)) =
            (&request.conversation_id, &request.client_message_id)
        else {
            return Ok(Response::err("conversationId and clientMessageId are required"));
        };
        if !self.messages.contains_key(conversation) {
            return Ok(Response::err(format!("unknown conversation {}", conversation)));
        }

        let canonical = format!("msg-{}-{}", conversation, self.next_message);
        self.next_message += 1;

        let mut attachments = Vec::new();
        for (index, descriptor) in request.attachments.iter().enumerate() {
            let id = AttachmentId::new(format!("{}-att-{}", canonical, index));
            self.attachments.insert(id.clone(), descriptor.decode_data()?);
            attachments.push(WireAttachment {
                id,
                mime_type: descriptor.mime_type.clone(),
                filename: descriptor.filename.clone(),
                size: descriptor.size,
                thumbnail: None,
            });
        }

        let stored_id = if canonical_ids {
            MessageId::new(canonical.clone())
        } else {
            client_id.clone()
        };
        let message = WireMessage {
            id: stored_id,
            conversation_id: Some(conversation.clone()),
            sender: "me".to_string(),
            text: request.text.clone(),
            timestamp: Timestamp::now().as_millis(),
            attachments,
            is_from_me: Some(true),
            status: Some(DeliveryStatus::Sent),
        };
        if let Some(entry) = self.conversations.iter_mut().find(|c| &c.id == conversation) {
            entry.last_message = Some(message.clone());
        }
        self.messages
            .entry(conversation.clone())
            .or_default()
            .push(message);

        Response::ok(&SendReceipt {
            message_id: canonical_ids.then_some(canonical),
            client_message_id: Some(client_id.clone()),
        })
    }
}

// ----------------------------------------------------------------------------
// Failure Injection
// ----------------------------------------------------------------------------

/// Fault applied to the next exchange on any endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Never answer
    Stall,
    /// Drop the link mid-exchange
    LinkLost,
    /// Answer with bytes that are not a valid response
    Garbage,
    /// Answer `{success: false}` with the given reason
    Reject(String),
}

struct Behaviour {
    action_delays: HashMap<Action, Duration>,
    failures: VecDeque<MockFailure>,
    canonical_ids: bool,
    scripted_frames: Option<Vec<Vec<u8>>>,
    length_hint: bool,
    /// Data bytes the device puts in each frame it sends
    chunk_size: usize,
    open_delay: Duration,
    open_failures: usize,
    scan_failure: Option<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            action_delays: HashMap::new(),
            failures: VecDeque::new(),
            canonical_ids: false,
            scripted_frames: None,
            length_hint: true,
            chunk_size: DEFAULT_MAX_CHUNK_PAYLOAD,
            open_delay: Duration::ZERO,
            open_failures: 0,
            scan_failure: None,
        }
    }
}

struct ActiveChannel {
    monitor: LinkMonitor,
    channel: Arc<MockChannel>,
}

struct MockShared {
    devices: Mutex<BTreeMap<DeviceId, MockDevice>>,
    behaviour: Mutex<Behaviour>,
    active: Mutex<Option<ActiveChannel>>,
    requests: AtomicUsize,
    transfers: AtomicUsize,
    opens: AtomicUsize,
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

/// Transport backed by in-memory [`MockDevice`]s
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::Bluetooth)
    }

    /// A mock answering for a specific transport kind
    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            shared: Arc::new(MockShared {
                devices: Mutex::new(BTreeMap::new()),
                behaviour: Mutex::new(Behaviour::default()),
                active: Mutex::new(None),
                requests: AtomicUsize::new(0),
                transfers: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// Mock preloaded with a phone and a handful of conversations
    pub fn demo() -> Self {
        let transport = Self::new();
        transport.add_device(demo_device());
        transport.add_device(MockDevice::new("dev-77", "Living Room TV"));
        transport
    }

    pub fn add_device(&self, device: MockDevice) {
        lock(&self.shared.devices).insert(device.id.clone(), device);
    }

    /// Inspect a device's current state
    pub fn device(&self, id: &DeviceId) -> Option<MockDevice> {
        lock(&self.shared.devices).get(id).cloned()
    }

    /// Delay the simulated device's answer to `action`
    pub fn set_action_delay(&self, action: Action, delay: Duration) {
        lock(&self.shared.behaviour).action_delays.insert(action, delay);
    }

    /// Queue a fault for the next exchange
    pub fn fail_next(&self, failure: MockFailure) {
        lock(&self.shared.behaviour).failures.push_back(failure);
    }

    /// Make the device assign its own ids to sent messages
    pub fn set_canonical_ids(&self, enabled: bool) {
        lock(&self.shared.behaviour).canonical_ids = enabled;
    }

    /// Serve these raw frames for the next chunked transfer
    pub fn script_frames(&self, frames: Vec<Vec<u8>>) {
        lock(&self.shared.behaviour).scripted_frames = Some(frames);
    }

    pub fn set_length_hint(&self, enabled: bool) {
        lock(&self.shared.behaviour).length_hint = enabled;
    }

    /// Data bytes per frame the device sends in chunked transfers
    pub fn set_chunk_size(&self, size: usize) {
        lock(&self.shared.behaviour).chunk_size = size;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.shared.behaviour).open_delay = delay;
    }

    /// Fail the next `count` open attempts with `LinkUnavailable`
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.shared.behaviour).open_failures = count;
    }

    pub fn fail_scan(&self, reason: impl Into<String>) {
        lock(&self.shared.behaviour).scan_failure = Some(reason.into());
    }

    /// Request/response exchanges served so far
    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Chunked attachment transfers served so far
    pub fn transfer_count(&self) -> usize {
        self.shared.transfers.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Simulate the device going out of range
    pub fn drop_link(&self) {
        let active = lock(&self.shared.active).take();
        if let Some(active) = active {
            info!("Mock link to {} dropped", active.channel.device_id);
            active.channel.shut();
            active.monitor.signal_lost("device went out of range");
        }
    }

    /// Deliver a push to the connected host, also recording a received message
    pub fn push(&self, push: &Push) -> Result<()> {
        if let Push::MessageReceived { message } = push {
            if let Some(conversation) = &message.conversation_id {
                let mut devices = lock(&self.shared.devices);
                for device in devices.values_mut() {
                    if let Some(thread) = device.messages.get_mut(conversation) {
                        thread.push(message.clone());
                    }
                }
            }
        }
        self.push_raw(push.encode()?);
        Ok(())
    }

    /// Deliver raw bytes on the notifications endpoint
    pub fn push_raw(&self, bytes: Vec<u8>) {
        let channel = lock(&self.shared.active)
            .as_ref()
            .map(|active| active.channel.clone());
        if let Some(channel) = channel {
            channel.notify(bytes);
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("kind", &self.kind)
            .field("requests", &self.request_count())
            .field("transfers", &self.transfer_count())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        if let Some(reason) = lock(&self.shared.behaviour).scan_failure.take() {
            return Err(SyncError::Transport(reason));
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;

        let devices = lock(&self.shared.devices);
        Ok(devices
            .values()
            .map(|device| DiscoveredDevice {
                id: device.id.clone(),
                name: device.name.clone(),
                address: None,
                transport: self.kind,
                paired: true,
            })
            .collect())
    }

    async fn open(&self, device_id: &DeviceId, monitor: LinkMonitor) -> Result<Arc<dyn Channel>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut behaviour = lock(&self.shared.behaviour);
            if behaviour.open_failures > 0 {
                behaviour.open_failures -= 1;
                return Err(SyncError::LinkUnavailable {
                    reason: format!("{} did not answer", device_id),
                });
            }
            behaviour.open_delay
        };
        tokio::time::sleep(delay).await;

        let device = lock(&self.shared.devices)
            .get(device_id)
            .map(MockDevice::device)
            .ok_or_else(|| SyncError::LinkUnavailable {
                reason: format!("{} is not in range", device_id),
            })?;

        let channel = Arc::new(MockChannel::new(device, self.shared.clone()));
        *lock(&self.shared.active) = Some(ActiveChannel {
            monitor,
            channel: channel.clone(),
        });
        debug!("Mock channel opened to {}", device_id);
        Ok(channel)
    }
}

// ----------------------------------------------------------------------------
// Mock Channel
// ----------------------------------------------------------------------------

struct MockChannel {
    device_id: DeviceId,
    device: Device,
    shared: Arc<MockShared>,
    slots: [Arc<watch::Sender<Vec<u8>>>; Endpoint::COUNT],
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    closed: AtomicBool,
}

enum Outcome {
    Answer(Vec<u8>),
    Stall,
    Lost,
}

impl MockChannel {
    fn new(device: Device, shared: Arc<MockShared>) -> Self {
        let slot = || Arc::new(watch::channel(Vec::new()).0);
        Self {
            device_id: device.id.clone(),
            device,
            shared,
            slots: [slot(), slot(), slot()],
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.subscribers).clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify(&self, bytes: Vec<u8>) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(bytes.clone()).is_ok());
    }

    fn take_failure(&self) -> Option<MockFailure> {
        lock(&self.shared.behaviour).failures.pop_front()
    }

    fn delay_for(&self, action: Option<Action>) -> Duration {
        action
            .and_then(|action| lock(&self.shared.behaviour).action_delays.get(&action).copied())
            .unwrap_or(Duration::ZERO)
    }

    /// What the simulated device does with one written request
    fn respond(&self, payload: &[u8]) -> Result<Outcome> {
        self.shared.requests.fetch_add(1, Ordering::SeqCst);
        match self.take_failure() {
            Some(MockFailure::Stall) => return Ok(Outcome::Stall),
            Some(MockFailure::LinkLost) => return Ok(Outcome::Lost),
            Some(MockFailure::Garbage) => return Ok(Outcome::Answer(b"\x00not json".to_vec())),
            Some(MockFailure::Reject(reason)) => {
                return Ok(Outcome::Answer(Response::err(reason).encode()?))
            }
            None => {}
        }

        let response = match Request::decode(payload) {
            Ok(request) => {
                let canonical_ids = lock(&self.shared.behaviour).canonical_ids;
                let mut devices = lock(&self.shared.devices);
                match devices.get_mut(&self.device_id) {
                    Some(device) => device.handle(&request, canonical_ids)?,
                    None => return Ok(Outcome::Lost),
                }
            }
            Err(e) => Response::err(e.to_string()),
        };
        Ok(Outcome::Answer(response.encode()?))
    }

    fn lose_link(&self) {
        let active = lock(&self.shared.active).take();
        self.shut();
        if let Some(active) = active {
            active.monitor.signal_lost("device dropped the link mid-exchange");
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn device(&self) -> Device {
        self.device.clone()
    }

    async fn request(&self, endpoint: Endpoint, payload: &[u8]) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(SyncError::LinkLost);
        }

        let slot = self.slots[endpoint.index()].clone();
        let mut reader = slot.subscribe();
        let action = Request::decode(payload).ok().map(|request| request.action);
        let delay = self.delay_for(action);

        match self.respond(payload)? {
            Outcome::Answer(bytes) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    slot.send_replace(bytes);
                });
            }
            Outcome::Stall => {}
            Outcome::Lost => {
                self.lose_link();
                return Err(SyncError::LinkLost);
            }
        }

        // Read whatever lands in the slot next, which is not necessarily
        // the answer to this write.
        reader.changed().await.map_err(|_| SyncError::LinkLost)?;
        let value = reader.borrow_and_update().clone();
        Ok(value)
    }

    async fn request_large(
        &self,
        endpoint: Endpoint,
        payload: &[u8],
        max_chunk_payload: usize,
    ) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(SyncError::LinkLost);
        }
        let request = Request::decode(payload)?;
        self.shared.requests.fetch_add(1, Ordering::SeqCst);

        match self.take_failure() {
            Some(MockFailure::Stall) => std::future::pending::<()>().await,
            Some(MockFailure::LinkLost) => {
                self.lose_link();
                return Err(SyncError::LinkLost);
            }
            Some(MockFailure::Garbage) => return Err(SyncError::malformed("unknown frame tag 0x00")),
            Some(MockFailure::Reject(reason)) => return Err(SyncError::Rejected { reason }),
            None => {}
        }

        let frames = {
            let mut behaviour = lock(&self.shared.behaviour);
            let frames = match behaviour.scripted_frames.take() {
                Some(frames) => frames,
                None => {
                    let bytes = match (request.action, &request.attachment_id) {
                        (Action::GetAttachment, Some(id)) => lock(&self.shared.devices)
                            .get(&self.device_id)
                            .and_then(|device| device.attachments.get(id).cloned()),
                        _ => None,
                    };
                    let Some(bytes) = bytes else {
                        return Err(SyncError::Rejected {
                            reason: format!("no attachment on {} endpoint", endpoint),
                        });
                    };
                    split_into_frames(&bytes, behaviour.chunk_size, behaviour.length_hint)
                        .iter()
                        .map(|frame| frame.encode())
                        .collect()
                }
            };
            frames
        };
        self.shared.transfers.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_for(Some(request.action));
        tokio::time::sleep(delay).await;

        let mut assembler = ChunkAssembler::new(max_chunk_payload);
        for frame in frames {
            if self.is_closed() {
                return Err(SyncError::LinkLost);
            }
            if let Some(payload) = assembler.push_bytes(&frame)? {
                return Ok(payload);
            }
            tokio::task::yield_now().await;
        }

        // A quiet stream is not a finished one; wait for the caller's timeout.
        std::future::pending::<()>().await;
        Err(SyncError::LinkLost)
    }

    async fn subscribe(&self, endpoint: Endpoint) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        if endpoint != Endpoint::Notifications {
            return Err(SyncError::unsupported(format!("push on {} endpoint", endpoint)));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(sender);
        Ok(receiver)
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        let mut active = lock(&self.shared.active);
        if active
            .as_ref()
            .is_some_and(|active| std::ptr::eq(active.channel.as_ref(), self))
        {
            *active = None;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Demo Fixtures
// ----------------------------------------------------------------------------

fn wire_message(
    id: &str,
    conversation: &str,
    sender: &str,
    text: &str,
    minutes_ago: u64,
) -> WireMessage {
    let now = Timestamp::now().as_millis();
    WireMessage {
        id: MessageId::from(id),
        conversation_id: Some(ConversationId::from(conversation)),
        sender: sender.to_string(),
        text: Some(text.to_string()),
        timestamp: now.saturating_sub(minutes_ago * 60_000),
        attachments: Vec::new(),
        is_from_me: None,
        status: None,
    }
}

fn wire_conversation(
    id: &str,
    participants: &[&str],
    display_name: &str,
    unread_count: u32,
    last_message: WireMessage,
) -> WireConversation {
    WireConversation {
        id: ConversationId::from(id),
        participants: participants.iter().map(|p| p.to_string()).collect(),
        display_name: Some(display_name.to_string()),
        is_group: participants.len() > 1,
        unread_count,
        last_message: Some(last_message),
        avatar: None,
    }
}

/// "Alex's Phone" with four conversations and one photo
pub fn demo_device() -> MockDevice {
    let mom = "+1 (555) 123-4567";
    let conv_1 = ConversationId::from("conv-1");
    let mut photo_message = wire_message(
        "msg-1-4",
        "conv-1",
        mom,
        "That's wonderful! I sent you some photos from the trip.",
        10,
    );
    photo_message.attachments.push(WireAttachment {
        id: AttachmentId::from("att-1"),
        mime_type: "image/jpeg".to_string(),
        filename: "beach_sunset.jpg".to_string(),
        size: 2048,
        thumbnail: None,
    });
    let last = wire_message("msg-1-5", "conv-1", mom, "Did you see the photos I sent?", 5);

    MockDevice::new("dev-42", "Alex's Phone")
        .with_conversation(wire_conversation("conv-1", &[mom], "Mom", 2, last.clone()))
        .with_conversation(wire_conversation(
            "conv-2",
            &["+1 (555) 234-5678", "+1 (555) 345-6789", "+1 (555) 456-7890"],
            "Family Group",
            0,
            wire_message("msg-2-3", "conv-2", "+1 (555) 234-5678", "See everyone Sunday!", 120),
        ))
        .with_conversation(wire_conversation(
            "conv-3",
            &["+1 (555) 567-8901"],
            "John",
            0,
            wire_message("msg-3-2", "conv-3", "me", "Sounds good!", 1440),
        ))
        .with_conversation(wire_conversation(
            "conv-4",
            &["+1 (555) 678-9012", "+1 (555) 789-0123"],
            "Work Team",
            5,
            wire_message("msg-4-10", "conv-4", "+1 (555) 678-9012", "Meeting moved to 3pm", 30),
        ))
        .with_message(&conv_1, wire_message("msg-1-1", "conv-1", "me", "Hey Mom!", 60))
        .with_message(&conv_1, wire_message("msg-1-2", "conv-1", mom, "Hi sweetie! How are you?", 55))
        .with_message(
            &conv_1,
            wire_message("msg-1-3", "conv-1", "me", "I'm doing great! Just finished work.", 50),
        )
        .with_message(&conv_1, photo_message)
        .with_message(&conv_1, last)
        .with_attachment("att-1", (0..2048u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}
