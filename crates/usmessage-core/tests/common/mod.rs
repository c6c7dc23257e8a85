//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use usmessage_core::events::{Subscription, SyncEvent};
use usmessage_core::transport::{Channel, MockTransport, RequestPipe, Transport};
use usmessage_core::{ConnectionMachine, DeviceId, EventBus, SyncConfig, SyncContext};

pub const PHONE: &str = "dev-42";

/// Test configuration with a private attachment directory and short timeouts
pub fn test_config(dir: &TempDir) -> SyncConfig {
    SyncConfig::default()
        .with_attachment_dir(dir.path().join("attachments"))
        .with_request_timeout(Duration::from_millis(300))
        .with_connect_timeout(Duration::from_millis(300))
        .with_scan_timeout(Duration::from_millis(20))
}

/// Context over a demo mock, not yet connected
pub fn demo_context() -> (SyncContext, MockTransport, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::demo();
    let context = SyncContext::builder()
        .with_config(test_config(&dir))
        .with_transport(Arc::new(transport.clone()))
        .build();
    (context, transport, dir)
}

/// Context over a demo mock, connected to the phone
pub async fn connected_context() -> (SyncContext, MockTransport, TempDir) {
    let (context, transport, dir) = demo_context();
    context.scan().await.unwrap();
    context.connect(&DeviceId::from(PHONE)).await.unwrap();
    (context, transport, dir)
}

/// A bare machine and pipe connected to the demo phone
pub async fn connected_pipe(
    transport: &MockTransport,
    timeout: Duration,
) -> (Arc<ConnectionMachine>, RequestPipe, EventBus) {
    let events = EventBus::new();
    let machine = ConnectionMachine::new(events.clone());
    let phone = DeviceId::from(PHONE);

    let monitor = machine.begin_connect(&phone).unwrap();
    let generation = monitor.generation();
    let channel: Arc<dyn Channel> = transport.open(&phone, monitor).await.unwrap();
    let device = channel.device();
    machine.complete_connect(generation, device, channel).unwrap();

    let pipe = RequestPipe::new(machine.clone(), timeout);
    (machine, pipe, events)
}

/// Drain everything already delivered to `subscription`
pub fn drain(subscription: &mut Subscription) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

/// Next event within a second, failing the test otherwise
pub async fn next_event(subscription: &mut Subscription) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Poll `condition` until it holds or a second passes
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
