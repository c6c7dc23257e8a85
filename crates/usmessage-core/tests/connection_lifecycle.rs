//! Connection lifecycle through the public context
//!
//! Covers discovery filtering, the connect/disconnect state sequence,
//! link loss and the error/reset path.

use std::time::Duration;

use usmessage_core::transport::{MockDevice, MockTransport};
use usmessage_core::{
    ConnectionState, ConversationId, DeliveryStatus, DeviceId, EventKind, SnapshotSource,
    SyncContext, SyncError, SyncEvent, TransportKind,
};

mod common;
use common::{connected_context, demo_context, drain, eventually, test_config, PHONE};

fn state_names(events: &[SyncEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::StateChanged(state) => Some(state.name()),
            _ => None,
        })
        .collect()
}

fn disconnect_count(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|event| event.kind() == EventKind::DeviceDisconnected)
        .count()
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scan_keeps_only_companion_devices() {
    let (context, transport, _dir) = demo_context();
    transport.add_device(MockDevice::new("dev-9", "Kitchen iPad"));
    transport.add_device(MockDevice::anonymous("dev-0"));

    let devices = context.scan().await.unwrap();
    let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();

    assert!(names.contains(&"Alex's Phone"));
    assert!(names.contains(&"Kitchen iPad"));
    assert!(!names.contains(&"Living Room TV"));
    assert!(!devices.iter().any(|d| d.id.as_str() == "dev-0"));
    assert_eq!(context.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_scan_emits_start_and_completion() {
    let (context, _transport, _dir) = demo_context();
    let mut events = context.subscribe([EventKind::ScanStarted, EventKind::ScanCompleted]);

    let devices = context.scan().await.unwrap();
    let seen = drain(&mut events);

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].kind(), EventKind::ScanStarted);
    match &seen[1] {
        SyncEvent::ScanCompleted(found) => assert_eq!(found, &devices),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_overlapping_scans_are_rejected() {
    let (context, _transport, _dir) = demo_context();

    let (first, second) = tokio::join!(context.scan(), context.scan());
    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::AlreadyScanning)));
    assert_eq!(context.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_scan_failure_without_results_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.fail_scan("adapter powered off");
    let context = SyncContext::builder()
        .with_config(test_config(&dir))
        .with_transport(std::sync::Arc::new(transport))
        .build();

    assert!(context.scan().await.is_err());
    assert_eq!(context.state(), ConnectionState::Disconnected);
}

// ----------------------------------------------------------------------------
// Connect and Disconnect
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_then_disconnect_sequence() {
    let (context, transport, _dir) = demo_context();
    let mut events = context.subscribe_all();

    let devices = context.scan().await.unwrap();
    let phone = devices
        .iter()
        .find(|d| d.name == "Alex's Phone")
        .cloned()
        .unwrap();

    let connected = context.connect(&phone.id).await.unwrap();
    assert!(connected.connected);
    assert_eq!(connected.transport, TransportKind::Bluetooth);
    assert!(context.state().is_connected());

    context.disconnect().await.unwrap();
    assert_eq!(context.state(), ConnectionState::Disconnected);

    // A later drop of the already-closed link must not announce again
    transport.drop_link();
    context.disconnect().await.unwrap();

    let seen = drain(&mut events);
    assert_eq!(
        state_names(&seen),
        vec!["Scanning", "Disconnected", "Connecting", "Connected", "Disconnected"]
    );
    assert_eq!(disconnect_count(&seen), 1);
    assert!(seen
        .iter()
        .any(|event| matches!(event, SyncEvent::DeviceConnected(d) if d.id == phone.id)));
}

#[tokio::test]
async fn test_status_follows_connection() {
    let (context, _transport, _dir) = connected_context().await;

    assert!(
        eventually(|| async { context.status().connected }).await,
        "status never reported connected"
    );
    assert_eq!(context.status().device_name.as_deref(), Some("Alex's Phone"));

    context.disconnect().await.unwrap();
    assert!(eventually(|| async { !context.status().connected }).await);
    assert_eq!(context.status().device_name, None);
}

#[tokio::test]
async fn test_second_connect_while_connecting_is_busy() {
    let (context, transport, _dir) = demo_context();
    transport.set_open_delay(Duration::from_millis(50));
    let phone = DeviceId::from(PHONE);

    let (first, second) = tokio::join!(context.connect(&phone), context.connect(&phone));
    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::Busy { .. })));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_scan_while_connected_is_busy() {
    let (context, _transport, _dir) = connected_context().await;

    assert!(matches!(context.scan().await, Err(SyncError::Busy { .. })));
    assert!(context.state().is_connected());
}

#[tokio::test]
async fn test_unregistered_transport_kind_is_unsupported() {
    let (context, _transport, _dir) = demo_context();

    let result = context
        .coordinator()
        .connect_via(TransportKind::Usb, &DeviceId::from(PHONE))
        .await;
    assert!(matches!(result, Err(SyncError::Unsupported { .. })));
    assert_eq!(context.state(), ConnectionState::Disconnected);
}

// ----------------------------------------------------------------------------
// Failure and Recovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_handshake_requires_reset() {
    let (context, transport, _dir) = demo_context();
    transport.fail_next_opens(1);
    let phone = DeviceId::from(PHONE);

    let failed = context.connect(&phone).await;
    assert!(matches!(failed, Err(SyncError::HandshakeFailed { .. })));
    assert!(matches!(context.state(), ConnectionState::Error(_)));

    let blocked = context.connect(&phone).await;
    assert!(matches!(blocked, Err(SyncError::InvalidTransition { .. })));

    context.reset().unwrap();
    assert_eq!(context.state(), ConnectionState::Disconnected);
    context.connect(&phone).await.unwrap();
    assert!(context.state().is_connected());
}

#[tokio::test]
async fn test_slow_open_times_out() {
    let (context, transport, _dir) = demo_context();
    transport.set_open_delay(Duration::from_secs(5));

    let result = context.connect(&DeviceId::from(PHONE)).await;
    assert!(matches!(result, Err(SyncError::HandshakeFailed { .. })));
    assert!(matches!(context.state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn test_unknown_device_fails_handshake() {
    let (context, _transport, _dir) = demo_context();

    let result = context.connect(&DeviceId::from("dev-404")).await;
    assert!(matches!(result, Err(SyncError::HandshakeFailed { .. })));
}

#[tokio::test]
async fn test_link_loss_disconnects_exactly_once() {
    let (context, transport, _dir) = connected_context().await;
    let mut events = context.subscribe([EventKind::StateChanged, EventKind::DeviceDisconnected]);

    transport.drop_link();
    transport.drop_link();
    context.disconnect().await.unwrap();

    assert_eq!(context.state(), ConnectionState::Disconnected);
    let seen = drain(&mut events);
    assert_eq!(disconnect_count(&seen), 1);
    assert_eq!(state_names(&seen), vec!["Disconnected"]);

    // The link can be re-established afterwards
    context.connect(&DeviceId::from(PHONE)).await.unwrap();
    assert!(context.state().is_connected());
}

#[tokio::test]
async fn test_listener_sees_events_in_order() {
    let (context, _transport, _dir) = demo_context();
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let _handle = context.listen([EventKind::StateChanged], move |event| {
        if let SyncEvent::StateChanged(state) = event {
            let _ = sender.send(state.name());
        }
    });

    context.scan().await.unwrap();
    context.connect(&DeviceId::from(PHONE)).await.unwrap();

    let mut names = Vec::new();
    while names.len() < 4 {
        let name = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        names.push(name);
    }
    assert_eq!(names, vec!["Scanning", "Disconnected", "Connecting", "Connected"]);
}

// ----------------------------------------------------------------------------
// End to End
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_demo_scenario_end_to_end() {
    let (context, _transport, _dir) = demo_context();
    let mut events = context.subscribe_all();

    let devices = context.scan().await.unwrap();
    let phone = devices
        .iter()
        .find(|device| device.id.as_str() == PHONE)
        .expect("demo phone listed");
    let connected = context.connect(&phone.id).await.unwrap();
    assert_eq!(connected.name, "Alex's Phone");
    assert!(context.status().connected);

    let conversations = context.fetch_conversations().await;
    assert_eq!(conversations.source, SnapshotSource::Device);
    let conv_1 = ConversationId::from("conv-1");
    assert!(conversations.items.iter().any(|c| c.id == conv_1));

    let sent = context.send_message(&conv_1, "hello", &[]).await.unwrap();
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.text.as_deref(), Some("hello"));

    context.disconnect().await.unwrap();
    assert_eq!(context.state(), ConnectionState::Disconnected);
    assert!(!context.status().connected);

    let seen = drain(&mut events);
    assert_eq!(disconnect_count(&seen), 1);
    assert_eq!(
        state_names(&seen),
        vec!["Scanning", "Disconnected", "Connecting", "Connected", "Disconnected"]
    );
    assert!(seen
        .iter()
        .any(|event| matches!(event, SyncEvent::ConversationsUpdated(_))));
    assert!(seen.iter().any(|event| matches!(
        event,
        SyncEvent::MessageUpdated(m) if m.id == sent.id && m.status == DeliveryStatus::Sent
    )));

    let offline = context.fetch_messages(&conv_1).await;
    assert_eq!(offline.source, SnapshotSource::Cache);
    assert!(offline.items.iter().any(|m| m.id == sent.id));
}
