//! Cache behaviour: degraded reads, optimistic sends, attachments, pushes

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use usmessage_core::cache::{ConversationStore, MessageArena, SnapshotSource};
use usmessage_core::protocol::{Action, Push, WireMessage};
use usmessage_core::transport::MockFailure;
use usmessage_core::{
    AttachmentId, AttachmentKind, Conversation, ConversationId, DeliveryStatus, DeviceId,
    EventKind, Message, MessageId, SyncError, SyncEvent, Timestamp,
};

mod common;
use common::{connected_context, demo_context, drain, next_event, PHONE};

fn conv_1() -> ConversationId {
    ConversationId::from("conv-1")
}

fn incoming(id: &str, text: &str) -> WireMessage {
    WireMessage {
        id: MessageId::from(id),
        conversation_id: Some(conv_1()),
        sender: "+1 (555) 123-4567".to_string(),
        text: Some(text.to_string()),
        timestamp: Timestamp::now().as_millis(),
        attachments: Vec::new(),
        is_from_me: None,
        status: None,
    }
}

// ----------------------------------------------------------------------------
// Reads
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_fetch_conversations_from_device() {
    let (context, _transport, _dir) = connected_context().await;
    let mut updates = context.subscribe([EventKind::ConversationsUpdated]);

    let snapshot = context.fetch_conversations().await;
    assert_eq!(snapshot.source, SnapshotSource::Device);
    let names: Vec<_> = snapshot.items.iter().map(|c| c.display_name.as_str()).collect();
    assert_eq!(names, vec!["Mom", "Family Group", "John", "Work Team"]);

    let family = &snapshot.items[1];
    assert!(family.is_group);
    assert_eq!(family.participants.len(), 3);
    assert_eq!(snapshot.items[0].unread_count, 2);
    assert_eq!(
        snapshot.items[0].last_message.as_ref().map(|m| m.preview()),
        Some("Did you see the photos I sent?".to_string())
    );

    assert!(matches!(
        next_event(&mut updates).await,
        SyncEvent::ConversationsUpdated(list) if list.len() == 4
    ));
}

#[tokio::test]
async fn test_reads_degrade_to_cached_copy() {
    let (context, transport, _dir) = connected_context().await;
    let fresh = context.fetch_conversations().await;
    assert!(!fresh.is_stale());

    transport.fail_next(MockFailure::Reject("database locked".into()));
    let stale = context.fetch_conversations().await;
    assert!(stale.is_stale());
    assert_eq!(stale.items, fresh.items);
    match &stale.source {
        SnapshotSource::StaleCache { error } => assert!(error.contains("database locked")),
        other => panic!("unexpected source {:?}", other),
    }

    transport.fail_next(MockFailure::Garbage);
    assert!(context.fetch_messages(&conv_1()).await.is_stale());

    context.disconnect().await.unwrap();
    let offline = context.fetch_conversations().await;
    assert_eq!(offline.source, SnapshotSource::Cache);
    assert_eq!(offline.items.len(), 4);
}

#[tokio::test]
async fn test_messages_for_unknown_conversation_are_stale_and_empty() {
    let (context, _transport, _dir) = connected_context().await;

    let snapshot = context
        .fetch_messages(&ConversationId::from("conv-404"))
        .await;
    assert!(snapshot.is_stale());
    assert!(snapshot.items.is_empty());
}

#[tokio::test]
async fn test_fetch_messages_orders_thread() {
    let (context, _transport, _dir) = connected_context().await;

    let snapshot = context.fetch_messages(&conv_1()).await;
    let ids: Vec<_> = snapshot.items.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["msg-1-1", "msg-1-2", "msg-1-3", "msg-1-4", "msg-1-5"]);
    assert!(snapshot.items[0].is_from_me);
    assert!(!snapshot.items[1].is_from_me);
    assert!(snapshot.items[3].has_attachments());
    assert_eq!(snapshot.items[3].attachments[0].kind, AttachmentKind::Image);
}

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_send_while_disconnected_leaves_cache_untouched() {
    let (context, _transport, _dir) = demo_context();

    let result = context.send_message(&conv_1(), "hello", &[]).await;
    assert!(matches!(result, Err(SyncError::NotConnected)));
    assert!(context.cache().messages(&conv_1()).is_empty());
}

#[tokio::test]
async fn test_send_is_visible_before_the_device_answers() {
    let (context, transport, _dir) = connected_context().await;
    transport.set_action_delay(Action::SendMessage, Duration::from_millis(100));
    let mut updates = context.subscribe([EventKind::MessageAdded, EventKind::MessageUpdated]);

    let observe = async {
        let SyncEvent::MessageAdded(pending) = next_event(&mut updates).await else {
            panic!("expected the pending message first");
        };
        assert_eq!(pending.status, DeliveryStatus::Sending);
        let cached = context.cache().message(&pending.id).unwrap();
        assert_eq!(cached.status, DeliveryStatus::Sending);
        pending.id
    };
    let conv = conv_1();
    let (sent, pending_id) = tokio::join!(context.send_message(&conv, "hello", &[]), observe);

    let sent = sent.unwrap();
    assert_eq!(sent.id, pending_id);
    assert!(sent.id.is_temporary());
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert!(sent.is_from_me);
    assert_eq!(sent.text.as_deref(), Some("hello"));

    match next_event(&mut updates).await {
        SyncEvent::MessageUpdated(message) => {
            assert_eq!(message.id, pending_id);
            assert_eq!(message.status, DeliveryStatus::Sent);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let thread = context.cache().messages(&conv_1());
    assert_eq!(thread.iter().filter(|m| m.id == pending_id).count(), 1);
}

#[tokio::test]
async fn test_failed_send_stays_in_cache() {
    let (context, transport, _dir) = connected_context().await;
    transport.fail_next(MockFailure::Reject("recipient unreachable".into()));

    let result = context.send_message(&conv_1(), "are you there?", &[]).await;
    assert!(matches!(result, Err(SyncError::Rejected { .. })));

    let thread = context.cache().messages(&conv_1());
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].status, DeliveryStatus::Failed);

    // A later sync keeps the failed send visible after the device's copy
    let synced = context.fetch_messages(&conv_1()).await;
    assert_eq!(synced.items.len(), 6);
    assert_eq!(synced.items[5].id, thread[0].id);
    assert_eq!(synced.items[5].status, DeliveryStatus::Failed);
}

#[tokio::test]
async fn test_timed_out_send_is_marked_failed() {
    let (context, transport, _dir) = connected_context().await;
    transport.fail_next(MockFailure::Stall);

    let result = context.send_message(&conv_1(), "hello?", &[]).await;
    assert!(matches!(result, Err(SyncError::Timeout { .. })));
    assert_eq!(
        context.cache().messages(&conv_1())[0].status,
        DeliveryStatus::Failed
    );
}

#[tokio::test]
async fn test_canonical_id_is_recorded_without_changing_local_id() {
    let (context, transport, _dir) = connected_context().await;
    transport.set_canonical_ids(true);

    let sent = context.send_message(&conv_1(), "hello", &[]).await.unwrap();
    assert!(sent.id.is_temporary());
    assert_eq!(sent.remote_id.as_deref(), Some("msg-conv-1-1"));

    let synced = context.fetch_messages(&conv_1()).await;
    let mine: Vec<_> = synced.items.iter().filter(|m| m.text.as_deref() == Some("hello")).collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, sent.id);
    assert_eq!(mine[0].remote_id.as_deref(), Some("msg-conv-1-1"));
}

#[tokio::test]
async fn test_send_updates_conversation_preview() {
    let (context, _transport, _dir) = connected_context().await;
    context.fetch_conversations().await;

    context.send_message(&conv_1(), "On my way", &[]).await.unwrap();
    let mom = context
        .cache()
        .conversations()
        .into_iter()
        .find(|c| c.id == conv_1())
        .unwrap();
    assert_eq!(mom.last_message.map(|m| m.preview()).as_deref(), Some("On my way"));
}

#[tokio::test]
async fn test_send_with_attachment() {
    let (context, transport, dir) = connected_context().await;
    transport.set_canonical_ids(true);
    let photo = dir.path().join("sunrise.jpg");
    std::fs::write(&photo, b"not really a jpeg").unwrap();

    let sent = context
        .send_message(&conv_1(), "", &[photo.clone()])
        .await
        .unwrap();
    assert_eq!(sent.text, None);
    assert_eq!(sent.preview(), "Sent an attachment");
    assert_eq!(sent.attachments.len(), 1);
    let attachment = &sent.attachments[0];
    assert_eq!(attachment.kind, AttachmentKind::Image);
    assert_eq!(attachment.mime_type, "image/jpeg");
    assert_eq!(attachment.filename, "sunrise.jpg");
    assert_eq!(attachment.size, 17);
    assert_eq!(attachment.local_path.as_deref(), Some(photo.as_path()));

    let device = transport.device(&DeviceId::from(PHONE)).unwrap();
    assert_eq!(
        device.attachments.get(&AttachmentId::from("msg-conv-1-1-att-0")),
        Some(&b"not really a jpeg".to_vec())
    );
}

#[tokio::test]
async fn test_unreadable_attachment_rejects_before_sending() {
    let (context, transport, dir) = connected_context().await;
    let before = transport.request_count();

    let result = context
        .send_message(&conv_1(), "look", &[dir.path().join("missing.png")])
        .await;
    assert!(matches!(result, Err(SyncError::InvalidAttachment { .. })));
    assert!(context.cache().messages(&conv_1()).is_empty());
    assert_eq!(transport.request_count(), before);
}

// ----------------------------------------------------------------------------
// Attachments
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_download_is_idempotent_and_backfills_path() {
    let (context, transport, _dir) = connected_context().await;
    context.fetch_messages(&conv_1()).await;
    let id = AttachmentId::from("att-1");

    let (first, second) = tokio::join!(
        context.download_attachment(&id),
        context.download_attachment(&id)
    );
    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(transport.transfer_count(), 1);
    assert_eq!(std::fs::read(&first).unwrap().len(), 2048);

    let again = context.download_attachment(&id).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(transport.transfer_count(), 1);

    let photo_message = context
        .cache()
        .message(&MessageId::from("msg-1-4"))
        .unwrap();
    assert_eq!(
        photo_message.attachments[0].local_path.as_deref(),
        Some(first.as_path())
    );

    // Served from disk once the device is gone
    context.disconnect().await.unwrap();
    assert_eq!(context.download_attachment(&id).await.unwrap(), first);
}

#[tokio::test]
async fn test_download_while_disconnected_needs_a_link() {
    let (context, _transport, _dir) = demo_context();

    let result = context.download_attachment(&AttachmentId::from("att-1")).await;
    assert!(matches!(result, Err(SyncError::NotConnected)));
}

#[tokio::test]
async fn test_resync_keeps_downloaded_path() {
    let (context, _transport, _dir) = connected_context().await;
    context.fetch_messages(&conv_1()).await;
    let path = context
        .download_attachment(&AttachmentId::from("att-1"))
        .await
        .unwrap();

    let synced = context.fetch_messages(&conv_1()).await;
    assert_eq!(
        synced.items[3].attachments[0].local_path.as_deref(),
        Some(path.as_path())
    );
}

// ----------------------------------------------------------------------------
// Device Pushes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_pushed_message_is_added_and_counted() {
    let (context, transport, _dir) = connected_context().await;
    context.fetch_conversations().await;
    let mut added = context.subscribe([EventKind::MessageAdded]);

    transport
        .push(&Push::MessageReceived {
            message: incoming("msg-1-6", "Call me when you can"),
        })
        .unwrap();

    let SyncEvent::MessageAdded(message) = next_event(&mut added).await else {
        panic!("expected a new message");
    };
    assert_eq!(message.id.as_str(), "msg-1-6");
    assert!(!message.is_from_me);
    let notification = SyncEvent::MessageAdded(message).notification().unwrap();
    assert_eq!(notification.title, "+1 (555) 123-4567");
    assert_eq!(notification.body, "Call me when you can");

    let mom = context
        .cache()
        .conversations()
        .into_iter()
        .find(|c| c.id == conv_1())
        .unwrap();
    assert_eq!(mom.unread_count, 3);
    assert_eq!(
        mom.last_message.map(|m| m.id),
        Some(MessageId::from("msg-1-6"))
    );
}

#[tokio::test]
async fn test_malformed_push_is_dropped() {
    let (context, transport, _dir) = connected_context().await;
    let mut added = context.subscribe([EventKind::MessageAdded]);

    transport.push_raw(b"{not a push".to_vec());
    transport
        .push(&Push::MessageReceived {
            message: incoming("msg-1-7", "still here"),
        })
        .unwrap();

    let SyncEvent::MessageAdded(message) = next_event(&mut added).await else {
        panic!("expected a new message");
    };
    assert_eq!(message.id.as_str(), "msg-1-7");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut added).is_empty());
}

#[tokio::test]
async fn test_status_push_resolves_canonical_id() {
    let (context, transport, _dir) = connected_context().await;
    transport.set_canonical_ids(true);
    let sent = context.send_message(&conv_1(), "hello", &[]).await.unwrap();
    let mut updated = context.subscribe([EventKind::MessageUpdated]);

    transport
        .push(&Push::MessageStatus {
            message_id: MessageId::from("msg-conv-1-1"),
            status: DeliveryStatus::Read,
        })
        .unwrap();

    let SyncEvent::MessageUpdated(message) = next_event(&mut updated).await else {
        panic!("expected a status update");
    };
    assert_eq!(message.id, sent.id);
    assert_eq!(message.status, DeliveryStatus::Read);
}

#[tokio::test]
async fn test_pushed_echo_of_own_send_merges_by_canonical_id() {
    let (context, transport, _dir) = connected_context().await;
    transport.set_canonical_ids(true);
    let sent = context.send_message(&conv_1(), "hello", &[]).await.unwrap();
    assert_eq!(sent.remote_id.as_deref(), Some("msg-conv-1-1"));
    let mut events = context.subscribe([EventKind::MessageAdded, EventKind::MessageUpdated]);

    let mut echo = incoming("msg-conv-1-1", "hello");
    echo.sender = "me".to_string();
    echo.is_from_me = Some(true);
    echo.status = Some(DeliveryStatus::Delivered);
    transport.push(&Push::MessageReceived { message: echo }).unwrap();

    let SyncEvent::MessageUpdated(message) = next_event(&mut events).await else {
        panic!("expected the local record to be updated");
    };
    assert_eq!(message.id, sent.id);
    assert_eq!(message.remote_id.as_deref(), Some("msg-conv-1-1"));
    assert_eq!(message.status, DeliveryStatus::Delivered);

    let hellos: Vec<MessageId> = context
        .cache()
        .messages(&conv_1())
        .into_iter()
        .filter(|message| message.text.as_deref() == Some("hello"))
        .map(|message| message.id)
        .collect();
    assert_eq!(hellos, vec![sent.id]);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_pushes_stop_after_disconnect() {
    let (context, transport, _dir) = connected_context().await;
    context.disconnect().await.unwrap();
    let mut added = context.subscribe([EventKind::MessageAdded]);

    transport.push_raw(
        Push::MessageReceived {
            message: incoming("msg-1-8", "anyone?"),
        }
        .encode()
        .unwrap(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut added).is_empty());
    assert!(context.cache().message(&MessageId::from("msg-1-8")).is_none());
}

// ----------------------------------------------------------------------------
// Store Properties
// ----------------------------------------------------------------------------

fn conversation(id: u8, name: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(format!("conv-{}", id)),
        participants: vec![name.to_string()],
        display_name: name.to_string(),
        is_group: false,
        unread_count: 0,
        last_message: None,
        avatar: None,
    }
}

fn message(id: u8, text: &str) -> Message {
    Message {
        id: MessageId::new(format!("msg-{}", id)),
        conversation_id: conv_1(),
        sender: "me".to_string(),
        text: Some(text.to_string()),
        attachments: Vec::new(),
        timestamp: Timestamp::from_millis(u64::from(id)),
        is_from_me: true,
        status: DeliveryStatus::Delivered,
        remote_id: None,
    }
}

proptest! {
    /// Merging batches never duplicates an id and the last write wins
    #[test]
    fn prop_conversation_merge_is_by_id(
        batches in prop::collection::vec(
            prop::collection::vec((0u8..8, "[a-z]{1,8}"), 0..6),
            0..6,
        ),
    ) {
        let mut store = ConversationStore::new();
        let mut latest = HashMap::new();
        for batch in &batches {
            store.merge(batch.iter().map(|(id, name)| conversation(*id, name)));
            for (id, name) in batch {
                latest.insert(*id, name.clone());
            }
        }

        let list = store.list();
        prop_assert_eq!(list.len(), latest.len());
        for entry in list {
            let id: u8 = entry.id.as_str()["conv-".len()..].parse().unwrap();
            prop_assert_eq!(Some(&entry.display_name), latest.get(&id));
        }
    }

    /// Appending a known id replaces it in place
    #[test]
    fn prop_message_append_is_by_id(
        writes in prop::collection::vec((0u8..8, "[a-z]{1,8}"), 0..32),
    ) {
        let mut arena = MessageArena::new();
        let mut latest = HashMap::new();
        for (id, text) in &writes {
            arena.append(message(*id, text));
            latest.insert(*id, text.clone());
        }

        let thread = arena.thread(&conv_1());
        prop_assert_eq!(thread.len(), latest.len());
        for entry in thread {
            let id: u8 = entry.id.as_str()["msg-".len()..].parse().unwrap();
            prop_assert_eq!(entry.text.as_ref(), latest.get(&id));
        }
    }
}
