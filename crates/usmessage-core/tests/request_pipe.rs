//! Request/response exchanges over characteristic-style endpoints

use std::sync::Arc;
use std::time::Duration;

use usmessage_core::protocol::{
    Action, ConversationsPayload, MessagesPayload, Request, Response,
};
use usmessage_core::transport::{Channel, Endpoint, MockFailure, MockTransport, Transport};
use usmessage_core::{ConnectionState, ConversationId, DeviceId, EventKind, LinkMonitor, SyncError};

mod common;
use common::{connected_pipe, drain, PHONE};

fn conv_1() -> ConversationId {
    ConversationId::from("conv-1")
}

// ----------------------------------------------------------------------------
// Attribution
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unserialized_overlap_reads_the_wrong_response() {
    let transport = MockTransport::demo();
    transport.set_action_delay(Action::GetConversations, Duration::from_millis(100));
    let channel: Arc<dyn Channel> = transport
        .open(&DeviceId::from(PHONE), LinkMonitor::detached())
        .await
        .unwrap();

    let slow = Request::get_conversations().encode().unwrap();
    let fast = Request::get_messages(&conv_1()).encode().unwrap();

    let (first, second) = tokio::join!(channel.request(Endpoint::Messages, &slow), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.request(Endpoint::Messages, &fast).await
    });

    // The conversations caller picks up the messages answer
    let first = Response::decode(&first.unwrap()).unwrap();
    assert!(first.into_data::<MessagesPayload>().is_ok());
    let second = Response::decode(&second.unwrap()).unwrap();
    assert!(second.into_data::<MessagesPayload>().is_ok());
}

#[tokio::test]
async fn test_pipe_attributes_overlapping_requests_correctly() {
    let transport = MockTransport::demo();
    transport.set_action_delay(Action::GetConversations, Duration::from_millis(100));
    let (_machine, pipe, _events) = connected_pipe(&transport, Duration::from_secs(1)).await;

    let get_conversations = Request::get_conversations();
    let (conversations, messages) = tokio::join!(
        pipe.request(Endpoint::Messages, &get_conversations),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pipe.request(Endpoint::Messages, &Request::get_messages(&conv_1()))
                .await
        }
    );

    let conversations = conversations
        .unwrap()
        .into_data::<ConversationsPayload>()
        .unwrap();
    assert_eq!(conversations.conversations.len(), 4);

    let messages = messages.unwrap().into_data::<MessagesPayload>().unwrap();
    assert_eq!(messages.messages.len(), 5);
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn test_endpoints_do_not_block_each_other() {
    let transport = MockTransport::demo();
    transport.set_action_delay(Action::GetConversations, Duration::from_millis(200));
    let (_machine, pipe, _events) = connected_pipe(&transport, Duration::from_secs(1)).await;

    let get_conversations = Request::get_conversations();
    let slow = pipe.request(Endpoint::Messages, &get_conversations);
    let other = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = tokio::time::Instant::now();
        let result = pipe
            .request(Endpoint::Notifications, &Request::get_messages(&conv_1()))
            .await;
        (result, started.elapsed())
    };

    let (slow, (other, elapsed)) = tokio::join!(slow, other);
    assert!(slow.is_ok());
    assert!(other.is_ok());
    assert!(elapsed < Duration::from_millis(150));
}

// ----------------------------------------------------------------------------
// Timeouts and Link Loss
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_releases_the_endpoint() {
    let transport = MockTransport::demo();
    let (machine, pipe, _events) = connected_pipe(&transport, Duration::from_millis(50)).await;
    transport.fail_next(MockFailure::Stall);

    let get_conversations = Request::get_conversations();
    let (stalled, queued) = tokio::join!(
        pipe.request(Endpoint::Messages, &get_conversations),
        pipe.request(Endpoint::Messages, &get_conversations)
    );

    assert!(matches!(stalled, Err(SyncError::Timeout { duration_ms: 50 })));
    assert!(queued.unwrap().into_data::<ConversationsPayload>().is_ok());
    assert!(machine.is_connected());
}

#[tokio::test]
async fn test_link_loss_mid_exchange_fails_fast() {
    let transport = MockTransport::demo();
    transport.set_action_delay(Action::GetConversations, Duration::from_secs(5));
    let (machine, pipe, events) = connected_pipe(&transport, Duration::from_secs(10)).await;
    let mut disconnects = events.subscribe([EventKind::DeviceDisconnected]);

    let get_conversations = Request::get_conversations();
    let request = pipe.request(Endpoint::Messages, &get_conversations);
    let dropper = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.drop_link();
    };

    let started = tokio::time::Instant::now();
    let (result, ()) = tokio::join!(request, dropper);

    assert!(matches!(result, Err(SyncError::LinkLost)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(machine.state(), ConnectionState::Disconnected);
    assert_eq!(drain(&mut disconnects).len(), 1);
}

#[tokio::test]
async fn test_device_dropping_link_reports_loss_once() {
    let transport = MockTransport::demo();
    let (machine, pipe, events) = connected_pipe(&transport, Duration::from_secs(1)).await;
    let mut disconnects = events.subscribe([EventKind::DeviceDisconnected]);
    transport.fail_next(MockFailure::LinkLost);

    let result = pipe
        .request(Endpoint::Messages, &Request::get_conversations())
        .await;
    assert!(matches!(result, Err(SyncError::LinkLost)));
    assert_eq!(machine.state(), ConnectionState::Disconnected);

    let next = pipe
        .request(Endpoint::Messages, &Request::get_conversations())
        .await;
    assert!(matches!(next, Err(SyncError::NotConnected)));
    assert_eq!(drain(&mut disconnects).len(), 1);
}

#[tokio::test]
async fn test_garbage_response_is_malformed() {
    let transport = MockTransport::demo();
    let (machine, pipe, _events) = connected_pipe(&transport, Duration::from_secs(1)).await;
    transport.fail_next(MockFailure::Garbage);

    let result = pipe
        .request(Endpoint::Messages, &Request::get_conversations())
        .await;
    assert!(matches!(result, Err(SyncError::MalformedTransfer { .. })));
    assert!(machine.is_connected());
}

#[tokio::test]
async fn test_device_rejection_surfaces_reason() {
    let transport = MockTransport::demo();
    let (_machine, pipe, _events) = connected_pipe(&transport, Duration::from_secs(1)).await;
    transport.fail_next(MockFailure::Reject("database locked".into()));

    let response = pipe
        .request(Endpoint::Messages, &Request::get_conversations())
        .await
        .unwrap();
    match response.into_data::<ConversationsPayload>() {
        Err(SyncError::Rejected { reason }) => assert_eq!(reason, "database locked"),
        other => panic!("unexpected outcome {:?}", other),
    }
}
