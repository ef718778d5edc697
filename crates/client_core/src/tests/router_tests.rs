use tokio::sync::mpsc;

use super::*;
use crate::test_support::{
    direct, direct_event, notification, viewer_extractor, wait_until, FakeTransport, FAKE_TRANSPORT_CAPACITY, ME,
    OTHER_PEER, PEER,
};

fn recording_callback() -> (EventCallback, mpsc::UnboundedReceiver<RoutedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

async fn connected_router() -> (Arc<FakeTransport>, Arc<LiveEventRouter>) {
    let transport = FakeTransport::new();
    let router = LiveEventRouter::new(transport.clone(), Duration::from_secs(1));
    router.connect("token").await.expect("connect");
    (transport, router)
}

#[tokio::test]
async fn connect_waits_for_connected_and_starts_an_epoch() {
    let (transport, router) = connected_router().await;

    assert_eq!(router.status(), TransportState::Connected);
    assert_eq!(router.epoch(), 1);

    router.connect("token").await.expect("second connect");
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn unreachable_transport_reports_transport_unavailable() {
    let transport = FakeTransport::unreachable();
    let router = LiveEventRouter::new(transport.clone(), Duration::from_secs(1));

    let err = router.connect("token").await.expect_err("must fail");
    assert!(matches!(err, SyncError::TransportUnavailable { .. }), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn membership_requests_require_a_connection() {
    let transport = FakeTransport::new();
    let router = LiveEventRouter::new(transport.clone(), Duration::from_secs(1));

    let err = router.join(ChannelKey::Direct(PEER)).await.expect_err("offline");
    assert!(matches!(err, SyncError::TransportUnavailable { .. }));
    assert!(transport.invoked().await.is_empty());
}

#[tokio::test]
async fn channel_handlers_only_see_their_channel() {
    let (_transport, router) = connected_router().await;
    let (callback, mut routed) = recording_callback();
    let handler = router
        .register_handler(
            ServerEventKind::ReceiveMessage,
            HandlerScope::Channel(ChannelKey::Direct(PEER)),
            Some(viewer_extractor(ME)),
            callback,
        )
        .await;

    assert_eq!(router.dispatch(direct_event(direct(1, PEER, ME, 1, "for us"))).await, 1);
    assert_eq!(
        router
            .dispatch(direct_event(direct(2, OTHER_PEER, ME, 2, "elsewhere")))
            .await,
        0
    );

    let event = routed.try_recv().expect("routed");
    assert_eq!(event.handler, handler);
    assert_eq!(event.channel, Some(ChannelKey::Direct(PEER)));
    assert!(routed.try_recv().is_err());
}

#[tokio::test]
async fn removed_handlers_receive_nothing() {
    let (_transport, router) = connected_router().await;
    let (callback, mut routed) = recording_callback();
    let handler = router
        .register_handler(
            ServerEventKind::ReceiveMessage,
            HandlerScope::Channel(ChannelKey::Direct(PEER)),
            Some(viewer_extractor(ME)),
            callback,
        )
        .await;

    assert!(router.remove_handler(handler).await);
    assert!(!router.remove_handler(handler).await);
    assert_eq!(router.dispatch(direct_event(direct(1, PEER, ME, 1, "gone"))).await, 0);
    assert!(routed.try_recv().is_err());
}

#[tokio::test]
async fn pushed_events_reach_session_handlers() {
    let (transport, router) = connected_router().await;
    let (callback, mut routed) = recording_callback();
    router
        .register_handler(
            ServerEventKind::ReceiveNotification,
            HandlerScope::Session,
            None,
            callback,
        )
        .await;

    transport.push(ServerEvent::ReceiveNotification {
        notification: notification(4, 1, false),
    });

    let event = tokio::time::timeout(Duration::from_secs(2), routed.recv())
        .await
        .expect("routed in time")
        .expect("routed");
    assert_eq!(event.channel, None);
    assert!(matches!(event.event, ServerEvent::ReceiveNotification { .. }));
}

#[tokio::test]
async fn transitions_are_reported_in_order_with_epochs() {
    let transport = FakeTransport::new();
    let router = LiveEventRouter::new(transport.clone(), Duration::from_secs(1));
    let (tx, mut transitions) = mpsc::unbounded_channel();
    router
        .on_transition(Arc::new(move |transition: LinkTransition| {
            let _ = tx.send(transition);
        }))
        .await;

    router.connect("token").await.expect("connect");
    transport.emit_state(TransportState::Reconnecting);
    transport.emit_state(TransportState::Connected);
    wait_until!(router.epoch() == 2);

    let mut seen = Vec::new();
    for _ in 0..4 {
        let transition = tokio::time::timeout(Duration::from_secs(2), transitions.recv())
            .await
            .expect("transition in time")
            .expect("transition");
        seen.push((transition.from, transition.to, transition.epoch));
    }
    assert_eq!(
        seen,
        vec![
            (TransportState::Disconnected, TransportState::Connecting, 0),
            (TransportState::Connecting, TransportState::Connected, 1),
            (TransportState::Connected, TransportState::Reconnecting, 1),
            (TransportState::Reconnecting, TransportState::Connected, 2),
        ]
    );
}

#[tokio::test]
async fn lag_reports_skipped_events_and_reconciles_status() {
    let (transport, router) = connected_router().await;
    let (tx, mut lags) = mpsc::unbounded_channel();
    router
        .on_lagged(Arc::new(move |skipped| {
            let _ = tx.send(skipped);
        }))
        .await;

    // The state change is the oldest frame, so the burst pushes it out.
    transport.emit_state(TransportState::Reconnecting);
    for id in 0..(FAKE_TRANSPORT_CAPACITY as i64 + 5) {
        transport.push(direct_event(direct(id, PEER, ME, id, "flood")));
    }

    let skipped = tokio::time::timeout(Duration::from_secs(2), lags.recv())
        .await
        .expect("lag in time")
        .expect("lag");
    assert_eq!(skipped, 6);
    assert_eq!(router.status(), TransportState::Reconnecting);
}

#[tokio::test]
async fn disconnect_closes_and_drops_handlers() {
    let (_transport, router) = connected_router().await;
    let (callback, _routed) = recording_callback();
    router
        .register_handler(ServerEventKind::Error, HandlerScope::Session, None, callback)
        .await;

    router.disconnect().await;

    assert_eq!(router.status(), TransportState::Closed);
    assert_eq!(router.handler_count().await, 0);
}
