use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use shared::domain::ChannelKey;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{direct, wait_until, ME, PEER};

#[derive(Clone)]
struct HubState {
    requests: mpsc::UnboundedSender<String>,
    tokens: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    drop_first_connection: bool,
}

async fn hub_handler(
    State(state): State<HubState>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.get("access_token").cloned();
    ws.on_upgrade(move |socket| serve_hub(socket, state, token))
}

async fn serve_hub(mut socket: WebSocket, state: HubState, token: Option<String>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(token) = token {
        state.tokens.lock().await.push(token);
    }
    if state.drop_first_connection && connection == 1 {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let _ = state.requests.send(text.clone());
        if let Ok(ClientRequest::JoinDirect { peer_id }) = serde_json::from_str(&text) {
            let event = ServerEvent::ReceiveMessage {
                message: direct(40, peer_id, ME, 40, "welcome back"),
            };
            let frame = serde_json::to_string(&event).expect("encode event");
            let _ = socket.send(WsMessage::Text(frame)).await;
            let _ = socket.send(WsMessage::Text("not json".into())).await;
        }
    }
}

async fn spawn_hub(
    drop_first_connection: bool,
) -> Result<(String, HubState, mpsc::UnboundedReceiver<String>)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (requests, requests_rx) = mpsc::unbounded_channel();
    let state = HubState {
        requests,
        tokens: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
        drop_first_connection,
    };
    let app = Router::new()
        .route("/hubs/chat", get(hub_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/hubs/chat"), state, requests_rx))
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
    }
}

async fn wait_for_state(events: &mut broadcast::Receiver<TransportEvent>, wanted: TransportState) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
            .expect("event");
        if matches!(event, TransportEvent::State(state) if state == wanted) {
            return;
        }
    }
}

#[test]
fn endpoint_switches_to_websocket_scheme_and_carries_the_token() {
    let plain = WebSocketTransport::new("http://chat.local:5000/hubs/chat", fast_policy(), 8);
    assert_eq!(
        plain.endpoint("abc").expect("endpoint").as_str(),
        "ws://chat.local:5000/hubs/chat?access_token=abc"
    );

    let secure = WebSocketTransport::new("https://chat.example.com/hubs/chat", fast_policy(), 8);
    assert_eq!(
        secure.endpoint("a b").expect("endpoint").as_str(),
        "wss://chat.example.com/hubs/chat?access_token=a+b"
    );

    let wrong = WebSocketTransport::new("ftp://chat.example.com", fast_policy(), 8);
    assert!(wrong.endpoint("abc").is_err());
}

#[tokio::test]
async fn missing_transport_never_connects() {
    let transport = MissingPushTransport::new();

    assert!(transport.connect("token").await.is_err());
    assert_eq!(transport.state(), TransportState::Disconnected);
    assert!(transport
        .invoke(ClientRequest::join(ChannelKey::Direct(PEER)))
        .await
        .is_err());
    transport.close().await.expect("close is a no-op");
}

#[tokio::test]
async fn invoke_before_connect_fails() {
    let transport = WebSocketTransport::new("http://127.0.0.1:9/hubs/chat", fast_policy(), 8);

    let err = transport
        .invoke(ClientRequest::join(ChannelKey::Direct(PEER)))
        .await
        .expect_err("not connected");
    assert!(err.to_string().contains("not connected"));
}

#[tokio::test]
async fn sends_requests_and_forwards_server_frames() {
    let (url, state, mut requests) = spawn_hub(false).await.expect("spawn hub");
    let transport = WebSocketTransport::new(url, fast_policy(), 32);
    let mut events = transport.events();

    transport.connect("secret").await.expect("connect");
    wait_for_state(&mut events, TransportState::Connected).await;
    assert_eq!(transport.state(), TransportState::Connected);

    transport
        .invoke(ClientRequest::join(ChannelKey::Direct(PEER)))
        .await
        .expect("invoke");
    let request = tokio::time::timeout(Duration::from_secs(3), requests.recv())
        .await
        .expect("request in time")
        .expect("request");
    assert_eq!(
        serde_json::from_str::<ClientRequest>(&request).expect("decode request"),
        ClientRequest::JoinDirect { peer_id: PEER }
    );
    assert_eq!(state.tokens.lock().await.clone(), vec!["secret".to_string()]);

    let event = loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        if let TransportEvent::Server(event) = event {
            break event;
        }
    };
    let message = event.message().expect("message event");
    assert_eq!(message.message_id.0, 40);
    assert_eq!(message.channel_for(ME), Some(ChannelKey::Direct(PEER)));

    transport.close().await.expect("close");
    wait_for_state(&mut events, TransportState::Closed).await;
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn reconnects_after_the_server_drops_the_socket() {
    let (url, state, _requests) = spawn_hub(true).await.expect("spawn hub");
    let transport = WebSocketTransport::new(url, fast_policy(), 32);
    let mut events = transport.events();

    transport.connect("secret").await.expect("connect");
    wait_for_state(&mut events, TransportState::Connected).await;
    wait_for_state(&mut events, TransportState::Reconnecting).await;
    wait_for_state(&mut events, TransportState::Connected).await;

    wait_until!(state.connections.load(Ordering::SeqCst) == 2);
    transport.close().await.expect("close");
}

#[tokio::test]
async fn failed_first_attempt_reports_error_and_keeps_retrying() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let transport = WebSocketTransport::new(format!("http://{addr}/hubs/chat"), fast_policy(), 32);
    let mut events = transport.events();

    let err = transport.connect("secret").await.expect_err("refused");
    assert!(err.to_string().contains("retrying"), "{err}");
    wait_for_state(&mut events, TransportState::Reconnecting).await;

    transport.close().await.expect("close");
    wait_for_state(&mut events, TransportState::Closed).await;
}
