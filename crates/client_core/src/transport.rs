use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{settings::ReconnectPolicy, types::TransportState};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    State(TransportState),
    Server(ServerEvent),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Starts the connection. Returns once the first attempt has settled; on
    /// failure the implementation keeps retrying in the background.
    async fn connect(&self, auth_token: &str) -> Result<()>;
    async fn invoke(&self, request: ClientRequest) -> Result<()>;
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
    fn state(&self) -> TransportState;
    async fn close(&self) -> Result<()>;
}

pub struct MissingPushTransport {
    events: broadcast::Sender<TransportEvent>,
}

impl MissingPushTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingPushTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for MissingPushTransport {
    async fn connect(&self, _auth_token: &str) -> Result<()> {
        Err(anyhow!("push transport is not configured"))
    }

    async fn invoke(&self, _request: ClientRequest) -> Result<()> {
        Err(anyhow!("push transport is not configured"))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> TransportState {
        TransportState::Disconnected
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ConnectionWorker {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct WebSocketTransport {
    push_url: String,
    policy: ReconnectPolicy,
    events: broadcast::Sender<TransportEvent>,
    state: Arc<watch::Sender<TransportState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ClientRequest>>>>,
    worker: Mutex<Option<ConnectionWorker>>,
}

impl WebSocketTransport {
    pub fn new(push_url: impl Into<String>, policy: ReconnectPolicy, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            push_url: push_url.into(),
            policy,
            events,
            state: Arc::new(state),
            outbound: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    fn endpoint(&self, auth_token: &str) -> Result<Url> {
        let mut url = Url::parse(self.push_url.trim())
            .with_context(|| format!("invalid push url '{}'", self.push_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("push url must use ws(s) or http(s), got '{other}'"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch push url to {scheme}"))?;
        url.query_pairs_mut().append_pair("access_token", auth_token);
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, auth_token: &str) -> Result<()> {
        let endpoint = self.endpoint(auth_token)?;
        let ready_rx = {
            let mut worker = self.worker.lock().await;
            if worker.as_ref().is_some_and(|w| !w.task.is_finished()) {
                debug!("transport: connect ignored, connection loop already running");
                return Ok(());
            }
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(run_connection_loop(
                endpoint,
                self.policy,
                StatePublisher {
                    events: self.events.clone(),
                    state: Arc::clone(&self.state),
                },
                Arc::clone(&self.outbound),
                shutdown_rx,
                ready_tx,
            ));
            *worker = Some(ConnectionWorker {
                shutdown: shutdown_tx,
                task,
            });
            ready_rx
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(anyhow!(
                "initial push connection failed ({reason}); retrying in background"
            )),
            Err(_) => Err(anyhow!("push connection loop stopped before connecting")),
        }
    }

    async fn invoke(&self, request: ClientRequest) -> Result<()> {
        let guard = self.outbound.lock().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("push transport is not connected"))?;
        sender
            .send(request)
            .map_err(|_| anyhow!("push connection closed while sending"))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    async fn close(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        let _ = worker.shutdown.send(());
        worker
            .task
            .await
            .context("push connection loop panicked")?;
        Ok(())
    }
}

struct StatePublisher {
    events: broadcast::Sender<TransportEvent>,
    state: Arc<watch::Sender<TransportState>>,
}

impl StatePublisher {
    fn publish(&self, next: TransportState) {
        self.state.send_replace(next);
        let _ = self.events.send(TransportEvent::State(next));
    }
}

async fn run_connection_loop(
    endpoint: Url,
    policy: ReconnectPolicy,
    publisher: StatePublisher,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ClientRequest>>>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;
    publisher.publish(TransportState::Connecting);

    loop {
        let connected = tokio::select! {
            result = connect_async(endpoint.as_str()) => result,
            _ = &mut shutdown_rx => break,
        };

        match connected {
            Ok((stream, _)) => {
                attempt = 0;
                let (tx, rx) = mpsc::unbounded_channel();
                *outbound.lock().await = Some(tx);
                info!(host = endpoint.host_str().unwrap_or_default(), "transport: connected");
                publisher.publish(TransportState::Connected);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }

                let shutdown_requested =
                    run_message_loop(stream, rx, &publisher.events, &mut shutdown_rx).await;
                *outbound.lock().await = None;
                if shutdown_requested {
                    break;
                }
                warn!("transport: connection lost");
            }
            Err(err) => {
                warn!(%err, attempt, "transport: connection attempt failed");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err.to_string()));
                }
            }
        }

        publisher.publish(TransportState::Reconnecting);
        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "transport: scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown_rx => break,
        }
    }

    publisher.publish(TransportState::Closed);
}

async fn run_message_loop(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    events: &broadcast::Sender<TransportEvent>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => {
                let _ = writer.send(Message::Close(None)).await;
                return true;
            }
            request = outbound.recv() => {
                let Some(request) = request else {
                    return false;
                };
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "transport: failed to encode client request");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!(%err, "transport: send failed");
                    return false;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        let _ = events.send(TransportEvent::Server(event));
                    }
                    Err(err) => warn!(%err, "transport: ignoring malformed server frame"),
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "transport: receive failed");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
