use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::ChannelKey,
    protocol::{ClientRequest, ServerEvent, ServerEventKind},
};
use tokio::{
    sync::{broadcast::error::RecvError, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    transport::{PushTransport, TransportEvent},
    types::{LinkTransition, TransportState},
};

pub type HandlerId = u64;

pub type ChannelKeyExtractor = Arc<dyn Fn(&ServerEvent) -> Option<ChannelKey> + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(RoutedEvent) + Send + Sync>;
pub type TransitionCallback = Arc<dyn Fn(LinkTransition) + Send + Sync>;
/// Called with the number of transport events the router skipped.
pub type LagCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub handler: HandlerId,
    pub channel: Option<ChannelKey>,
    pub event: ServerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    Channel(ChannelKey),
    Session,
}

struct RegisteredHandler {
    kind: ServerEventKind,
    scope: HandlerScope,
    extractor: Option<ChannelKeyExtractor>,
    callback: EventCallback,
}

pub struct LiveEventRouter {
    transport: Arc<dyn PushTransport>,
    status: watch::Sender<TransportState>,
    epoch: AtomicU64,
    next_handler_id: AtomicU64,
    handlers: RwLock<HashMap<HandlerId, RegisteredHandler>>,
    transition_listeners: RwLock<HashMap<HandlerId, TransitionCallback>>,
    lag_listeners: RwLock<HashMap<HandlerId, LagCallback>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
}

impl LiveEventRouter {
    pub fn new(transport: Arc<dyn PushTransport>, connect_timeout: Duration) -> Arc<Self> {
        let (status, _) = watch::channel(TransportState::Disconnected);
        Arc::new(Self {
            transport,
            status,
            epoch: AtomicU64::new(0),
            next_handler_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            transition_listeners: RwLock::new(HashMap::new()),
            lag_listeners: RwLock::new(HashMap::new()),
            pump: Mutex::new(None),
            connect_timeout,
        })
    }

    pub fn status(&self) -> TransportState {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<TransportState> {
        self.status.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn connect(self: &Arc<Self>, auth_token: &str) -> Result<(), SyncError> {
        match self.status() {
            TransportState::Connected | TransportState::Connecting => {
                debug!("router: connect ignored, transport already active");
                return Ok(());
            }
            TransportState::Reconnecting => {
                return Err(SyncError::transport("reconnect already in progress"));
            }
            TransportState::Disconnected | TransportState::Closed => {}
        }
        self.ensure_pump().await;

        self.transport
            .connect(auth_token)
            .await
            .map_err(SyncError::transport)?;

        let mut status = self.watch_status();
        let connected = tokio::time::timeout(self.connect_timeout, async move {
            status
                .wait_for(|state| *state == TransportState::Connected)
                .await
                .map(|_| ())
        })
        .await;
        match connected {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::transport("router status channel closed")),
            Err(_) => Err(SyncError::transport(
                "transport reported success but never signalled Connected",
            )),
        }
    }

    async fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut events = self.transport.events();
        let router = Arc::downgrade(self);
        *pump = Some(tokio::spawn(async move {
            loop {
                let received = events.recv().await;
                let Some(router) = router.upgrade() else {
                    break;
                };
                let event = match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        router.recover_from_lag(skipped).await;
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match event {
                    TransportEvent::State(state) => router.apply_state(state).await,
                    TransportEvent::Server(event) => {
                        router.dispatch(event).await;
                    }
                }
            }
        }));
    }

    /// Skipped frames may include state changes, so the status is taken from
    /// the transport before lag listeners run.
    async fn recover_from_lag(&self, skipped: u64) {
        warn!(skipped, "router: transport events lagged, requesting resync");
        self.apply_state(self.transport.state()).await;
        for listener in self.lag_listeners.read().await.values() {
            listener(skipped);
        }
    }

    async fn apply_state(&self, next: TransportState) {
        let previous = self.status();
        if previous == next {
            return;
        }
        if next == TransportState::Connected {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.status.send_replace(next);
        let transition = LinkTransition {
            from: previous,
            to: next,
            epoch: self.epoch(),
        };
        info!(from = ?previous, to = ?next, epoch = transition.epoch, "router: transport state changed");
        for listener in self.transition_listeners.read().await.values() {
            listener(transition);
        }
    }

    pub async fn register_handler(
        &self,
        kind: ServerEventKind,
        scope: HandlerScope,
        extractor: Option<ChannelKeyExtractor>,
        callback: EventCallback,
    ) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.write().await.insert(
            id,
            RegisteredHandler {
                kind,
                scope,
                extractor,
                callback,
            },
        );
        id
    }

    pub async fn on_transition(&self, callback: TransitionCallback) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.transition_listeners.write().await.insert(id, callback);
        id
    }

    pub async fn on_lagged(&self, callback: LagCallback) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.lag_listeners.write().await.insert(id, callback);
        id
    }

    pub async fn remove_handler(&self, id: HandlerId) -> bool {
        let removed_event = self.handlers.write().await.remove(&id).is_some();
        let removed_transition = self.transition_listeners.write().await.remove(&id).is_some();
        let removed_lag = self.lag_listeners.write().await.remove(&id).is_some();
        removed_event || removed_transition || removed_lag
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn dispatch(&self, event: ServerEvent) -> usize {
        let kind = event.kind();
        let handlers = self.handlers.read().await;
        let mut delivered = 0;
        let mut extracted = None;

        for (id, handler) in handlers.iter().filter(|(_, h)| h.kind == kind) {
            let channel = match handler.scope {
                HandlerScope::Session => handler
                    .extractor
                    .as_ref()
                    .and_then(|extract| extract(&event)),
                HandlerScope::Channel(key) => {
                    let Some(extract) = handler.extractor.as_ref() else {
                        continue;
                    };
                    let channel = extract(&event);
                    extracted = channel;
                    if channel != Some(key) {
                        continue;
                    }
                    channel
                }
            };
            (handler.callback)(RoutedEvent {
                handler: *id,
                channel,
                event: event.clone(),
            });
            delivered += 1;
        }

        if delivered == 0 {
            match extracted {
                Some(channel) => {
                    debug!(channel = %channel, ?kind, "router: dropped event for unsubscribed channel")
                }
                None => debug!(?kind, "router: dropped event with no handler"),
            }
        }
        delivered
    }

    pub async fn join(&self, channel: ChannelKey) -> Result<u64, SyncError> {
        self.invoke_membership(channel, ClientRequest::join(channel))
            .await
    }

    pub async fn leave(&self, channel: ChannelKey) -> Result<u64, SyncError> {
        self.invoke_membership(channel, ClientRequest::leave(channel))
            .await
            .map_err(|err| match err {
                SyncError::ChannelJoinFailed { reason, .. } => {
                    SyncError::TransportUnavailable { reason }
                }
                other => other,
            })
    }

    async fn invoke_membership(
        &self,
        channel: ChannelKey,
        request: ClientRequest,
    ) -> Result<u64, SyncError> {
        let status = self.status();
        if status != TransportState::Connected {
            return Err(SyncError::transport(format!(
                "cannot send {request:?} for {channel} while {status:?}"
            )));
        }
        let epoch = self.epoch();
        self.transport
            .invoke(request)
            .await
            .map_err(|err| SyncError::ChannelJoinFailed {
                channel,
                reason: err.to_string(),
            })?;
        Ok(epoch)
    }

    pub async fn disconnect(&self) {
        if let Err(err) = self.transport.close().await {
            warn!(%err, "router: transport close failed");
        }
        self.apply_state(TransportState::Closed).await;
        self.handlers.write().await.clear();
        self.transition_listeners.write().await.clear();
        self.lag_listeners.write().await.clear();
    }
}

impl Drop for LiveEventRouter {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(task) = pump.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
