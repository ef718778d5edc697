use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use shared::{
    domain::{ChannelKey, Surface, UserId},
    protocol::{NotificationPayload, ServerEvent, ServerEventKind},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, info, warn};

pub mod error;
pub mod protocol_client;
pub mod registry;
pub mod router;
pub mod settings;
pub mod store;
pub mod transport;
pub mod types;

pub use error::SyncError;
pub use protocol_client::{ConversationBackend, HttpConversationBackend};
pub use registry::{ChannelBinding, ChannelRegistry, JoinOutcome, Subscription, SubscriptionHealth};
pub use router::{HandlerScope, LiveEventRouter, RoutedEvent};
pub use settings::{load_settings, SyncSettings};
pub use store::{AppendOutcome, ConversationStore};
pub use transport::{MissingPushTransport, PushTransport, TransportEvent, WebSocketTransport};
pub use types::{
    Attachment, AttachmentUpload, ConversationPartition, ConversationSummary, LinkTransition,
    Message, OpenOutcome, OutgoingMessage, SessionCredentials, SyncEvent, TransportState, Turn,
    ViewPhase, ViewStatus,
};

use router::{ChannelKeyExtractor, EventCallback};

/// Snapshot fetches per resync before the view goes live without one.
const RESYNC_ATTEMPTS: u32 = 3;

enum ControllerInput {
    Routed {
        session: u64,
        event: RoutedEvent,
    },
    Transition {
        session: u64,
        transition: LinkTransition,
    },
    Lagged {
        session: u64,
        skipped: u64,
    },
}

struct ConversationView {
    channel: Option<ChannelKey>,
    joined: Option<ChannelKey>,
    phase: ViewPhase,
    generation: u64,
    buffered: VecDeque<Message>,
    error: Option<SyncError>,
}

impl ConversationView {
    fn idle() -> Self {
        Self {
            channel: None,
            joined: None,
            phase: ViewPhase::Idle,
            generation: 0,
            buffered: VecDeque::new(),
            error: None,
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.channel = None;
        self.joined = None;
        self.phase = ViewPhase::Idle;
        self.buffered.clear();
        self.error = None;
    }

    fn status(&self, surface: Surface, registry: &ChannelRegistry) -> ViewStatus {
        let live_updates_degraded = match self.phase {
            ViewPhase::Idle | ViewPhase::Loading => false,
            ViewPhase::Resyncing => true,
            ViewPhase::Live => {
                self.error.is_some()
                    || self
                        .joined
                        .and_then(|channel| registry.subscription(&channel))
                        .map_or(true, |sub| sub.health != SubscriptionHealth::Active)
            }
        };
        ViewStatus {
            surface,
            channel: self.channel,
            phase: self.phase,
            generation: self.generation,
            error: self.error.clone(),
            live_updates_degraded,
        }
    }
}

struct ActiveSession {
    id: u64,
    credentials: SessionCredentials,
    store: ConversationStore,
}

struct SyncState {
    session: Option<ActiveSession>,
    registry: ChannelRegistry,
    views: HashMap<Surface, ConversationView>,
    next_session_id: u64,
}

impl SyncState {
    fn active(&mut self, session_id: u64) -> Option<&mut ActiveSession> {
        self.session.as_mut().filter(|s| s.id == session_id)
    }

    fn mark_resyncing(&mut self, events: &broadcast::Sender<SyncEvent>) {
        for (surface, view) in self.views.iter_mut() {
            if view.phase == ViewPhase::Live {
                view.phase = ViewPhase::Resyncing;
                info!(surface = ?surface, channel = ?view.channel, "sync: view resyncing");
                let _ = events.send(SyncEvent::ViewChanged(view.status(*surface, &self.registry)));
            }
        }
    }

    fn pending_resyncs(&self) -> Vec<(Surface, ChannelKey, u64)> {
        self.views
            .iter()
            .filter(|(_, view)| view.phase == ViewPhase::Resyncing)
            .filter_map(|(surface, view)| view.channel.map(|channel| (*surface, channel, view.generation)))
            .collect()
    }
}

fn drain_buffered(store: &mut ConversationStore, view: &mut ConversationView) -> usize {
    view.buffered
        .drain(..)
        .map(|message| store.append(message))
        .filter(|outcome| *outcome == AppendOutcome::Inserted)
        .count()
}

/// Unsubscribes the listener when dropped.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keeps conversations and live messages consistent across REST snapshots,
/// the push connection, and the direct and group chat surfaces.
pub struct ConversationSyncClient {
    backend: Arc<dyn ConversationBackend>,
    router: Arc<LiveEventRouter>,
    settings: SyncSettings,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    controller_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSyncClient {
    pub fn new(
        settings: SyncSettings,
        backend: Arc<dyn ConversationBackend>,
        transport: Arc<dyn PushTransport>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        let router = LiveEventRouter::new(transport, settings.connect_timeout());
        let views = [Surface::Direct, Surface::Group]
            .into_iter()
            .map(|surface| (surface, ConversationView::idle()))
            .collect();
        Arc::new(Self {
            backend,
            inner: Mutex::new(SyncState {
                session: None,
                registry: ChannelRegistry::new(Arc::clone(&router)),
                views,
                next_session_id: 0,
            }),
            router,
            settings,
            events,
            controller_task: Mutex::new(None),
        })
    }

    pub fn from_settings(settings: SyncSettings) -> anyhow::Result<Arc<Self>> {
        settings.validate()?;
        let backend = Arc::new(HttpConversationBackend::new(
            settings.api_base_url.clone(),
            settings.request_timeout(),
        )?);
        let transport: Arc<dyn PushTransport> = match &settings.push_url {
            Some(push_url) => Arc::new(WebSocketTransport::new(
                push_url.clone(),
                settings.reconnect_policy(),
                settings.event_channel_capacity,
            )),
            None => Arc::new(MissingPushTransport::new()),
        };
        Ok(Self::new(settings, backend, transport))
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn transport_state(&self) -> TransportState {
        self.router.status()
    }

    /// Replaces any active session. Only a failed conversation list fetch is
    /// returned as an error; push connection failures are emitted as events.
    pub async fn start_session(
        self: &Arc<Self>,
        credentials: SessionCredentials,
    ) -> Result<(), SyncError> {
        if self.inner.lock().await.session.is_some() {
            self.teardown_session().await;
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock().await;
            state.next_session_id += 1;
            let session_id = state.next_session_id;
            let viewer = credentials.user_id;

            let extractor: ChannelKeyExtractor = Arc::new(move |event: &ServerEvent| {
                event.message().and_then(|message| message.channel_for(viewer))
            });
            let tx = input_tx.clone();
            let callback: EventCallback = Arc::new(move |event| {
                let _ = tx.send(ControllerInput::Routed {
                    session: session_id,
                    event,
                });
            });
            state.registry.bind(ChannelBinding {
                extractor,
                callback: Arc::clone(&callback),
            });
            for kind in [
                ServerEventKind::ReceiveNotification,
                ServerEventKind::UpdateNotifications,
                ServerEventKind::Error,
            ] {
                self.router
                    .register_handler(kind, HandlerScope::Session, None, Arc::clone(&callback))
                    .await;
            }
            let tx = input_tx.clone();
            self.router
                .on_transition(Arc::new(move |transition: LinkTransition| {
                    let _ = tx.send(ControllerInput::Transition {
                        session: session_id,
                        transition,
                    });
                }))
                .await;
            let tx = input_tx;
            self.router
                .on_lagged(Arc::new(move |skipped| {
                    let _ = tx.send(ControllerInput::Lagged {
                        session: session_id,
                        skipped,
                    });
                }))
                .await;

            state.session = Some(ActiveSession {
                id: session_id,
                credentials: credentials.clone(),
                store: ConversationStore::new(viewer),
            });
        }
        self.spawn_controller(input_rx).await;
        info!(user_id = %credentials.user_id, "sync: session started");

        if let Err(err) = self.router.connect(&credentials.auth_token).await {
            warn!(%err, "sync: push connection unavailable, continuing on snapshots");
            self.emit(SyncEvent::Error(err));
        }
        self.emit(SyncEvent::TransportChanged(self.router.status()));

        self.refresh_conversations().await.map(|_| ())
    }

    async fn spawn_controller(self: &Arc<Self>, mut inputs: mpsc::UnboundedReceiver<ControllerInput>) {
        let client = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(input) = inputs.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                match input {
                    ControllerInput::Routed { session, event } => {
                        client.apply_routed(session, event).await
                    }
                    ControllerInput::Transition {
                        session,
                        transition,
                    } => client.apply_transition(session, transition).await,
                    ControllerInput::Lagged { session, skipped } => {
                        client.apply_lag(session, skipped).await
                    }
                }
            }
        });
        if let Some(previous) = self.controller_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn teardown_session(&self) {
        let ended = {
            let mut state = self.inner.lock().await;
            let ended = state.session.take().map(|session| session.credentials.user_id);
            for view in state.views.values_mut() {
                view.reset();
            }
            state.registry.clear().await;
            ended
        };
        self.router.disconnect().await;
        if let Some(task) = self.controller_task.lock().await.take() {
            task.abort();
        }

        if let Some(user_id) = ended {
            info!(user_id = %user_id, "sync: session torn down");
        }
        self.emit(SyncEvent::TransportChanged(self.router.status()));
        self.emit(SyncEvent::SummariesChanged);
        self.emit(SyncEvent::NotificationsChanged);
        for surface in [Surface::Direct, Surface::Group] {
            self.emit(SyncEvent::ViewChanged(self.view_status(surface).await));
        }
    }

    async fn session_credentials(&self) -> Result<(SessionCredentials, u64), SyncError> {
        let state = self.inner.lock().await;
        let session = state.session.as_ref().ok_or(SyncError::NoSession)?;
        Ok((session.credentials.clone(), session.id))
    }

    async fn fetch_snapshot(
        &self,
        credentials: &SessionCredentials,
        channel: ChannelKey,
    ) -> Result<Vec<Message>, SyncError> {
        let fetched = match channel {
            ChannelKey::Direct(peer_id) => self.backend.chat_history(credentials, peer_id).await,
            ChannelKey::Group(group_id) => {
                self.backend
                    .group_chat_history(credentials, group_id)
                    .await
            }
        };
        let payloads = fetched.map_err(|err| SyncError::SnapshotFetchFailed {
            channel,
            reason: format!("{err:#}"),
        })?;
        Ok(payloads
            .iter()
            .filter_map(|payload| Message::from_payload(payload, credentials.user_id))
            .collect())
    }

    pub async fn open_conversation_view(
        &self,
        channel: ChannelKey,
    ) -> Result<OpenOutcome, SyncError> {
        let surface = channel.surface();
        let (credentials, session_id, generation) = {
            let mut state = self.inner.lock().await;
            let SyncState {
                session,
                views,
                registry,
                ..
            } = &mut *state;
            let active = session.as_mut().ok_or(SyncError::NoSession)?;
            let view = views.entry(surface).or_insert_with(ConversationView::idle);
            if view.channel == Some(channel)
                && matches!(view.phase, ViewPhase::Live | ViewPhase::Resyncing)
            {
                return Ok(OpenOutcome::AlreadyLive);
            }

            let previous = view.channel.replace(channel);
            view.generation += 1;
            view.phase = ViewPhase::Loading;
            view.error = None;
            view.buffered.clear();
            if let Some(previous) = previous.filter(|previous| *previous != channel) {
                active.store.set_focus(previous, false);
            }
            active.store.set_focus(channel, true);
            self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
            (active.credentials.clone(), active.id, view.generation)
        };

        info!(channel = %channel, generation, "sync: opening conversation view");
        let fetched = self.fetch_snapshot(&credentials, channel).await;
        self.complete_open(surface, channel, session_id, generation, fetched)
            .await
    }

    async fn complete_open(
        &self,
        surface: Surface,
        channel: ChannelKey,
        session_id: u64,
        generation: u64,
        fetched: Result<Vec<Message>, SyncError>,
    ) -> Result<OpenOutcome, SyncError> {
        let mut state = self.inner.lock().await;
        let SyncState {
            session,
            views,
            registry,
            ..
        } = &mut *state;
        let current = session.as_mut().filter(|s| s.id == session_id).and_then(|active| {
            views
                .get_mut(&surface)
                .filter(|view| view.generation == generation)
                .map(|view| (active, view))
        });
        let Some((active, view)) = current else {
            let stale = SyncError::StaleViewDiscarded {
                channel,
                generation,
            };
            debug!(%stale, "sync: snapshot arrived for a superseded view");
            return Ok(OpenOutcome::Superseded);
        };

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(channel = %channel, %err, "sync: snapshot fetch failed, view stays loading");
                view.error = Some(err.clone());
                if let Some(joined) = view.joined.take() {
                    registry.leave(joined).await;
                }
                self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
                return Err(err);
            }
        };

        let outcome = registry.switch_to(view.joined, channel).await;
        view.joined = Some(channel);
        active.store.seed(channel, snapshot);
        active.store.mark_read(&channel);
        view.error = match outcome {
            JoinOutcome::Deferred(err) => Some(err),
            JoinOutcome::Joined | JoinOutcome::AlreadyJoined => None,
        };
        view.phase = if self.router.status() == TransportState::Connected {
            ViewPhase::Live
        } else {
            ViewPhase::Resyncing
        };
        info!(channel = %channel, generation, phase = ?view.phase, "sync: conversation view ready");

        self.emit(SyncEvent::MessagesChanged { channel });
        self.emit(SyncEvent::SummariesChanged);
        self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
        Ok(OpenOutcome::Live)
    }

    pub async fn close_conversation_view(&self, channel: ChannelKey) -> bool {
        let surface = channel.surface();
        let mut state = self.inner.lock().await;
        let SyncState {
            session,
            views,
            registry,
            ..
        } = &mut *state;
        let Some(view) = views
            .get_mut(&surface)
            .filter(|view| view.channel == Some(channel))
        else {
            return false;
        };

        let joined = view.joined.take();
        view.reset();
        if let Some(joined) = joined {
            registry.leave(joined).await;
        }
        if let Some(active) = session.as_mut() {
            active.store.set_focus(channel, false);
        }
        info!(channel = %channel, generation = view.generation, "sync: closed conversation view");
        self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
        true
    }

    /// Manual retry: reopens a view stuck in Loading, or re-fetches and
    /// merges the snapshot of a Live or Resyncing view.
    pub async fn refresh_view(&self, channel: ChannelKey) -> Result<OpenOutcome, SyncError> {
        let surface = channel.surface();
        let target = {
            let state = self.inner.lock().await;
            let session_id = state.session.as_ref().map(|s| s.id);
            state
                .views
                .get(&surface)
                .filter(|view| {
                    view.channel == Some(channel)
                        && matches!(view.phase, ViewPhase::Live | ViewPhase::Resyncing)
                })
                .map(|view| view.generation)
                .zip(session_id)
        };

        match target {
            Some((generation, session_id)) => {
                self.merge_snapshot(surface, channel, session_id, generation)
                    .await?;
                Ok(OpenOutcome::AlreadyLive)
            }
            None => self.open_conversation_view(channel).await,
        }
    }

    async fn merge_snapshot(
        &self,
        surface: Surface,
        channel: ChannelKey,
        session_id: u64,
        generation: u64,
    ) -> Result<(), SyncError> {
        let (credentials, current_session) = self.session_credentials().await?;
        if current_session != session_id {
            return Err(SyncError::StaleViewDiscarded {
                channel,
                generation,
            });
        }
        let fetched = self.fetch_snapshot(&credentials, channel).await;

        let mut state = self.inner.lock().await;
        let SyncState {
            session,
            views,
            registry,
            ..
        } = &mut *state;
        let current = session.as_mut().filter(|s| s.id == session_id).and_then(|active| {
            views
                .get_mut(&surface)
                .filter(|view| view.generation == generation && view.channel == Some(channel))
                .map(|view| (active, view))
        });
        let Some((active, view)) = current else {
            return Err(SyncError::StaleViewDiscarded {
                channel,
                generation,
            });
        };

        match fetched {
            Err(err) => {
                warn!(channel = %channel, %err, phase = ?view.phase, "sync: resync fetch failed");
                view.error = Some(err.clone());
                self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
                Err(err)
            }
            Ok(snapshot) => {
                let added = active.store.seed(channel, snapshot);
                let replayed = drain_buffered(&mut active.store, view);
                active.store.mark_read(&channel);
                view.error = None;
                if view.phase == ViewPhase::Resyncing
                    && self.router.status() == TransportState::Connected
                {
                    view.phase = ViewPhase::Live;
                }
                info!(channel = %channel, added, replayed, phase = ?view.phase, "sync: snapshot merged");
                self.emit(SyncEvent::MessagesChanged { channel });
                self.emit(SyncEvent::SummariesChanged);
                self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
                Ok(())
            }
        }
    }

    async fn apply_routed(&self, session_id: u64, routed: RoutedEvent) {
        let mut state = self.inner.lock().await;
        let buffer_limit = self.settings.resync_buffer_limit.max(1);
        let SyncState {
            session,
            views,
            registry,
            ..
        } = &mut *state;
        let Some(active) = session.as_mut().filter(|s| s.id == session_id) else {
            debug!("sync: dropping event from a previous session");
            return;
        };

        match routed.event {
            ServerEvent::ReceiveMessage { message } | ServerEvent::ReceiveGroupMessage { message } => {
                let Some(channel) = routed.channel else {
                    return;
                };
                // The subscription may have been left after the router
                // dispatched this event.
                if !registry.is_joined(&channel) {
                    debug!(channel = %channel, "sync: dropping event for a channel no longer joined");
                    return;
                }
                let message = Message::in_channel(channel, &message);
                if let Some(view) = views.get_mut(&channel.surface()).filter(|view| {
                    view.channel == Some(channel) && view.phase == ViewPhase::Resyncing
                }) {
                    if view.buffered.len() >= buffer_limit {
                        view.buffered.pop_front();
                        warn!(channel = %channel, buffer_limit, "sync: resync buffer full, dropping oldest");
                    }
                    view.buffered.push_back(message);
                    return;
                }
                if active.store.append(message) == AppendOutcome::Inserted {
                    self.emit(SyncEvent::MessagesChanged { channel });
                    self.emit(SyncEvent::SummariesChanged);
                }
            }
            ServerEvent::ReceiveNotification { notification } => {
                if active.store.upsert_notifications([notification]) {
                    self.emit(SyncEvent::NotificationsChanged);
                }
            }
            ServerEvent::UpdateNotifications { notifications } => {
                if active.store.upsert_notifications(notifications) {
                    self.emit(SyncEvent::NotificationsChanged);
                }
            }
            ServerEvent::Error(api_error) => {
                warn!(%api_error, "sync: server pushed an error");
                self.emit(SyncEvent::ServerError(api_error));
            }
        }
    }

    async fn apply_transition(self: &Arc<Self>, session_id: u64, transition: LinkTransition) {
        self.emit(SyncEvent::TransportChanged(transition.to));
        let mut state = self.inner.lock().await;
        if state.active(session_id).is_none() {
            return;
        }

        if transition.is_link_lost() {
            state.mark_resyncing(&self.events);
        } else if transition.to == TransportState::Connected {
            for (channel, err) in state.registry.rejoin().await {
                debug!(channel = %channel, "sync: rejoin failed");
                self.emit(SyncEvent::Error(err));
            }
            let resyncs = state.pending_resyncs();
            let SyncState {
                views, registry, ..
            } = &*state;
            for (surface, view) in views.iter() {
                self.emit(SyncEvent::ViewChanged(view.status(*surface, registry)));
            }
            drop(state);

            self.spawn_resyncs(session_id, resyncs);
            if transition.is_reconnect() {
                self.spawn_conversation_refresh();
            }
        }
    }

    /// Skipped push events cannot be replayed, so every Live view refetches
    /// its snapshot.
    async fn apply_lag(self: &Arc<Self>, session_id: u64, skipped: u64) {
        let mut state = self.inner.lock().await;
        if state.active(session_id).is_none() {
            return;
        }
        state.mark_resyncing(&self.events);
        let resyncs = state.pending_resyncs();
        drop(state);

        if self.router.status() != TransportState::Connected {
            debug!(skipped, "sync: events lagged while offline, resync waits for the link");
            return;
        }
        warn!(skipped, views = resyncs.len(), "sync: push events lagged, resyncing views");
        self.spawn_resyncs(session_id, resyncs);
        self.spawn_conversation_refresh();
    }

    fn spawn_resyncs(self: &Arc<Self>, session_id: u64, resyncs: Vec<(Surface, ChannelKey, u64)>) {
        for (surface, channel, generation) in resyncs {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                client
                    .resync_view(surface, channel, session_id, generation)
                    .await
            });
        }
    }

    fn spawn_conversation_refresh(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.refresh_conversations().await {
                debug!(%err, "sync: conversation refresh after resync failed");
            }
        });
    }

    async fn resync_view(
        &self,
        surface: Surface,
        channel: ChannelKey,
        session_id: u64,
        generation: u64,
    ) {
        let policy = self.settings.reconnect_policy();
        let mut attempt = 0;
        loop {
            let err = match self
                .merge_snapshot(surface, channel, session_id, generation)
                .await
            {
                Ok(()) => return,
                Err(err @ SyncError::SnapshotFetchFailed { .. }) => err,
                Err(err) => {
                    debug!(channel = %channel, %err, "sync: resync did not complete");
                    return;
                }
            };
            attempt += 1;
            if attempt >= RESYNC_ATTEMPTS {
                self.resume_without_snapshot(surface, channel, session_id, generation, err)
                    .await;
                return;
            }
            // The next Connected transition starts a fresh resync.
            if self.router.status() != TransportState::Connected {
                return;
            }
            let delay = policy.delay_for(attempt - 1);
            debug!(channel = %channel, attempt, delay_ms = delay.as_millis() as u64, "sync: retrying resync");
            tokio::time::sleep(delay).await;
        }
    }

    /// Gives up on the snapshot: buffered events are applied and the view
    /// goes Live with the fetch error kept, so it reports degraded.
    async fn resume_without_snapshot(
        &self,
        surface: Surface,
        channel: ChannelKey,
        session_id: u64,
        generation: u64,
        err: SyncError,
    ) {
        let mut state = self.inner.lock().await;
        let SyncState {
            session,
            views,
            registry,
            ..
        } = &mut *state;
        let current = session.as_mut().filter(|s| s.id == session_id).and_then(|active| {
            views
                .get_mut(&surface)
                .filter(|view| {
                    view.generation == generation
                        && view.channel == Some(channel)
                        && view.phase == ViewPhase::Resyncing
                })
                .map(|view| (active, view))
        });
        let Some((active, view)) = current else {
            return;
        };
        if self.router.status() != TransportState::Connected {
            return;
        }

        let replayed = drain_buffered(&mut active.store, view);
        view.phase = ViewPhase::Live;
        view.error = Some(err);
        warn!(channel = %channel, replayed, "sync: resync gave up, live updates resume without a snapshot");
        if replayed > 0 {
            self.emit(SyncEvent::MessagesChanged { channel });
            self.emit(SyncEvent::SummariesChanged);
        }
        self.emit(SyncEvent::ViewChanged(view.status(surface, registry)));
    }

    pub async fn refresh_conversations(&self) -> Result<usize, SyncError> {
        let (credentials, session_id) = self.session_credentials().await?;
        let snapshot = self
            .backend
            .conversations(&credentials)
            .await
            .map_err(|err| SyncError::ConversationsFetchFailed {
                reason: format!("{err:#}"),
            });
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "sync: conversation list fetch failed");
                self.emit(SyncEvent::Error(err.clone()));
                return Err(err);
            }
        };

        let mut state = self.inner.lock().await;
        let Some(active) = state.active(session_id) else {
            return Err(SyncError::NoSession);
        };
        let count = snapshot.len();
        active.store.seed_conversations(snapshot);
        self.emit(SyncEvent::SummariesChanged);
        Ok(count)
    }

    pub async fn send_message(
        &self,
        channel: ChannelKey,
        content: impl Into<String>,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<Message, SyncError> {
        self.send_outgoing(OutgoingMessage {
            channel,
            content: content.into(),
            attachments,
            referral_target_user_id: None,
        })
        .await
    }

    pub async fn send_referral(
        &self,
        peer_id: UserId,
        referral_target: UserId,
        content: impl Into<String>,
    ) -> Result<Message, SyncError> {
        self.send_outgoing(OutgoingMessage {
            channel: ChannelKey::Direct(peer_id),
            content: content.into(),
            attachments: Vec::new(),
            referral_target_user_id: Some(referral_target),
        })
        .await
    }

    async fn send_outgoing(&self, outgoing: OutgoingMessage) -> Result<Message, SyncError> {
        let channel = outgoing.channel;
        if outgoing.content.trim().is_empty()
            && outgoing.attachments.is_empty()
            && outgoing.referral_target_user_id.is_none()
        {
            return Err(SyncError::SendFailed {
                channel,
                reason: "message has no content".into(),
            });
        }
        let (credentials, session_id) = self.session_credentials().await?;
        let payload = self
            .backend
            .send_message(&credentials, outgoing)
            .await
            .map_err(|err| SyncError::SendFailed {
                channel,
                reason: format!("{err:#}"),
            })?;
        let message = Message::in_channel(channel, &payload);

        let mut state = self.inner.lock().await;
        if let Some(active) = state.active(session_id) {
            if active.store.append(message.clone()) == AppendOutcome::Inserted {
                self.emit(SyncEvent::MessagesChanged { channel });
                self.emit(SyncEvent::SummariesChanged);
            }
        }
        Ok(message)
    }

    pub async fn messages(&self, channel: ChannelKey) -> Vec<Message> {
        let state = self.inner.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.store.list_messages(&channel).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.inner.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.store.list_conversations())
            .unwrap_or_default()
    }

    pub async fn conversation_partition(&self) -> ConversationPartition {
        let state = self.inner.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.store.partition_conversations())
            .unwrap_or_default()
    }

    pub async fn notifications(&self) -> Vec<NotificationPayload> {
        let state = self.inner.lock().await;
        state
            .session
            .as_ref()
            .map(|s| s.store.notifications())
            .unwrap_or_default()
    }

    pub async fn unread_notification_count(&self) -> usize {
        let state = self.inner.lock().await;
        state
            .session
            .as_ref()
            .map_or(0, |s| s.store.unread_notification_count())
    }

    pub async fn view_status(&self, surface: Surface) -> ViewStatus {
        let state = self.inner.lock().await;
        match state.views.get(&surface) {
            Some(view) => view.status(surface, &state.registry),
            None => ConversationView::idle().status(surface, &state.registry),
        }
    }

    pub async fn joined_channels(&self) -> Vec<ChannelKey> {
        self.inner.lock().await.registry.joined()
    }

    fn spawn_listener<R, F>(
        self: &Arc<Self>,
        events: broadcast::Receiver<SyncEvent>,
        is_relevant: R,
        on_change: F,
    ) -> ListenerHandle
    where
        R: Fn(&SyncEvent) -> bool + Send + 'static,
        F: Fn(Arc<Self>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let client = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            while let Some(item) = stream.next().await {
                let relevant = match &item {
                    Ok(event) => is_relevant(event),
                    Err(BroadcastStreamRecvError::Lagged(_)) => true,
                };
                if !relevant {
                    continue;
                }
                let Some(client) = client.upgrade() else {
                    break;
                };
                on_change(client).await;
            }
        });
        ListenerHandle { task }
    }

    pub async fn subscribe_to_messages<F>(
        self: &Arc<Self>,
        channel: ChannelKey,
        callback: F,
    ) -> ListenerHandle
    where
        F: Fn(Vec<Message>) + Send + Sync + 'static,
    {
        let events = self.events.subscribe();
        callback(self.messages(channel).await);
        let callback = Arc::new(callback);
        self.spawn_listener(
            events,
            move |event| matches!(event, SyncEvent::MessagesChanged { channel: changed } if *changed == channel),
            move |client| {
                let callback = Arc::clone(&callback);
                async move { callback(client.messages(channel).await) }.boxed()
            },
        )
    }

    pub async fn subscribe_to_summaries<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(Vec<ConversationSummary>) + Send + Sync + 'static,
    {
        let events = self.events.subscribe();
        callback(self.conversations().await);
        let callback = Arc::new(callback);
        self.spawn_listener(
            events,
            |event| matches!(event, SyncEvent::SummariesChanged),
            move |client| {
                let callback = Arc::clone(&callback);
                async move { callback(client.conversations().await) }.boxed()
            },
        )
    }

    pub async fn subscribe_to_notifications<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(Vec<NotificationPayload>) + Send + Sync + 'static,
    {
        let events = self.events.subscribe();
        callback(self.notifications().await);
        let callback = Arc::new(callback);
        self.spawn_listener(
            events,
            |event| matches!(event, SyncEvent::NotificationsChanged),
            move |client| {
                let callback = Arc::clone(&callback);
                async move { callback(client.notifications().await) }.boxed()
            },
        )
    }
}

impl Drop for ConversationSyncClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.controller_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
