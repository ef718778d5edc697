use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ChannelKey, GroupId, MessageId, NotificationId, NotificationKind, UserId},
    protocol::{
        ClientRequest, ConversationSummaryPayload, MessagePayload, NotificationPayload,
        ServerEvent,
    },
};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};

use crate::{
    protocol_client::ConversationBackend,
    registry::ChannelBinding,
    router::{ChannelKeyExtractor, EventCallback, RoutedEvent},
    transport::{PushTransport, TransportEvent},
    types::{Message, OutgoingMessage, SessionCredentials, TransportState},
};

pub(crate) const ME: UserId = UserId(1);
pub(crate) const PEER: UserId = UserId(2);
pub(crate) const OTHER_PEER: UserId = UserId(3);
pub(crate) const GROUP: GroupId = GroupId(9);
pub(crate) const FAKE_TRANSPORT_CAPACITY: usize = 256;

/// Polls `$cond` until it holds, failing the test after two seconds.
macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
pub(crate) use wait_until;

pub(crate) fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub(crate) fn direct(id: i64, sender: UserId, receiver: UserId, at: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: sender,
        receiver_id: Some(receiver),
        group_id: None,
        content: content.to_string(),
        attachments: Vec::new(),
        sent_at: ts(at),
        is_referral: false,
        referral_target_user_id: None,
    }
}

pub(crate) fn group(id: i64, sender: UserId, group_id: GroupId, at: i64, content: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: sender,
        receiver_id: None,
        group_id: Some(group_id),
        content: content.to_string(),
        attachments: Vec::new(),
        sent_at: ts(at),
        is_referral: false,
        referral_target_user_id: None,
    }
}

pub(crate) fn message(payload: &MessagePayload) -> Message {
    Message::from_payload(payload, ME).expect("payload visible to ME")
}

pub(crate) fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.id.0).collect()
}

pub(crate) fn summary(
    channel: ChannelKey,
    display_name: &str,
    last_message: MessagePayload,
    unread_count: u32,
) -> ConversationSummaryPayload {
    ConversationSummaryPayload {
        channel,
        display_name: display_name.to_string(),
        avatar_url: None,
        last_message,
        unread_count,
    }
}

pub(crate) fn notification(id: i64, at: i64, is_read: bool) -> NotificationPayload {
    NotificationPayload {
        notification_id: NotificationId(id),
        kind: NotificationKind::NewMessage,
        content: format!("notification {id}"),
        created_at: ts(at),
        is_read,
        source_user_id: Some(PEER),
    }
}

pub(crate) fn direct_event(payload: MessagePayload) -> ServerEvent {
    ServerEvent::ReceiveMessage { message: payload }
}

pub(crate) fn group_event(payload: MessagePayload) -> ServerEvent {
    ServerEvent::ReceiveGroupMessage { message: payload }
}

pub(crate) fn viewer_extractor(viewer: UserId) -> ChannelKeyExtractor {
    Arc::new(move |event: &ServerEvent| event.message().and_then(|m| m.channel_for(viewer)))
}

/// Binding whose callback forwards every routed event into the returned
/// receiver.
pub(crate) fn recording_binding(viewer: UserId) -> (ChannelBinding, mpsc::UnboundedReceiver<RoutedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (
        ChannelBinding {
            extractor: viewer_extractor(viewer),
            callback,
        },
        rx,
    )
}

/// In-memory push transport driven by the test.
pub(crate) struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    state: watch::Sender<TransportState>,
    invoked: Mutex<Vec<ClientRequest>>,
    reachable: AtomicBool,
    failing_invokes: AtomicUsize,
    connects: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Connect attempts fail until the test emits `Connected` itself.
    pub(crate) fn unreachable() -> Arc<Self> {
        Self::build(false)
    }

    fn build(reachable: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(FAKE_TRANSPORT_CAPACITY);
        let (state, _) = watch::channel(TransportState::Disconnected);
        Arc::new(Self {
            events,
            state,
            invoked: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(reachable),
            failing_invokes: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        })
    }

    pub(crate) fn emit_state(&self, state: TransportState) {
        self.state.send_replace(state);
        let _ = self.events.send(TransportEvent::State(state));
    }

    pub(crate) fn push(&self, event: ServerEvent) {
        let _ = self.events.send(TransportEvent::Server(event));
    }

    pub(crate) fn fail_next_invokes(&self, count: usize) {
        self.failing_invokes.store(count, Ordering::SeqCst);
    }

    pub(crate) async fn invoked(&self) -> Vec<ClientRequest> {
        self.invoked.lock().await.clone()
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self, _auth_token: &str) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.emit_state(TransportState::Connecting);
        if !self.reachable.load(Ordering::SeqCst) {
            bail!("push endpoint unreachable");
        }
        self.emit_state(TransportState::Connected);
        Ok(())
    }

    async fn invoke(&self, request: ClientRequest) -> Result<()> {
        let fail = self
            .failing_invokes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(anyhow!("hub rejected {request:?}"));
        }
        self.invoked.lock().await.push(request);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Scriptable REST backend.
pub(crate) struct FakeBackend {
    histories: Mutex<HashMap<ChannelKey, Vec<MessagePayload>>>,
    conversations: Mutex<Vec<ConversationSummaryPayload>>,
    failing: Mutex<HashSet<ChannelKey>>,
    gates: Mutex<HashMap<ChannelKey, Arc<Semaphore>>>,
    history_calls: Mutex<Vec<ChannelKey>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    next_message_id: AtomicI64,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            histories: Mutex::new(HashMap::new()),
            conversations: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            history_calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(1000),
        })
    }

    pub(crate) async fn set_history(&self, channel: ChannelKey, messages: Vec<MessagePayload>) {
        self.histories.lock().await.insert(channel, messages);
    }

    pub(crate) async fn set_conversations(&self, conversations: Vec<ConversationSummaryPayload>) {
        *self.conversations.lock().await = conversations;
    }

    pub(crate) async fn fail_history(&self, channel: ChannelKey, failing: bool) {
        let mut set = self.failing.lock().await;
        if failing {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }

    /// History fetches for `channel` block until the returned semaphore gets
    /// a permit, one permit per fetch.
    pub(crate) async fn gate(&self, channel: ChannelKey) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().await.insert(channel, Arc::clone(&gate));
        gate
    }

    pub(crate) async fn history_calls(&self, channel: ChannelKey) -> usize {
        self.history_calls
            .lock()
            .await
            .iter()
            .filter(|c| **c == channel)
            .count()
    }

    pub(crate) async fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().await.clone()
    }

    async fn history(&self, channel: ChannelKey) -> Result<Vec<MessagePayload>> {
        self.history_calls.lock().await.push(channel);
        let gate = self.gates.lock().await.get(&channel).cloned();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        if self.failing.lock().await.contains(&channel) {
            bail!("history for {channel} unavailable");
        }
        Ok(self
            .histories
            .lock()
            .await
            .get(&channel)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ConversationBackend for FakeBackend {
    async fn conversations(
        &self,
        _session: &SessionCredentials,
    ) -> Result<Vec<ConversationSummaryPayload>> {
        Ok(self.conversations.lock().await.clone())
    }

    async fn chat_history(
        &self,
        _session: &SessionCredentials,
        peer_id: UserId,
    ) -> Result<Vec<MessagePayload>> {
        self.history(ChannelKey::Direct(peer_id)).await
    }

    async fn group_chat_history(
        &self,
        _session: &SessionCredentials,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>> {
        self.history(ChannelKey::Group(group_id)).await
    }

    async fn send_message(
        &self,
        session: &SessionCredentials,
        message: OutgoingMessage,
    ) -> Result<MessagePayload> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let (receiver_id, group_id) = match message.channel {
            ChannelKey::Direct(peer) => (Some(peer), None),
            ChannelKey::Group(group) => (None, Some(group)),
        };
        let payload = MessagePayload {
            message_id: MessageId(id),
            sender_id: session.user_id,
            receiver_id,
            group_id,
            content: message.content.clone(),
            attachments: Vec::new(),
            sent_at: Utc::now(),
            is_referral: message.referral_target_user_id.is_some(),
            referral_target_user_id: message.referral_target_user_id,
        };
        self.sent.lock().await.push(message);
        Ok(payload)
    }
}
