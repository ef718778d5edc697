use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelKey, MessageId, Surface, UserId},
    error::ApiError,
    protocol::{AttachmentPayload, MessagePayload},
};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub file_url: String,
}

impl From<&AttachmentPayload> for Attachment {
    fn from(value: &AttachmentPayload) -> Self {
        Self {
            file_name: value.file_name.clone(),
            file_url: value.file_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel: ChannelKey,
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub is_referral: bool,
    pub referral_target_user_id: Option<UserId>,
}

pub type OrderKey = (DateTime<Utc>, MessageId);

impl Message {
    /// Builds a message as seen by `viewer`, or `None` when the payload does
    /// not belong to any of the viewer's conversations.
    pub fn from_payload(payload: &MessagePayload, viewer: UserId) -> Option<Self> {
        let channel = payload.channel_for(viewer)?;
        Some(Self::in_channel(channel, payload))
    }

    pub fn in_channel(channel: ChannelKey, payload: &MessagePayload) -> Self {
        Self {
            id: payload.message_id,
            channel,
            sender_id: payload.sender_id,
            content: payload.content.clone(),
            attachments: payload.attachments.iter().map(Attachment::from).collect(),
            timestamp: payload.sent_at,
            is_referral: payload.is_referral,
            referral_target_user_id: payload.referral_target_user_id,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        (self.timestamp, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub channel: ChannelKey,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_message: Message,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Yours,
    Theirs,
}

impl ConversationSummary {
    pub fn is_unread(&self) -> bool {
        self.unread_count > 0
    }

    pub fn turn(&self, viewer: UserId) -> Turn {
        if self.last_message.sender_id == viewer {
            Turn::Theirs
        } else {
            Turn::Yours
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPartition {
    pub your_turn: Vec<ConversationSummary>,
    pub their_turn: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTransition {
    pub from: TransportState,
    pub to: TransportState,
    /// Connection epoch after the transition; bumps on every entry into
    /// `Connected`.
    pub epoch: u64,
}

impl LinkTransition {
    pub fn is_reconnect(&self) -> bool {
        self.from == TransportState::Reconnecting && self.to == TransportState::Connected
    }

    pub fn is_link_lost(&self) -> bool {
        self.from == TransportState::Connected
            && matches!(
                self.to,
                TransportState::Reconnecting | TransportState::Disconnected
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    Idle,
    Loading,
    Live,
    Resyncing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewStatus {
    pub surface: Surface,
    pub channel: Option<ChannelKey>,
    pub phase: ViewPhase,
    pub generation: u64,
    pub error: Option<SyncError>,
    pub live_updates_degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Live,
    AlreadyLive,
    Superseded,
}

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub channel: ChannelKey,
    pub content: String,
    pub attachments: Vec<AttachmentUpload>,
    pub referral_target_user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub user_id: UserId,
    pub auth_token: String,
}

impl SessionCredentials {
    pub fn new(user_id: UserId, auth_token: impl Into<String>) -> Self {
        Self {
            user_id,
            auth_token: auth_token.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    TransportChanged(TransportState),
    ViewChanged(ViewStatus),
    MessagesChanged { channel: ChannelKey },
    SummariesChanged,
    NotificationsChanged,
    Error(SyncError),
    ServerError(ApiError),
}
