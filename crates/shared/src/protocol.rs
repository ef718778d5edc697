use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelKey, GroupId, MessageId, NotificationId, NotificationKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub file_name: String,
    pub file_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_referral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_target_user_id: Option<UserId>,
}

impl MessagePayload {
    /// Resolves the conversation this message belongs to from `viewer`'s
    /// point of view. Direct messages that do not involve `viewer` have none.
    pub fn channel_for(&self, viewer: UserId) -> Option<ChannelKey> {
        if let Some(group_id) = self.group_id {
            return Some(ChannelKey::Group(group_id));
        }
        let receiver_id = self.receiver_id?;
        if self.sender_id == viewer {
            Some(ChannelKey::Direct(receiver_id))
        } else if receiver_id == viewer {
            Some(ChannelKey::Direct(self.sender_id))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummaryPayload {
    pub channel: ChannelKey,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub last_message: MessagePayload,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    pub kind: NotificationKind,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    #[serde(default)]
    pub is_referral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_target_user_id: Option<UserId>,
}

impl SendMessageRequest {
    pub fn new(sender_id: UserId, channel: ChannelKey, content: impl Into<String>) -> Self {
        let (receiver_id, group_id) = match channel {
            ChannelKey::Direct(peer) => (Some(peer), None),
            ChannelKey::Group(group) => (None, Some(group)),
        };
        Self {
            sender_id,
            receiver_id,
            group_id,
            content: content.into(),
            is_referral: false,
            referral_target_user_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinDirect { peer_id: UserId },
    LeaveDirect { peer_id: UserId },
    JoinGroup { group_id: GroupId },
    LeaveGroup { group_id: GroupId },
}

impl ClientRequest {
    pub fn join(channel: ChannelKey) -> Self {
        match channel {
            ChannelKey::Direct(peer_id) => ClientRequest::JoinDirect { peer_id },
            ChannelKey::Group(group_id) => ClientRequest::JoinGroup { group_id },
        }
    }

    pub fn leave(channel: ChannelKey) -> Self {
        match channel {
            ChannelKey::Direct(peer_id) => ClientRequest::LeaveDirect { peer_id },
            ChannelKey::Group(group_id) => ClientRequest::LeaveGroup { group_id },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    ReceiveMessage,
    ReceiveGroupMessage,
    ReceiveNotification,
    UpdateNotifications,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        message: MessagePayload,
    },
    ReceiveGroupMessage {
        message: MessagePayload,
    },
    ReceiveNotification {
        notification: NotificationPayload,
    },
    UpdateNotifications {
        notifications: Vec<NotificationPayload>,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::ReceiveMessage { .. } => ServerEventKind::ReceiveMessage,
            ServerEvent::ReceiveGroupMessage { .. } => ServerEventKind::ReceiveGroupMessage,
            ServerEvent::ReceiveNotification { .. } => ServerEventKind::ReceiveNotification,
            ServerEvent::UpdateNotifications { .. } => ServerEventKind::UpdateNotifications,
            ServerEvent::Error(_) => ServerEventKind::Error,
        }
    }

    pub fn message(&self) -> Option<&MessagePayload> {
        match self {
            ServerEvent::ReceiveMessage { message }
            | ServerEvent::ReceiveGroupMessage { message } => Some(message),
            _ => None,
        }
    }
}

impl ServerEventKind {
    pub fn for_channel(channel: ChannelKey) -> Self {
        match channel {
            ChannelKey::Direct(_) => ServerEventKind::ReceiveMessage,
            ChannelKey::Group(_) => ServerEventKind::ReceiveGroupMessage,
        }
    }
}
