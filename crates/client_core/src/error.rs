use shared::domain::ChannelKey;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("push transport unavailable: {reason}")]
    TransportUnavailable { reason: String },
    #[error("snapshot fetch failed for {channel}: {reason}")]
    SnapshotFetchFailed { channel: ChannelKey, reason: String },
    #[error("discarded stale result for {channel} (generation {generation})")]
    StaleViewDiscarded { channel: ChannelKey, generation: u64 },
    #[error("failed to join channel {channel}: {reason}")]
    ChannelJoinFailed { channel: ChannelKey, reason: String },
    #[error("conversation list fetch failed: {reason}")]
    ConversationsFetchFailed { reason: String },
    #[error("failed to send message to {channel}: {reason}")]
    SendFailed { channel: ChannelKey, reason: String },
    #[error("no active session")]
    NoSession,
}

impl SyncError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::TransportUnavailable {
            reason: err.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransportUnavailable { .. }
            | SyncError::SnapshotFetchFailed { .. }
            | SyncError::ChannelJoinFailed { .. }
            | SyncError::ConversationsFetchFailed { .. }
            | SyncError::SendFailed { .. } => true,
            SyncError::StaleViewDiscarded { .. } | SyncError::NoSession => false,
        }
    }
}
