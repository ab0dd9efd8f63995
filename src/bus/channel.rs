/// The identity the bus connects as. Display-name fields ride along in
/// outgoing call requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
}

/// Logical channels multiplexed over the single broker connection.
///
/// Private keys resolve to a per-user queue; broadcast keys are shared by
/// everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Direct chat messages addressed to the user.
    PrivateMessages,
    /// Delivery acknowledgments for messages the user sent.
    Acknowledgments,
    /// Presence changes of the user's contacts.
    StatusUpdates,
    /// Conversation-list changes (new conversation, last-message updates).
    ConversationUpdates,
    /// Call signaling addressed to the user.
    CallSignals,
    /// Trip lifecycle broadcasts shared by all riders.
    TripEvents,
}

impl ChannelKey {
    pub const ALL: [ChannelKey; 6] = [
        ChannelKey::PrivateMessages,
        ChannelKey::Acknowledgments,
        ChannelKey::StatusUpdates,
        ChannelKey::ConversationUpdates,
        ChannelKey::CallSignals,
        ChannelKey::TripEvents,
    ];

    /// Resolves the concrete broker destination for a user id.
    pub fn destination(&self, user_id: &str) -> String {
        match self {
            ChannelKey::PrivateMessages => format!("/user/{user_id}/queue/messages"),
            ChannelKey::Acknowledgments => format!("/user/{user_id}/queue/acks"),
            ChannelKey::StatusUpdates => format!("/user/{user_id}/queue/status"),
            ChannelKey::ConversationUpdates => format!("/user/{user_id}/queue/conversations"),
            ChannelKey::CallSignals => format!("/user/{user_id}/queue/call"),
            ChannelKey::TripEvents => "/topic/trips".to_string(),
        }
    }

    /// Broadcast channels carry no user id in their destination.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, ChannelKey::TripEvents)
    }
}
