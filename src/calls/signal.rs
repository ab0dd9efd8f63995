//! Wire format for call signaling messages.
//!
//! Every message between two call participants travels as one flat JSON
//! envelope on the per-user call channel. The `type` tag selects which of
//! the optional fields are meaningful; unused fields are omitted entirely
//! so ringing messages stay small.

use serde::{Deserialize, Serialize};

use crate::bus::Identity;
use crate::platform::{IceCandidate, SessionDescription};

/// Discriminant for [`CallSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    CallRequest,
    CallAccepted,
    CallRejected,
    CallCancelled,
    CallEnded,
    Offer,
    Answer,
    IceCandidate,
}

/// Audio-only or audio+video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

/// One signaling envelope as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub caller_id: String,
    pub recipient_id: String,
    pub call_type: CallKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl CallSignal {
    fn base(kind: SignalKind, caller_id: &str, recipient_id: &str, call_type: CallKind) -> Self {
        Self {
            kind,
            caller_id: caller_id.to_string(),
            recipient_id: recipient_id.to_string(),
            call_type,
            call_id: None,
            caller_first_name: None,
            caller_last_name: None,
            offer: None,
            answer: None,
            candidate: None,
        }
    }

    /// Ring the recipient. Carries the caller's display name so the callee
    /// can render the incoming-call screen before any profile lookup.
    pub fn request(caller: &Identity, recipient_id: &str, call_type: CallKind, call_id: &str) -> Self {
        let mut signal = Self::base(SignalKind::CallRequest, &caller.user_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal.caller_first_name = Some(caller.first_name.clone());
        signal.caller_last_name = Some(caller.last_name.clone());
        signal
    }

    pub fn accepted(caller_id: &str, recipient_id: &str, call_type: CallKind, call_id: &str) -> Self {
        let mut signal = Self::base(SignalKind::CallAccepted, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal
    }

    pub fn rejected(caller_id: &str, recipient_id: &str, call_type: CallKind, call_id: &str) -> Self {
        let mut signal = Self::base(SignalKind::CallRejected, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal
    }

    pub fn cancelled(caller_id: &str, recipient_id: &str, call_type: CallKind, call_id: &str) -> Self {
        let mut signal = Self::base(SignalKind::CallCancelled, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal
    }

    pub fn ended(caller_id: &str, recipient_id: &str, call_type: CallKind, call_id: &str) -> Self {
        let mut signal = Self::base(SignalKind::CallEnded, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal
    }

    pub fn offer(
        caller_id: &str,
        recipient_id: &str,
        call_type: CallKind,
        call_id: &str,
        description: SessionDescription,
    ) -> Self {
        let mut signal = Self::base(SignalKind::Offer, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal.offer = Some(description);
        signal
    }

    pub fn answer(
        caller_id: &str,
        recipient_id: &str,
        call_type: CallKind,
        call_id: &str,
        description: SessionDescription,
    ) -> Self {
        let mut signal = Self::base(SignalKind::Answer, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal.answer = Some(description);
        signal
    }

    pub fn ice_candidate(
        caller_id: &str,
        recipient_id: &str,
        call_type: CallKind,
        call_id: &str,
        candidate: IceCandidate,
    ) -> Self {
        let mut signal = Self::base(SignalKind::IceCandidate, caller_id, recipient_id, call_type);
        signal.call_id = Some(call_id.to_string());
        signal.candidate = Some(candidate);
        signal
    }

    /// True when this envelope correlates with the given call id.
    pub fn matches_call(&self, call_id: &str) -> bool {
        self.call_id.as_deref() == Some(call_id)
    }
}
