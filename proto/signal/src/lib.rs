//! Signaling protocol of Echo voice channels.
//!
//! Every participant of a voice channel publishes and consumes the same set
//! of [`Event`]s on the channel's pub/sub topic (`voice:<channel id>`), so
//! there is no client/server message split: the enum below is the whole wire
//! surface. Events are framed as `{"event": "...", "data": {...}}` with
//! kebab-case event names and camelCase payload fields.
//!
//! The session-directory REST service answers rosters shaped as
//! [`ParticipantInfo`], which is exactly the `voice-join` payload minus the
//! event framing.

#![forbid(unsafe_code)]

use derive_more::{Constructor, Display, From};
use medea_macro::dispatchable;
use serde::{Deserialize, Serialize};

/// ID of a voice channel.
#[derive(
    Clone, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize,
)]
#[from(forward)]
pub struct ChannelId(pub String);

/// ID of a channel participant.
#[derive(
    Clone, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize,
)]
#[from(forward)]
pub struct ParticipantId(pub String);

/// Snapshot of one participant's presence in a voice channel.
///
/// Broadcast as the `voice-join` payload and returned by the session
/// directory as a roster entry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// ID of the participant.
    pub user_id: ParticipantId,

    /// Display name of the participant.
    pub username: String,

    /// Avatar of the participant, if one is set.
    pub avatar_url: Option<String>,

    /// Indicator whether the participant's microphone is muted.
    pub is_muted: bool,

    /// Indicator whether the participant publishes camera video.
    pub has_video: bool,

    /// Indicator whether the participant publishes a screen capture.
    pub is_screen_sharing: bool,
}

/// [ICE candidate][1] of a media connection, relayed between two peers.
///
/// [1]: https://tools.ietf.org/html/rfc5245#section-2
#[derive(Clone, Constructor, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// [`candidate` field][1] of the discovered candidate.
    ///
    /// [1]: https://w3.org/TR/webrtc/#dom-rtcicecandidate-candidate
    pub candidate: String,

    /// [`sdpMLineIndex` field][1] of the discovered candidate.
    ///
    /// [1]: https://w3.org/TR/webrtc/#dom-rtcicecandidate-sdpmlineindex
    pub sdp_m_line_index: Option<u16>,

    /// [`sdpMid` field][1] of the discovered candidate.
    ///
    /// [1]: https://w3.org/TR/webrtc/#dom-rtcicecandidate-sdpmid
    pub sdp_mid: Option<String>,
}

/// Events published on a voice channel topic.
///
/// Presence events (`voice-*`) address the whole channel; negotiation events
/// (`webrtc-*`) carry an explicit addressee and are ignored by everyone
/// else. Delivery is at-least-once with no ordering guarantee across
/// different event kinds.
#[dispatchable(self: &Self, async_trait(?Send))]
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Event {
    /// Participant entered the channel.
    VoiceJoin {
        /// ID of the joined participant.
        user_id: ParticipantId,

        /// Display name of the joined participant.
        username: String,

        /// Avatar of the joined participant.
        avatar_url: Option<String>,

        /// Mute state the participant joined with.
        is_muted: bool,

        /// Camera state the participant joined with.
        has_video: bool,

        /// Screen-capture state the participant joined with.
        is_screen_sharing: bool,
    },

    /// Participant left the channel.
    VoiceLeave {
        /// ID of the left participant.
        user_id: ParticipantId,
    },

    /// Participant muted or unmuted its microphone.
    VoiceMuteUpdate {
        /// ID of the updated participant.
        user_id: ParticipantId,

        /// New mute state.
        is_muted: bool,
    },

    /// Participant enabled or disabled its camera.
    VoiceVideoUpdate {
        /// ID of the updated participant.
        user_id: ParticipantId,

        /// New camera state.
        has_video: bool,
    },

    /// Participant started or stopped sharing its screen.
    VoiceScreenUpdate {
        /// ID of the updated participant.
        user_id: ParticipantId,

        /// New screen-capture state.
        is_screen_sharing: bool,
    },

    /// Participant started speaking.
    VoiceSpeaking {
        /// ID of the speaking participant.
        user_id: ParticipantId,
    },

    /// Participant stopped speaking.
    VoiceStopped {
        /// ID of the participant that went silent.
        user_id: ParticipantId,
    },

    /// SDP offer relayed to a single addressee.
    WebrtcOffer {
        /// ID of the offering participant.
        from_user_id: ParticipantId,

        /// ID of the addressee.
        to_user_id: ParticipantId,

        /// SDP offer text.
        sdp: String,
    },

    /// SDP answer relayed to a single addressee.
    WebrtcAnswer {
        /// ID of the answering participant.
        from_user_id: ParticipantId,

        /// ID of the addressee.
        to_user_id: ParticipantId,

        /// SDP answer text.
        sdp: String,
    },

    /// ICE candidate relayed to a single addressee.
    WebrtcIce {
        /// ID of the participant that discovered the candidate.
        from_user_id: ParticipantId,

        /// ID of the addressee.
        to_user_id: ParticipantId,

        /// The discovered candidate.
        candidate: IceCandidate,
    },
}

impl Event {
    /// Returns the addressee of this [`Event`], if it is a directed
    /// negotiation event.
    #[must_use]
    pub fn to_user_id(&self) -> Option<&ParticipantId> {
        match self {
            Self::WebrtcOffer { to_user_id, .. }
            | Self::WebrtcAnswer { to_user_id, .. }
            | Self::WebrtcIce { to_user_id, .. } => Some(to_user_id),
            _ => None,
        }
    }
}

impl From<ParticipantInfo> for Event {
    fn from(info: ParticipantInfo) -> Self {
        Self::VoiceJoin {
            user_id: info.user_id,
            username: info.username,
            avatar_url: info.avatar_url,
            is_muted: info.is_muted,
            has_video: info.has_video,
            is_screen_sharing: info.is_screen_sharing,
        }
    }
}
