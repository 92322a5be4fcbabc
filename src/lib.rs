//! Voice channel presence and signaling engine of the Echo chat client.
//!
//! The engine brings the participants of a voice channel into a full mesh
//! of real-time media connections: each participant keeps exactly one
//! connection to every other participant, negotiated over a pub/sub
//! signaling topic and torn down deterministically on departure. Local
//! mute/video/screen-share toggles and speaking detection are propagated to
//! every peer as presence events.
//!
//! The media stack (peer connections, capture devices), the pub/sub
//! transport and the session-directory REST service are external
//! collaborators, reached through the seams in [`platform`],
//! [`signal::SignalTransport`] and [`directory::SessionDirectory`].
//!
//! The whole engine is single-threaded and event-driven: `!Send` futures,
//! cooperative tasks, no locks.

#![forbid(unsafe_code)]

#[macro_use]
pub mod utils;

pub mod conf;
pub mod directory;
mod echo;
pub mod media;
pub mod participant;
pub mod peer;
pub mod platform;
pub mod session;
pub mod signal;

#[doc(inline)]
pub use self::{
    conf::Conf,
    echo::Echo,
    media::{MediaKind, MediaManager, MediaSourceKind},
    participant::ParticipantHandle,
    session::{Session, SessionError, SessionHandle},
    utils::EngineError,
};

#[doc(inline)]
pub use echo_signal_proto as proto;
