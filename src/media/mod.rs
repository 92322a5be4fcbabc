//! Local media management: track acquisition, sharing and speaking
//! detection.

mod manager;
mod speaking;

pub mod track;

use derive_more::Display;

#[doc(inline)]
pub use self::{
    manager::{MediaManager, MediaManagerError},
    speaking::{SpeakingDetector, SpeakingEvent},
};

/// Media exchange direction of a track.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MediaKind {
    /// Audio track.
    #[display(fmt = "audio")]
    Audio,

    /// Video track.
    #[display(fmt = "video")]
    Video,
}

/// Media source of a track.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaSourceKind {
    /// Media is sourced from a capture device (microphone or camera).
    Device,

    /// Media is sourced from a screen capture.
    Display,
}
