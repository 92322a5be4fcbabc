//! Wrappers around platform media tracks.

/// Locally captured media tracks.
pub mod local {
    use std::{fmt, rc::Rc};

    use futures::stream::LocalBoxStream;

    use crate::{
        media::{MediaKind, MediaSourceKind},
        platform,
    };

    /// Locally captured media track.
    ///
    /// A single [`Track`] is shared by every peer connection of the session
    /// as an outgoing track; it is never duplicated per peer. Only the
    /// `MediaManager` may stop it.
    pub struct Track {
        /// Underlying platform track.
        track: Rc<dyn platform::MediaStreamTrack>,

        /// Media kind of this track.
        kind: MediaKind,

        /// Media source kind of this track.
        source_kind: MediaSourceKind,
    }

    impl fmt::Debug for Track {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Track")
                .field("id", &self.track.id())
                .field("kind", &self.kind)
                .field("source_kind", &self.source_kind)
                .finish()
        }
    }

    impl Track {
        /// Wraps the provided platform track.
        #[must_use]
        pub fn new(track: Rc<dyn platform::MediaStreamTrack>) -> Self {
            let kind = track.kind();
            let source_kind = track.source_kind();
            Self {
                track,
                kind,
                source_kind,
            }
        }

        /// Returns unique ID of this track.
        #[must_use]
        pub fn id(&self) -> String {
            self.track.id()
        }

        /// Returns the media kind of this track.
        #[inline]
        #[must_use]
        pub fn kind(&self) -> MediaKind {
            self.kind
        }

        /// Returns the media source kind of this track.
        #[inline]
        #[must_use]
        pub fn source_kind(&self) -> MediaSourceKind {
            self.source_kind
        }

        /// Indicates whether this track produces media.
        #[must_use]
        pub fn enabled(&self) -> bool {
            self.track.enabled()
        }

        /// Enables or disables media production without releasing the
        /// underlying device.
        pub fn set_enabled(&self, enabled: bool) {
            self.track.set_enabled(enabled);
        }

        /// Stream of normalized audio energy samples of this track.
        #[must_use]
        pub fn audio_level_stream(&self) -> LocalBoxStream<'static, f32> {
            self.track.audio_level_stream()
        }

        /// Returns the underlying platform track.
        #[must_use]
        pub(crate) fn platform_track(
            &self,
        ) -> Rc<dyn platform::MediaStreamTrack> {
            Rc::clone(&self.track)
        }

        /// Permanently stops this track, releasing the underlying device.
        pub(crate) fn stop(&self) {
            self.track.stop();
        }
    }
}

/// Media tracks received from remote participants.
pub mod remote {
    use std::rc::Rc;

    use crate::{media::MediaKind, platform};

    /// Media track received from a remote participant.
    #[derive(Clone)]
    pub struct Track(Rc<dyn platform::MediaStreamTrack>);

    impl Track {
        /// Wraps the provided platform track.
        #[must_use]
        pub fn new(track: Rc<dyn platform::MediaStreamTrack>) -> Self {
            Self(track)
        }

        /// Returns unique ID of this track.
        #[must_use]
        pub fn id(&self) -> String {
            self.0.id()
        }

        /// Returns the media kind of this track.
        #[must_use]
        pub fn kind(&self) -> MediaKind {
            self.0.kind()
        }

        /// Returns the underlying platform track for rendering.
        #[must_use]
        pub fn platform_track(&self) -> Rc<dyn platform::MediaStreamTrack> {
            Rc::clone(&self.0)
        }
    }
}
