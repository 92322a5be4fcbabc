//! Acquiring and storing local media tracks.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use derive_more::Display;
use tracerr::Traced;

use crate::{media::track::local, platform, utils::Caused};

/// Errors occurring when a local media track cannot be acquired.
#[derive(Clone, Debug, Display)]
pub enum MediaManagerError {
    /// Occurs when a microphone or camera track request fails or is denied.
    #[display(fmt = "failed to get local capture device: {}", _0)]
    GetUserMediaFailed(platform::Error),

    /// Occurs when a screen capture request fails or is denied.
    #[display(fmt = "failed to get screen capture: {}", _0)]
    GetDisplayMediaFailed(platform::Error),
}

impl Caused for MediaManagerError {
    fn name(&self) -> &'static str {
        match self {
            Self::GetUserMediaFailed(_) => "GetUserMediaFailed",
            Self::GetDisplayMediaFailed(_) => "GetDisplayMediaFailed",
        }
    }

    fn cause(self) -> Option<platform::Error> {
        match self {
            Self::GetUserMediaFailed(err)
            | Self::GetDisplayMediaFailed(err) => Some(err),
        }
    }
}

type Result<T> = std::result::Result<T, Traced<MediaManagerError>>;

/// Actual data of a [`MediaManager`].
struct InnerMediaManager {
    /// Capture devices of the platform.
    devices: Rc<dyn platform::MediaDevices>,

    /// Obtained local microphone track, if any.
    audio: RefCell<Option<Rc<local::Track>>>,

    /// Obtained local camera track, if any.
    video: RefCell<Option<Rc<local::Track>>>,

    /// Obtained local screen capture track, if any.
    screen: RefCell<Option<Rc<local::Track>>>,

    /// Mute state applied to the microphone track.
    is_muted: Cell<bool>,
}

/// Owner of every local media track of the engine.
///
/// Obtained tracks are cached and shared: every peer connection references
/// the same [`local::Track`] instance, and only this manager ever starts or
/// stops the underlying devices.
pub struct MediaManager(Rc<InnerMediaManager>);

impl MediaManager {
    /// Creates a new [`MediaManager`] working with the provided platform
    /// capture devices.
    #[must_use]
    pub fn new(devices: Rc<dyn platform::MediaDevices>) -> Self {
        Self(Rc::new(InnerMediaManager {
            devices,
            audio: RefCell::new(None),
            video: RefCell::new(None),
            screen: RefCell::new(None),
            is_muted: Cell::new(false),
        }))
    }

    /// Returns the local microphone track, acquiring it on first use.
    ///
    /// # Errors
    ///
    /// With [`MediaManagerError::GetUserMediaFailed`] if permission is denied
    /// or no device exists.
    pub async fn init_audio(&self) -> Result<Rc<local::Track>> {
        if let Some(track) = self.0.audio.borrow().as_ref() {
            return Ok(Rc::clone(track));
        }

        let track = self
            .0
            .devices
            .get_user_audio()
            .await
            .map_err(MediaManagerError::GetUserMediaFailed)
            .map_err(tracerr::wrap!())?;
        let track = Rc::new(local::Track::new(track));
        track.set_enabled(!self.0.is_muted.get());

        self.0.audio.borrow_mut().replace(Rc::clone(&track));
        Ok(track)
    }

    /// Returns the local microphone track, if acquired.
    #[must_use]
    pub fn audio_track(&self) -> Option<Rc<local::Track>> {
        self.0.audio.borrow().clone()
    }

    /// Mutes or unmutes the local microphone track.
    ///
    /// The track stays acquired and attached to every peer connection, it
    /// only stops producing media, so no renegotiation is required.
    pub fn set_muted(&self, is_muted: bool) {
        self.0.is_muted.set(is_muted);
        if let Some(track) = self.0.audio.borrow().as_ref() {
            track.set_enabled(!is_muted);
        }
    }

    /// Indicates whether the local microphone is muted.
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.0.is_muted.get()
    }

    /// Returns the local camera track, acquiring it on first use.
    ///
    /// The returned flag is `true` if the track was newly acquired and so
    /// has to be added to the peer connections' outgoing track sets.
    ///
    /// # Errors
    ///
    /// With [`MediaManagerError::GetUserMediaFailed`] if permission is denied
    /// or no device exists.
    pub async fn enable_video(&self) -> Result<(Rc<local::Track>, bool)> {
        if let Some(track) = self.0.video.borrow().as_ref() {
            return Ok((Rc::clone(track), false));
        }

        let track = self
            .0
            .devices
            .get_user_video()
            .await
            .map_err(MediaManagerError::GetUserMediaFailed)
            .map_err(tracerr::wrap!())?;
        let track = Rc::new(local::Track::new(track));

        self.0.video.borrow_mut().replace(Rc::clone(&track));
        Ok((track, true))
    }

    /// Stops and discards the local camera track, returning it so callers
    /// can detach it from peer connections.
    pub fn disable_video(&self) -> Option<Rc<local::Track>> {
        let track = self.0.video.borrow_mut().take()?;
        track.stop();
        Some(track)
    }

    /// Indicates whether a local camera track is active.
    #[must_use]
    pub fn is_video_on(&self) -> bool {
        self.0.video.borrow().is_some()
    }

    /// Returns the screen capture track, acquiring it on first use.
    ///
    /// The returned flag is `true` if the track was newly acquired.
    ///
    /// # Errors
    ///
    /// With [`MediaManagerError::GetDisplayMediaFailed`] if the capture
    /// request fails or is denied.
    pub async fn enable_screen(&self) -> Result<(Rc<local::Track>, bool)> {
        if let Some(track) = self.0.screen.borrow().as_ref() {
            return Ok((Rc::clone(track), false));
        }

        let track = self
            .0
            .devices
            .get_display_video()
            .await
            .map_err(MediaManagerError::GetDisplayMediaFailed)
            .map_err(tracerr::wrap!())?;
        let track = Rc::new(local::Track::new(track));

        self.0.screen.borrow_mut().replace(Rc::clone(&track));
        Ok((track, true))
    }

    /// Stops and discards the screen capture track, returning it so callers
    /// can detach it from peer connections.
    pub fn disable_screen(&self) -> Option<Rc<local::Track>> {
        let track = self.0.screen.borrow_mut().take()?;
        track.stop();
        Some(track)
    }

    /// Indicates whether a screen capture track is active.
    #[must_use]
    pub fn is_screen_on(&self) -> bool {
        self.0.screen.borrow().is_some()
    }

    /// Returns every currently active local track.
    ///
    /// New peer connections attach all of these as outgoing tracks.
    #[must_use]
    pub fn active_tracks(&self) -> Vec<Rc<local::Track>> {
        [&self.0.audio, &self.0.video, &self.0.screen]
            .iter()
            .filter_map(|slot| slot.borrow().clone())
            .collect()
    }

    /// Stops and discards every local track and resets the mute state.
    ///
    /// Safe to call repeatedly, even if some track was already released.
    pub fn release_all(&self) {
        for slot in &[&self.0.audio, &self.0.video, &self.0.screen] {
            if let Some(track) = slot.borrow_mut().take() {
                track.stop();
            }
        }
        self.0.is_muted.set(false);
    }
}
