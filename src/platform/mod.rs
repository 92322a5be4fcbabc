//! Abstractions over the host media stack.
//!
//! The engine never talks to a concrete WebRTC implementation: peer
//! connections, capture devices and media tracks are reached through the
//! traits below, implemented by the embedder for its platform. Everything
//! here is `!Send`: the whole engine runs on a single-threaded cooperative
//! executor.

use std::{borrow::Cow, future::Future, rc::Rc, time::Duration};

use async_trait::async_trait;
use derive_more::{Display, From};
use futures::stream::LocalBoxStream;

use echo_signal_proto::IceCandidate;

use crate::{
    conf::IceServer,
    media::{MediaKind, MediaSourceKind},
};

/// Opaque error returned from the underlying media stack.
#[derive(Clone, Debug, Display, Eq, From, PartialEq)]
#[from(forward)]
pub struct Error(Cow<'static, str>);

/// Spawns the provided [`Future`] on the current thread.
///
/// Callers are expected to run inside a [`tokio::task::LocalSet`].
pub fn spawn<F>(task: F)
where
    F: Future<Output = ()> + 'static,
{
    drop(tokio::task::spawn_local(task));
}

/// [`Future`] which resolves after the provided [`Duration`].
pub async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await;
}

/// State of the underlying media connection.
///
/// Mirrors [RTCPeerConnectionState][1].
///
/// [1]: https://w3.org/TR/webrtc/#dom-rtcpeerconnectionstate
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerConnectionState {
    /// Connection is being established.
    New,

    /// At least one transport is in the process of establishing a
    /// connection.
    Connecting,

    /// Every transport is connected.
    Connected,

    /// At least one transport unexpectedly lost connectivity.
    Disconnected,

    /// A transport failed beyond recovery.
    Failed,

    /// Connection has been closed.
    Closed,
}

impl PeerConnectionState {
    /// Indicates whether a connection in this state is beyond use and its
    /// engine-side resources should be torn down.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// SDP to be applied as a remote description.
pub enum SdpType {
    /// SDP offer of a remote peer.
    Offer(String),

    /// SDP answer of a remote peer.
    Answer(String),
}

/// Single media track of the platform, either locally captured or received
/// from a remote peer.
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait MediaStreamTrack {
    /// Returns unique ID of this track.
    fn id(&self) -> String;

    /// Returns the media kind of this track.
    fn kind(&self) -> MediaKind;

    /// Returns the media source kind of this track.
    fn source_kind(&self) -> MediaSourceKind;

    /// Indicates whether this track produces media.
    fn enabled(&self) -> bool;

    /// Enables or disables media production of this track without releasing
    /// the underlying device.
    fn set_enabled(&self, enabled: bool);

    /// Permanently stops this track, releasing the underlying device.
    fn stop(&self);

    /// Stream of normalized `[0.0, 1.0]` audio energy samples, produced on
    /// every rendering tick of the platform.
    ///
    /// Empty stream for non-audio tracks.
    fn audio_level_stream(&self) -> LocalBoxStream<'static, f32>;
}

/// Media connection to a single remote peer.
#[async_trait(?Send)]
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait RtcPeerConnection {
    /// Sets the handler fired on every locally discovered [`IceCandidate`].
    ///
    /// `None` unbinds the current handler.
    fn on_ice_candidate(&self, f: Option<Box<dyn FnMut(IceCandidate)>>);

    /// Sets the handler fired on every media track received from the remote
    /// peer.
    fn on_track(&self, f: Option<Box<dyn FnMut(Rc<dyn MediaStreamTrack>)>>);

    /// Sets the handler fired on every [`PeerConnectionState`] change.
    fn on_connection_state_change(
        &self,
        f: Option<Box<dyn FnMut(PeerConnectionState)>>,
    );

    /// Obtains an SDP offer from this connection and applies it as the local
    /// description.
    async fn create_and_set_offer(&self) -> Result<String, Error>;

    /// Obtains an SDP answer from this connection and applies it as the
    /// local description.
    ///
    /// Must be called only when a remote description is set.
    async fn create_and_set_answer(&self) -> Result<String, Error>;

    /// Applies the provided SDP as the remote description of this
    /// connection.
    async fn set_remote_description(&self, sdp: SdpType) -> Result<(), Error>;

    /// Adds the remote peer's [`IceCandidate`] to this connection.
    ///
    /// Must be called only when a remote description is set.
    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), Error>;

    /// Adds the provided local track to the outgoing track set of this
    /// connection.
    fn add_track(&self, track: Rc<dyn MediaStreamTrack>);

    /// Removes the local track with the provided ID from the outgoing track
    /// set of this connection.
    fn remove_track(&self, track_id: &str);

    /// Closes this connection, releasing its transports.
    fn close(&self);
}

/// Factory of [`RtcPeerConnection`]s.
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait PeerConnectionFactory {
    /// Creates a new media connection configured with the provided
    /// [`IceServer`]s.
    fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Rc<dyn RtcPeerConnection>, Error>;
}

/// Local capture devices of the platform.
#[async_trait(?Send)]
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait MediaDevices {
    /// Prompts for a local microphone track.
    async fn get_user_audio(&self) -> Result<Rc<dyn MediaStreamTrack>, Error>;

    /// Prompts for a local camera track.
    async fn get_user_video(&self) -> Result<Rc<dyn MediaStreamTrack>, Error>;

    /// Prompts for a screen capture track.
    async fn get_display_video(
        &self,
    ) -> Result<Rc<dyn MediaStreamTrack>, Error>;
}
