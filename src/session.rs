//! Voice channel session.
//!
//! The [`Session`] is the top-level state machine of the engine: it
//! orchestrates joining and leaving a voice channel, reconciles the
//! participant roster, drives the offer/answer exchange of every peer
//! connection, propagates local media-state changes and keeps the external
//! session directory in sync.

use std::{
    cell::{Cell, RefCell},
    ops::Deref as _,
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use derive_more::{Display, From};
use futures::{channel::mpsc, StreamExt as _};
use tracerr::Traced;

use echo_signal_proto::{
    ChannelId, Event, EventHandler, IceCandidate, ParticipantId,
    ParticipantInfo,
};

use crate::{
    conf::Conf,
    directory::{DirectoryError, SessionDirectory},
    media::{
        track::remote, MediaManager, MediaManagerError, SpeakingDetector,
        SpeakingEvent,
    },
    participant::{ParticipantHandle, Participants},
    peer::{
        NegotiationState, PeerError, PeerEvent, PeerEventHandler,
        PeerRepository,
    },
    platform,
    signal::{SignalTransport, SignalingChannel, TransportError},
    utils::{Callback, Caused, EngineError},
};

/// Errors that may occur in a [`Session`].
#[derive(Clone, Debug, Display, From)]
pub enum SessionError {
    /// Returned on a join attempt while already joined.
    #[display(fmt = "session is already joined to a voice channel")]
    AlreadyJoined,

    /// Returned on an operation requiring the session to be joined.
    #[display(fmt = "session is not joined to any voice channel")]
    NotJoined,

    /// Local media could not be acquired.
    #[display(fmt = "failed to get local media: {}", _0)]
    CouldNotGetLocalMedia(MediaManagerError),

    /// Signaling channel could not be opened or used.
    #[display(fmt = "signaling channel error: {}", _0)]
    Transport(TransportError),

    /// Session directory request failed.
    #[display(fmt = "session directory error: {}", _0)]
    Directory(DirectoryError),

    /// Signaling with some remote peer failed.
    #[display(fmt = "peer connection error: {}", _0)]
    Peer(PeerError),

    /// Directed signaling event referred to a peer without an entry.
    #[display(fmt = "no peer connection for participant {}", _0)]
    #[from(ignore)]
    NoSuchPeer(ParticipantId),

    /// Remote media track arrived from a participant missing in the roster.
    #[display(fmt = "remote track from unknown participant")]
    UnknownParticipant,
}

impl Caused for SessionError {
    fn name(&self) -> &'static str {
        match self {
            Self::AlreadyJoined => "AlreadyJoined",
            Self::NotJoined => "NotJoined",
            Self::CouldNotGetLocalMedia(err) => err.name(),
            Self::Transport(err) => err.name(),
            Self::Directory(err) => err.name(),
            Self::Peer(err) => err.name(),
            Self::NoSuchPeer(_) => "NoSuchPeer",
            Self::UnknownParticipant => "UnknownParticipant",
        }
    }

    fn cause(self) -> Option<platform::Error> {
        match self {
            Self::CouldNotGetLocalMedia(err) => err.cause(),
            Self::Transport(err) => err.cause(),
            Self::Directory(err) => err.cause(),
            Self::Peer(err) => err.cause(),
            Self::AlreadyJoined
            | Self::NotJoined
            | Self::NoSuchPeer(_)
            | Self::UnknownParticipant => None,
        }
    }
}

type Result<T> = std::result::Result<T, Traced<SessionError>>;

/// Voice channel session, where all the media happens.
///
/// For using a [`Session`] on the embedder side, consider the
/// [`SessionHandle`].
pub struct Session(Rc<InnerSession>);

impl Session {
    /// Creates a new detached [`Session`] over the provided seams and
    /// spawns its event loop.
    ///
    /// `me` is the local participant's identity; its media flags are owned
    /// by the created session from here on.
    #[must_use]
    pub fn new(
        me: ParticipantInfo,
        transport: Rc<dyn SignalTransport>,
        directory: Rc<dyn SessionDirectory>,
        factory: Rc<dyn platform::PeerConnectionFactory>,
        media_manager: Rc<MediaManager>,
        conf: Conf,
    ) -> Self {
        /// Event of the session's main loop.
        enum SessionEvent {
            /// Event delivered by the signaling channel.
            Signal(Event),

            /// Event emitted by some peer connection.
            Peer(PeerEvent),

            /// Transition of the local speaking state.
            Speaking(SpeakingEvent),
        }

        let (peer_events_tx, peer_events_rx) = mpsc::unbounded();
        let (speaking, speaking_events_rx) =
            SpeakingDetector::new(conf.speaking.clone());
        let peers = PeerRepository::new(
            factory,
            conf.ice.servers.clone(),
            Rc::clone(&media_manager),
            peer_events_tx,
        );

        let mut signal_rx =
            transport.on_message().map(SessionEvent::Signal).fuse();
        let mut peer_rx = peer_events_rx.map(SessionEvent::Peer).fuse();
        let mut speaking_rx =
            speaking_events_rx.map(SessionEvent::Speaking).fuse();

        let inner = Rc::new(InnerSession {
            me: RefCell::new(me),
            transport,
            directory,
            media_manager,
            channel: RefCell::new(None),
            channel_id: RefCell::new(None),
            peers,
            participants: Participants::default(),
            speaking,
            is_joined: Cell::new(false),
            is_speaking: Cell::new(false),
            on_joined: Callback::default(),
            on_error: Callback::default(),
        });

        let weak_inner = Rc::downgrade(&inner);
        platform::spawn(async move {
            loop {
                let event: SessionEvent = futures::select! {
                    event = signal_rx.select_next_some() => event,
                    event = peer_rx.select_next_some() => event,
                    event = speaking_rx.select_next_some() => event,
                    complete => break,
                };

                let inner = match weak_inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                match event {
                    SessionEvent::Signal(event) => {
                        if let Err(e) =
                            event.dispatch_with(inner.deref()).await
                        {
                            EngineError::from(e).print();
                        }
                    }
                    SessionEvent::Peer(event) => {
                        if let Err(e) =
                            event.dispatch_with(inner.deref()).await
                        {
                            EngineError::from(e).print();
                        }
                    }
                    SessionEvent::Speaking(event) => {
                        inner.handle_speaking(event);
                    }
                }
            }
        });

        Self(inner)
    }

    /// Creates a new external [`SessionHandle`] to this [`Session`].
    #[must_use]
    pub fn new_handle(&self) -> SessionHandle {
        SessionHandle(Rc::downgrade(&self.0))
    }

    /// Leaves the joined channel (if any) and consumes this [`Session`].
    pub fn close(self) {
        let inner = self.0;
        platform::spawn(async move {
            inner.leave().await;
        });
    }
}

/// External handle to a [`Session`].
///
/// Actually, represents a [`Weak`]-based handle to `InnerSession`.
pub struct SessionHandle(Weak<InnerSession>);

impl SessionHandle {
    /// Joins the provided voice channel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyJoined`] if the session is joined already;
    /// - [`SessionError::CouldNotGetLocalMedia`] if the microphone cannot
    ///   be acquired, in which case no state is changed.
    ///
    /// Connectivity failures past local media acquisition degrade the
    /// session instead of failing it and are surfaced through the
    /// `on_error` callback.
    pub async fn join(
        &self,
        channel_id: ChannelId,
    ) -> std::result::Result<(), EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.join(channel_id).await.map_err(EngineError::from)
    }

    /// Leaves the joined voice channel.
    ///
    /// Idempotent and callable from any state, including mid-negotiation:
    /// every connection, track, subscription and timer is released
    /// deterministically.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub async fn leave(&self) -> std::result::Result<(), EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.leave().await;
        Ok(())
    }

    /// Toggles the local microphone mute state, returning the new state.
    ///
    /// Muting only disables the shared audio track, so no renegotiation
    /// happens.
    ///
    /// # Errors
    ///
    /// With [`SessionError::NotJoined`] if the session is not joined.
    pub async fn toggle_mute(&self) -> std::result::Result<bool, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.toggle_mute().await.map_err(EngineError::from)
    }

    /// Toggles the local camera, returning the new state.
    ///
    /// Turning the camera on or off changes the shared track set, so every
    /// peer connection in stable state is renegotiated.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotJoined`] if the session is not joined;
    /// - [`SessionError::CouldNotGetLocalMedia`] if the camera cannot be
    ///   acquired; only this toggle is aborted then.
    pub async fn toggle_video(
        &self,
    ) -> std::result::Result<bool, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.toggle_video().await.map_err(EngineError::from)
    }

    /// Toggles the local screen capture, returning the new state.
    ///
    /// # Errors
    ///
    /// Same as [`SessionHandle::toggle_video()`].
    pub async fn toggle_screen_share(
        &self,
    ) -> std::result::Result<bool, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.toggle_screen_share().await.map_err(EngineError::from)
    }

    /// Indicates whether the session is currently joined to a channel.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn is_joined(&self) -> std::result::Result<bool, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        Ok(inner.is_joined.get())
    }

    /// Indicates whether the local participant currently counts as
    /// speaking.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn is_speaking(&self) -> std::result::Result<bool, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        Ok(inner.is_speaking.get())
    }

    /// Sets the callback invoked once per successful join, when the local
    /// participant enters the voice channel (the "join sound" hook).
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn on_joined<F>(&self, f: F) -> std::result::Result<(), EngineError>
    where
        F: Fn(()) + 'static,
    {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.on_joined.set_func(f);
        Ok(())
    }

    /// Sets the callback invoked on every non-fatal engine failure.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn on_error<F>(&self, f: F) -> std::result::Result<(), EngineError>
    where
        F: Fn(EngineError) + 'static,
    {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.on_error.set_func(f);
        Ok(())
    }

    /// Sets the callback invoked when a remote participant appears in the
    /// roster.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn on_new_participant<F>(
        &self,
        f: F,
    ) -> std::result::Result<(), EngineError>
    where
        F: Fn(ParticipantHandle) + 'static,
    {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        inner.participants.on_new_participant(f);
        Ok(())
    }

    /// Returns IDs of every remote participant currently in the roster.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the session was disposed.
    ///
    /// [`HandlerDetachedError`]: crate::utils::HandlerDetachedError
    pub fn participants(
        &self,
    ) -> std::result::Result<Vec<ParticipantId>, EngineError> {
        let inner = upgrade_or_detached!(self.0, EngineError)?;
        Ok(inner.participants.ids())
    }
}

/// Actual data of a [`Session`].
struct InnerSession {
    /// Snapshot of the local participant.
    ///
    /// Mutated only locally and echoed to others via `voice-*` events.
    me: RefCell<ParticipantInfo>,

    /// Underlying pub/sub transport.
    transport: Rc<dyn SignalTransport>,

    /// External session directory.
    directory: Rc<dyn SessionDirectory>,

    /// Owner of the shared local tracks.
    media_manager: Rc<MediaManager>,

    /// Open signaling channel of the joined voice channel.
    channel: RefCell<Option<SignalingChannel>>,

    /// ID of the joined voice channel.
    channel_id: RefCell<Option<ChannelId>>,

    /// Repository of connections to remote participants.
    peers: PeerRepository,

    /// Roster of remote participants.
    participants: Participants,

    /// Detector of the local speaking state.
    speaking: SpeakingDetector,

    /// Indicator whether the local participant is in voice.
    is_joined: Cell<bool>,

    /// Speaking state of the local participant.
    is_speaking: Cell<bool>,

    /// Callback invoked once per successful join.
    on_joined: Callback<()>,

    /// Callback invoked on every non-fatal engine failure.
    on_error: Callback<EngineError>,
}

impl InnerSession {
    /// Implementation of [`SessionHandle::join()`].
    async fn join(&self, channel_id: ChannelId) -> Result<()> {
        if self.is_joined.get() {
            return Err(tracerr::new!(SessionError::AlreadyJoined));
        }

        // Local media comes first: a denied microphone aborts the join
        // with no state changed at all.
        let audio = self
            .media_manager
            .init_audio()
            .await
            .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;
        self.speaking.start(audio.audio_level_stream());

        self.is_joined.set(true);
        self.channel_id.replace(Some(channel_id.clone()));
        self.on_joined.call0();

        // Anything past this point degrades the session instead of
        // rolling back: partial connectivity beats silent failure.
        let me_info = self.me.borrow().clone();
        if let Err(e) =
            self.directory.register(&channel_id, &me_info).await
        {
            self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
        }

        match SignalingChannel::open(
            Rc::clone(&self.transport),
            &channel_id,
        )
        .await
        {
            Ok(channel) => {
                self.channel.replace(Some(channel));
                self.broadcast(Event::from(self.me.borrow().clone()));
                if let Err(e) = self.connect_existing(&channel_id).await {
                    self.report(e);
                }
            }
            Err(e) => {
                self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
            }
        }

        Ok(())
    }

    /// Implementation of [`SessionHandle::leave()`].
    ///
    /// Never fails: every cleanup failure is reported and the teardown
    /// carries on.
    async fn leave(&self) {
        if !self.is_joined.get() {
            return;
        }
        self.is_joined.set(false);
        self.is_speaking.set(false);
        self.speaking.stop();

        let user_id = self.me.borrow().user_id.clone();
        if let Some(channel) = self.channel.borrow_mut().take() {
            if let Err(e) = channel.send(&Event::VoiceLeave { user_id }) {
                log::warn!(
                    "failed to broadcast voice-leave: {}",
                    EngineError::from(e),
                );
            }
            channel.close();
        }

        if let Some(channel_id) = self.channel_id.borrow_mut().take() {
            if let Err(e) = self.directory.deregister(&channel_id).await {
                self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
            }
        }

        self.peers.close_all();
        self.media_manager.release_all();
        self.participants.clear();

        let mut me = self.me.borrow_mut();
        me.is_muted = false;
        me.has_video = false;
        me.is_screen_sharing = false;
    }

    /// Implementation of [`SessionHandle::toggle_mute()`].
    async fn toggle_mute(&self) -> Result<bool> {
        self.ensure_joined()?;
        let is_muted = !self.media_manager.is_muted();

        self.media_manager.set_muted(is_muted);
        self.me.borrow_mut().is_muted = is_muted;
        self.speaking.set_muted(is_muted);

        self.persist_flag(|channel_id| {
            let directory = Rc::clone(&self.directory);
            async move { directory.set_muted(&channel_id, is_muted).await }
        })
        .await;

        let user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::VoiceMuteUpdate { user_id, is_muted });
        Ok(is_muted)
    }

    /// Implementation of [`SessionHandle::toggle_video()`].
    async fn toggle_video(&self) -> Result<bool> {
        self.ensure_joined()?;
        let has_video = !self.media_manager.is_video_on();

        if has_video {
            let (track, is_new) = self
                .media_manager
                .enable_video()
                .await
                .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;
            if is_new {
                self.peers.add_local_track_to_all(&track);
                self.renegotiate_stable();
            }
        } else if let Some(track) = self.media_manager.disable_video() {
            self.peers.remove_local_track_from_all(&track.id());
            self.renegotiate_stable();
        }
        self.me.borrow_mut().has_video = has_video;

        self.persist_flag(|channel_id| {
            let directory = Rc::clone(&self.directory);
            async move { directory.set_video(&channel_id, has_video).await }
        })
        .await;

        let user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::VoiceVideoUpdate { user_id, has_video });
        Ok(has_video)
    }

    /// Implementation of [`SessionHandle::toggle_screen_share()`].
    async fn toggle_screen_share(&self) -> Result<bool> {
        self.ensure_joined()?;
        let is_screen_sharing = !self.media_manager.is_screen_on();

        if is_screen_sharing {
            let (track, is_new) = self
                .media_manager
                .enable_screen()
                .await
                .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;
            if is_new {
                self.peers.add_local_track_to_all(&track);
                self.renegotiate_stable();
            }
        } else if let Some(track) = self.media_manager.disable_screen() {
            self.peers.remove_local_track_from_all(&track.id());
            self.renegotiate_stable();
        }
        self.me.borrow_mut().is_screen_sharing = is_screen_sharing;

        self.persist_flag(|channel_id| {
            let directory = Rc::clone(&self.directory);
            async move {
                directory
                    .set_screen_share(&channel_id, is_screen_sharing)
                    .await
            }
        })
        .await;

        let user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::VoiceScreenUpdate {
            user_id,
            is_screen_sharing,
        });
        Ok(is_screen_sharing)
    }

    /// Errors if the session is not joined to any channel.
    fn ensure_joined(&self) -> Result<()> {
        if self.is_joined.get() {
            Ok(())
        } else {
            Err(tracerr::new!(SessionError::NotJoined))
        }
    }

    /// Persists a local media flag through the session directory, reporting
    /// (but not propagating) failures.
    async fn persist_flag<F, Fut>(&self, request: F)
    where
        F: FnOnce(ChannelId) -> Fut,
        Fut: std::future::Future<
            Output = std::result::Result<(), Traced<DirectoryError>>,
        >,
    {
        let channel_id = self.channel_id.borrow().clone();
        if let Some(channel_id) = channel_id {
            if let Err(e) = request(channel_id).await {
                self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
            }
        }
    }

    /// Fetches the current roster of the joined channel and drives an
    /// outbound offer to every existing participant.
    ///
    /// Each peer is negotiated in its own task: one failing or slow peer
    /// never stalls the others.
    async fn connect_existing(&self, channel_id: &ChannelId) -> Result<()> {
        let mut rosters = self
            .directory
            .sessions(std::slice::from_ref(channel_id))
            .await
            .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;

        let me = self.me.borrow().user_id.clone();
        for info in rosters.remove(channel_id).unwrap_or_default() {
            if info.user_id == me {
                continue;
            }
            let remote_id = info.user_id.clone();
            self.participants.create_participant(info);
            self.start_offer_to(&remote_id);
        }
        Ok(())
    }

    /// Creates (or reuses) the entry of the provided participant and starts
    /// an outbound offer on it.
    fn start_offer_to(&self, remote_id: &ParticipantId) {
        match self.peers.get_or_create(remote_id) {
            Ok(peer) => {
                if let Err(e) = peer.start_offer() {
                    self.peers.close(remote_id);
                    self.report(
                        tracerr::map_from_and_wrap!(=> SessionError)(e),
                    );
                }
            }
            Err(e) => {
                self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
            }
        }
    }

    /// Starts renegotiation on every peer entry in stable state.
    ///
    /// Entries in the middle of a negotiation are silently skipped: their
    /// peers keep a consistent (if stale) track set, and the next
    /// state-changing action re-triggers the renegotiation.
    fn renegotiate_stable(&self) {
        for peer in self.peers.get_all() {
            if peer.state() != NegotiationState::Stable {
                continue;
            }
            if let Err(e) = peer.start_offer() {
                self.peers.close(&peer.remote_id());
                self.report(tracerr::map_from_and_wrap!(=> SessionError)(e));
            }
        }
    }

    /// Broadcasts the provided [`Event`] on the joined channel's topic.
    ///
    /// Fire-and-forget: send failures are logged and retrying is the
    /// transport's job.
    fn broadcast(&self, event: Event) {
        if let Some(channel) = self.channel.borrow().as_ref() {
            if let Err(e) = channel.send(&event) {
                log::warn!(
                    "signaling send failed: {}",
                    EngineError::from(e),
                );
            }
        }
    }

    /// Handles a local [`SpeakingEvent`] transition.
    fn handle_speaking(&self, event: SpeakingEvent) {
        if !self.is_joined.get() {
            return;
        }
        let user_id = self.me.borrow().user_id.clone();
        match event {
            SpeakingEvent::Speaking => {
                self.is_speaking.set(true);
                self.broadcast(Event::VoiceSpeaking { user_id });
            }
            SpeakingEvent::Stopped => {
                self.is_speaking.set(false);
                self.broadcast(Event::VoiceStopped { user_id });
            }
        }
    }

    /// Surfaces the provided error through the `on_error` callback and the
    /// log.
    fn report(&self, err: Traced<SessionError>) {
        let err = EngineError::from(err);
        err.print();
        self.on_error.call(err);
    }

    /// Indicates whether the provided ID belongs to the local participant.
    fn is_me(&self, user_id: &ParticipantId) -> bool {
        self.me.borrow().user_id == *user_id
    }
}

/// Signaling events handling.
#[async_trait(?Send)]
impl EventHandler for InnerSession {
    type Output = Result<()>;

    /// Inserts the joined participant into the roster.
    ///
    /// No connection is created here: the joining side drives the offers
    /// to every participant it found in the directory.
    async fn on_voice_join(
        &self,
        user_id: ParticipantId,
        username: String,
        avatar_url: Option<String>,
        is_muted: bool,
        has_video: bool,
        is_screen_sharing: bool,
    ) -> Self::Output {
        if self.is_me(&user_id) {
            return Ok(());
        }
        self.participants.create_participant(ParticipantInfo {
            user_id,
            username,
            avatar_url,
            is_muted,
            has_video,
            is_screen_sharing,
        });
        Ok(())
    }

    /// Removes the left participant from the roster and discards its peer
    /// entry.
    async fn on_voice_leave(&self, user_id: ParticipantId) -> Self::Output {
        if self.is_me(&user_id) {
            return Ok(());
        }
        self.participants.remove(&user_id);
        self.peers.close(&user_id);
        Ok(())
    }

    /// Patches the mute flag of the named participant.
    async fn on_voice_mute_update(
        &self,
        user_id: ParticipantId,
        is_muted: bool,
    ) -> Self::Output {
        if !self.is_me(&user_id) {
            if let Some(participant) = self.participants.get(&user_id) {
                participant.set_muted(is_muted);
            }
        }
        Ok(())
    }

    /// Patches the camera flag of the named participant.
    async fn on_voice_video_update(
        &self,
        user_id: ParticipantId,
        has_video: bool,
    ) -> Self::Output {
        if !self.is_me(&user_id) {
            if let Some(participant) = self.participants.get(&user_id) {
                participant.set_has_video(has_video);
            }
        }
        Ok(())
    }

    /// Patches the screen-share flag of the named participant.
    async fn on_voice_screen_update(
        &self,
        user_id: ParticipantId,
        is_screen_sharing: bool,
    ) -> Self::Output {
        if !self.is_me(&user_id) {
            if let Some(participant) = self.participants.get(&user_id) {
                participant.set_screen_sharing(is_screen_sharing);
            }
        }
        Ok(())
    }

    /// Raises the speaking flag of the named participant.
    async fn on_voice_speaking(
        &self,
        user_id: ParticipantId,
    ) -> Self::Output {
        if !self.is_me(&user_id) {
            if let Some(participant) = self.participants.get(&user_id) {
                participant.set_speaking(true);
            }
        }
        Ok(())
    }

    /// Clears the speaking flag of the named participant.
    async fn on_voice_stopped(
        &self,
        user_id: ParticipantId,
    ) -> Self::Output {
        if !self.is_me(&user_id) {
            if let Some(participant) = self.participants.get(&user_id) {
                participant.set_speaking(false);
            }
        }
        Ok(())
    }

    /// Answers an SDP offer addressed to the local participant.
    ///
    /// If the sender's entry has an outstanding negotiation of its own
    /// (glare), the entry is closed and rebuilt from the incoming offer:
    /// last writer wins, and the offer is always answered.
    async fn on_webrtc_offer(
        &self,
        from_user_id: ParticipantId,
        to_user_id: ParticipantId,
        sdp: String,
    ) -> Self::Output {
        if !self.is_me(&to_user_id) {
            return Ok(());
        }

        if let Some(existing) = self.peers.get(&from_user_id) {
            match existing.state() {
                NegotiationState::OfferSent
                | NegotiationState::OfferReceived
                | NegotiationState::Answered
                | NegotiationState::Closed => {
                    self.peers.close(&from_user_id);
                }
                NegotiationState::New | NegotiationState::Stable => {}
            }
        }

        let peer = self
            .peers
            .get_or_create(&from_user_id)
            .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;
        peer.process_offer(sdp)
            .map_err(tracerr::map_from_and_wrap!(=> SessionError))?;
        Ok(())
    }

    /// Applies an SDP answer addressed to the local participant.
    ///
    /// An answer to an offer that was replaced meanwhile (glare) is
    /// dropped: the rebuilt entry already runs its own exchange.
    async fn on_webrtc_answer(
        &self,
        from_user_id: ParticipantId,
        to_user_id: ParticipantId,
        sdp: String,
    ) -> Self::Output {
        if !self.is_me(&to_user_id) {
            return Ok(());
        }

        let peer = self.peers.get(&from_user_id).ok_or_else(|| {
            tracerr::new!(SessionError::NoSuchPeer(from_user_id.clone()))
        })?;
        if let Err(e) = peer.apply_answer(sdp) {
            log::debug!(
                "dropped stale SDP answer from {}: {}",
                from_user_id,
                e.as_ref(),
            );
        }
        Ok(())
    }

    /// Buffers or applies an ICE candidate addressed to the local
    /// participant.
    async fn on_webrtc_ice(
        &self,
        from_user_id: ParticipantId,
        to_user_id: ParticipantId,
        candidate: IceCandidate,
    ) -> Self::Output {
        if !self.is_me(&to_user_id) {
            return Ok(());
        }

        let peer = self.peers.get(&from_user_id).ok_or_else(|| {
            tracerr::new!(SessionError::NoSuchPeer(from_user_id.clone()))
        })?;
        peer.add_ice_candidate(candidate);
        Ok(())
    }
}

/// [`PeerEvent`]s handling.
#[async_trait(?Send)]
impl PeerEventHandler for InnerSession {
    type Output = Result<()>;

    /// Relays a prepared SDP offer to its addressee.
    async fn on_new_sdp_offer(
        &self,
        remote_id: ParticipantId,
        sdp: String,
    ) -> Self::Output {
        let from_user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::WebrtcOffer {
            from_user_id,
            to_user_id: remote_id,
            sdp,
        });
        Ok(())
    }

    /// Relays a prepared SDP answer to its addressee.
    async fn on_new_sdp_answer(
        &self,
        remote_id: ParticipantId,
        sdp: String,
    ) -> Self::Output {
        let from_user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::WebrtcAnswer {
            from_user_id,
            to_user_id: remote_id,
            sdp,
        });
        Ok(())
    }

    /// Relays a discovered ICE candidate to its addressee.
    async fn on_ice_candidate_discovered(
        &self,
        remote_id: ParticipantId,
        candidate: IceCandidate,
    ) -> Self::Output {
        let from_user_id = self.me.borrow().user_id.clone();
        self.broadcast(Event::WebrtcIce {
            from_user_id,
            to_user_id: remote_id,
            candidate,
        });
        Ok(())
    }

    /// Surfaces a received remote track through its participant.
    async fn on_new_remote_track(
        &self,
        remote_id: ParticipantId,
        track: remote::Track,
    ) -> Self::Output {
        let participant =
            self.participants.get(&remote_id).ok_or_else(|| {
                tracerr::new!(SessionError::UnknownParticipant)
            })?;
        participant.add_remote_track(track);
        Ok(())
    }

    /// Tears down the entry of a lost connection.
    ///
    /// The participant stays in the roster: a reconnecting peer announces
    /// itself with a new `voice-join` and fresh offers.
    async fn on_connection_state_changed(
        &self,
        remote_id: ParticipantId,
        state: platform::PeerConnectionState,
    ) -> Self::Output {
        if state.is_terminal() {
            self.peers.close(&remote_id);
        }
        Ok(())
    }

    /// Closes the entry whose negotiation failed.
    ///
    /// Per-peer errors are isolated here: other peers and the session
    /// itself are unaffected.
    async fn on_negotiation_failed(
        &self,
        remote_id: ParticipantId,
        error: EngineError,
    ) -> Self::Output {
        self.peers.close(&remote_id);
        error.print();
        self.on_error.call(error);
        Ok(())
    }
}
