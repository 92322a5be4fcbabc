//! Fake seam implementations shared by the integration tests.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    future::Future,
    rc::Rc,
};

use async_trait::async_trait;
use futures::{
    channel::mpsc,
    stream::{self, LocalBoxStream},
    StreamExt as _,
};
use tokio::task;
use tracerr::Traced;

use echo::{
    conf::Conf,
    directory::{DirectoryError, SessionDirectory},
    platform,
    proto::{ChannelId, Event, IceCandidate, ParticipantId, ParticipantInfo},
    signal::{SignalTransport, TransportError, TransportState},
    Echo, MediaKind, MediaSourceKind, SessionHandle,
};

/// Runs the provided future inside a fresh [`task::LocalSet`].
pub async fn run_local<F>(f: F) -> F::Output
where
    F: Future,
{
    task::LocalSet::new().run_until(f).await
}

/// Lets every spawned engine task drain its queues.
pub async fn settle() {
    for _ in 0..50 {
        task::yield_now().await;
    }
}

/// Builds a [`ParticipantInfo`] with all media flags off.
pub fn info(id: &str) -> ParticipantInfo {
    ParticipantInfo {
        user_id: id.into(),
        username: id.to_uppercase(),
        avatar_url: None,
        is_muted: false,
        has_video: false,
        is_screen_sharing: false,
    }
}

// ----------------------------------------------------------------------------
// Pub/sub bus
// ----------------------------------------------------------------------------

/// Single endpoint connected to a [`FakeBus`].
#[derive(Default)]
struct EndpointInner {
    topics: RefCell<HashSet<String>>,
    message_txs: RefCell<Vec<mpsc::UnboundedSender<Event>>>,
    state_txs: RefCell<Vec<mpsc::UnboundedSender<TransportState>>>,
}

struct BusInner {
    /// Every event ever published, in publish order.
    log: RefCell<Vec<(String, Event)>>,

    /// Connected endpoints.
    endpoints: RefCell<Vec<Rc<EndpointInner>>>,

    /// Indicator whether delivery is held back.
    paused: Cell<bool>,

    /// Events queued while delivery was held back.
    queued: RefCell<Vec<(String, Event)>>,
}

/// In-memory pub/sub bus delivering published events to every subscriber of
/// a topic, the publisher included (real brokers echo too).
#[derive(Clone)]
pub struct FakeBus(Rc<BusInner>);

impl FakeBus {
    pub fn new() -> Self {
        Self(Rc::new(BusInner {
            log: RefCell::new(Vec::new()),
            endpoints: RefCell::new(Vec::new()),
            paused: Cell::new(false),
            queued: RefCell::new(Vec::new()),
        }))
    }

    /// Creates a new transport endpoint connected to this bus.
    pub fn endpoint(&self) -> Rc<FakeTransport> {
        let inner = Rc::new(EndpointInner::default());
        self.0.endpoints.borrow_mut().push(Rc::clone(&inner));
        Rc::new(FakeTransport {
            bus: Rc::clone(&self.0),
            inner,
        })
    }

    /// Holds back event delivery (publishes are queued).
    pub fn pause(&self) {
        self.0.paused.set(true);
    }

    /// Flushes queued events and resumes immediate delivery.
    pub fn release(&self) {
        self.0.paused.set(false);
        let queued: Vec<_> = self.0.queued.borrow_mut().drain(..).collect();
        for (topic, event) in queued {
            Self::deliver(&self.0, &topic, &event);
        }
    }

    /// Injects an event into the bus as if some external party published
    /// it.
    pub fn inject(&self, topic: &str, event: Event) {
        self.0
            .log
            .borrow_mut()
            .push((topic.to_owned(), event.clone()));
        if self.0.paused.get() {
            self.0.queued.borrow_mut().push((topic.to_owned(), event));
        } else {
            Self::deliver(&self.0, topic, &event);
        }
    }

    /// Returns every published event of the provided topic.
    pub fn published(&self, topic: &str) -> Vec<Event> {
        self.0
            .log
            .borrow()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Counts published `webrtc-offer` events of the provided topic.
    pub fn offers(&self, topic: &str) -> Vec<Event> {
        self.published(topic)
            .into_iter()
            .filter(|e| matches!(e, Event::WebrtcOffer { .. }))
            .collect()
    }

    /// Counts published `webrtc-answer` events of the provided topic.
    pub fn answers(&self, topic: &str) -> Vec<Event> {
        self.published(topic)
            .into_iter()
            .filter(|e| matches!(e, Event::WebrtcAnswer { .. }))
            .collect()
    }

    fn deliver(bus: &Rc<BusInner>, topic: &str, event: &Event) {
        for endpoint in bus.endpoints.borrow().iter() {
            if !endpoint.topics.borrow().contains(topic) {
                continue;
            }
            for tx in endpoint.message_txs.borrow().iter() {
                drop(tx.unbounded_send(event.clone()));
            }
        }
    }
}

/// [`SignalTransport`] endpoint of a [`FakeBus`].
pub struct FakeTransport {
    bus: Rc<BusInner>,
    inner: Rc<EndpointInner>,
}

impl SignalTransport for FakeTransport {
    fn subscribe(&self, topic: &str) -> Result<(), Traced<TransportError>> {
        drop(self.inner.topics.borrow_mut().insert(topic.to_owned()));
        for tx in self.inner.state_txs.borrow().iter() {
            drop(tx.unbounded_send(TransportState::Open));
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) {
        drop(self.inner.topics.borrow_mut().remove(topic));
    }

    fn send(
        &self,
        topic: &str,
        event: &Event,
    ) -> Result<(), Traced<TransportError>> {
        self.bus
            .log
            .borrow_mut()
            .push((topic.to_owned(), event.clone()));
        if self.bus.paused.get() {
            self.bus
                .queued
                .borrow_mut()
                .push((topic.to_owned(), event.clone()));
        } else {
            FakeBus::deliver(&self.bus, topic, event);
        }
        Ok(())
    }

    fn on_message(&self) -> LocalBoxStream<'static, Event> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.message_txs.borrow_mut().push(tx);
        rx.boxed_local()
    }

    fn on_state_change(&self) -> LocalBoxStream<'static, TransportState> {
        let (tx, rx) = mpsc::unbounded();
        drop(tx.unbounded_send(TransportState::Connecting));
        self.inner.state_txs.borrow_mut().push(tx);
        rx.boxed_local()
    }
}

// ----------------------------------------------------------------------------
// Session directory
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct DirectoryInner {
    rosters: RefCell<HashMap<ChannelId, Vec<ParticipantInfo>>>,
    pub register_calls: Cell<u32>,
    pub flag_calls: RefCell<Vec<String>>,
    pub fail_register: Cell<bool>,
}

impl DirectoryInner {
    /// Pre-seeds the roster of the provided channel.
    pub fn seed(&self, channel_id: &ChannelId, roster: Vec<ParticipantInfo>) {
        drop(
            self.rosters
                .borrow_mut()
                .insert(channel_id.clone(), roster),
        );
    }
}

/// Per-participant view of a shared in-memory session directory.
pub struct FakeDirectory {
    me: ParticipantId,
    shared: Rc<DirectoryInner>,
}

impl FakeDirectory {
    pub fn new(me: &str, shared: Rc<DirectoryInner>) -> Rc<Self> {
        Rc::new(Self {
            me: me.into(),
            shared,
        })
    }

    fn patch<F>(&self, channel_id: &ChannelId, f: F)
    where
        F: Fn(&mut ParticipantInfo),
    {
        if let Some(roster) =
            self.shared.rosters.borrow_mut().get_mut(channel_id)
        {
            for entry in roster.iter_mut() {
                if entry.user_id == self.me {
                    f(entry);
                }
            }
        }
    }
}

#[async_trait(?Send)]
impl SessionDirectory for FakeDirectory {
    async fn register(
        &self,
        channel_id: &ChannelId,
        info: &ParticipantInfo,
    ) -> Result<(), Traced<DirectoryError>> {
        self.shared.register_calls.set(self.shared.register_calls.get() + 1);
        if self.shared.fail_register.get() {
            return Err(tracerr::new!(DirectoryError::Request(
                platform::Error::from("503 Service Unavailable")
            )));
        }
        let mut rosters = self.shared.rosters.borrow_mut();
        let roster = rosters.entry(channel_id.clone()).or_default();
        roster.retain(|entry| entry.user_id != info.user_id);
        roster.push(info.clone());
        Ok(())
    }

    async fn deregister(
        &self,
        channel_id: &ChannelId,
    ) -> Result<(), Traced<DirectoryError>> {
        if let Some(roster) =
            self.shared.rosters.borrow_mut().get_mut(channel_id)
        {
            roster.retain(|entry| entry.user_id != self.me);
        }
        Ok(())
    }

    async fn set_muted(
        &self,
        channel_id: &ChannelId,
        is_muted: bool,
    ) -> Result<(), Traced<DirectoryError>> {
        self.shared
            .flag_calls
            .borrow_mut()
            .push(format!("{}:muted:{}", self.me, is_muted));
        self.patch(channel_id, |entry| entry.is_muted = is_muted);
        Ok(())
    }

    async fn set_video(
        &self,
        channel_id: &ChannelId,
        has_video: bool,
    ) -> Result<(), Traced<DirectoryError>> {
        self.shared
            .flag_calls
            .borrow_mut()
            .push(format!("{}:video:{}", self.me, has_video));
        self.patch(channel_id, |entry| entry.has_video = has_video);
        Ok(())
    }

    async fn set_screen_share(
        &self,
        channel_id: &ChannelId,
        is_screen_sharing: bool,
    ) -> Result<(), Traced<DirectoryError>> {
        self.shared
            .flag_calls
            .borrow_mut()
            .push(format!("{}:screen:{}", self.me, is_screen_sharing));
        self.patch(channel_id, |entry| {
            entry.is_screen_sharing = is_screen_sharing;
        });
        Ok(())
    }

    async fn sessions(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<HashMap<ChannelId, Vec<ParticipantInfo>>, Traced<DirectoryError>>
    {
        let rosters = self.shared.rosters.borrow();
        Ok(channel_ids
            .iter()
            .map(|id| {
                (id.clone(), rosters.get(id).cloned().unwrap_or_default())
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Platform media stack
// ----------------------------------------------------------------------------

/// Recording fake of a platform media track.
pub struct FakeTrack {
    pub id: String,
    pub kind: MediaKind,
    pub source_kind: MediaSourceKind,
    pub enabled: Cell<bool>,
    pub stopped: Cell<bool>,
    level_rx: RefCell<Option<mpsc::UnboundedReceiver<f32>>>,
}

impl FakeTrack {
    fn new(
        id: String,
        kind: MediaKind,
        source_kind: MediaSourceKind,
        level_rx: Option<mpsc::UnboundedReceiver<f32>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            kind,
            source_kind,
            enabled: Cell::new(true),
            stopped: Cell::new(false),
            level_rx: RefCell::new(level_rx),
        })
    }
}

impl platform::MediaStreamTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn source_kind(&self) -> MediaSourceKind {
        self.source_kind
    }

    fn enabled(&self) -> bool {
        self.enabled.get()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    fn stop(&self) {
        self.stopped.set(true);
    }

    fn audio_level_stream(&self) -> LocalBoxStream<'static, f32> {
        match self.level_rx.borrow_mut().take() {
            Some(rx) => rx.boxed_local(),
            None => stream::empty().boxed_local(),
        }
    }
}

/// Recording fake of the platform capture devices.
#[derive(Default)]
pub struct FakeMedia {
    /// Sink driving the microphone level stream of the created audio
    /// track.
    pub level_tx: RefCell<Option<mpsc::UnboundedSender<f32>>>,

    /// Every track ever handed out.
    pub tracks: RefCell<Vec<Rc<FakeTrack>>>,

    /// Makes microphone requests fail.
    pub deny_audio: Cell<bool>,

    name: RefCell<String>,
}

impl FakeMedia {
    pub fn new(name: &str) -> Rc<Self> {
        let media = Rc::new(Self::default());
        *media.name.borrow_mut() = name.to_owned();
        media
    }

    /// Feeds a level sample into the microphone level stream.
    pub fn level(&self, level: f32) {
        if let Some(tx) = self.level_tx.borrow().as_ref() {
            drop(tx.unbounded_send(level));
        }
    }

    /// Returns the track with the provided ID suffix.
    pub fn track(&self, suffix: &str) -> Option<Rc<FakeTrack>> {
        self.tracks
            .borrow()
            .iter()
            .find(|t| t.id.ends_with(suffix))
            .cloned()
    }

    fn make(
        &self,
        suffix: &str,
        kind: MediaKind,
        source_kind: MediaSourceKind,
        level_rx: Option<mpsc::UnboundedReceiver<f32>>,
    ) -> Rc<FakeTrack> {
        let track = FakeTrack::new(
            format!("{}-{}", self.name.borrow(), suffix),
            kind,
            source_kind,
            level_rx,
        );
        self.tracks.borrow_mut().push(Rc::clone(&track));
        track
    }
}

#[async_trait(?Send)]
impl platform::MediaDevices for FakeMedia {
    async fn get_user_audio(
        &self,
    ) -> Result<Rc<dyn platform::MediaStreamTrack>, platform::Error> {
        if self.deny_audio.get() {
            return Err(platform::Error::from("NotAllowedError"));
        }
        let (tx, rx) = mpsc::unbounded();
        self.level_tx.borrow_mut().replace(tx);
        Ok(self.make("mic", MediaKind::Audio, MediaSourceKind::Device, Some(rx)))
    }

    async fn get_user_video(
        &self,
    ) -> Result<Rc<dyn platform::MediaStreamTrack>, platform::Error> {
        Ok(self.make("cam", MediaKind::Video, MediaSourceKind::Device, None))
    }

    async fn get_display_video(
        &self,
    ) -> Result<Rc<dyn platform::MediaStreamTrack>, platform::Error> {
        Ok(self.make(
            "screen",
            MediaKind::Video,
            MediaSourceKind::Display,
            None,
        ))
    }
}

/// Recording fake of a platform peer connection.
#[derive(Default)]
pub struct FakeConn {
    pub added_tracks: RefCell<Vec<String>>,
    pub removed_tracks: RefCell<Vec<String>>,
    pub applied_candidates: RefCell<Vec<String>>,
    pub remote_descriptions: RefCell<Vec<String>>,
    pub offers_created: Cell<u32>,
    pub closed: Cell<bool>,
    on_ice_candidate: RefCell<Option<Box<dyn FnMut(IceCandidate)>>>,
    on_track:
        RefCell<Option<Box<dyn FnMut(Rc<dyn platform::MediaStreamTrack>)>>>,
    on_connection_state_change:
        RefCell<Option<Box<dyn FnMut(platform::PeerConnectionState)>>>,
}

impl FakeConn {
    /// Fires the connection's ICE candidate callback.
    pub fn discover_candidate(&self, candidate: &str) {
        if let Some(f) = self.on_ice_candidate.borrow_mut().as_mut() {
            f(IceCandidate::new(candidate.to_owned(), Some(0), None));
        }
    }

    /// Fires the connection's remote track callback.
    pub fn receive_track(&self, track: Rc<dyn platform::MediaStreamTrack>) {
        if let Some(f) = self.on_track.borrow_mut().as_mut() {
            f(track);
        }
    }

    /// Fires the connection's state change callback.
    pub fn change_state(&self, state: platform::PeerConnectionState) {
        if let Some(f) =
            self.on_connection_state_change.borrow_mut().as_mut()
        {
            f(state);
        }
    }
}

#[async_trait(?Send)]
impl platform::RtcPeerConnection for FakeConn {
    fn on_ice_candidate(
        &self,
        f: Option<Box<dyn FnMut(IceCandidate)>>,
    ) {
        *self.on_ice_candidate.borrow_mut() = f;
    }

    fn on_track(
        &self,
        f: Option<Box<dyn FnMut(Rc<dyn platform::MediaStreamTrack>)>>,
    ) {
        *self.on_track.borrow_mut() = f;
    }

    fn on_connection_state_change(
        &self,
        f: Option<Box<dyn FnMut(platform::PeerConnectionState)>>,
    ) {
        *self.on_connection_state_change.borrow_mut() = f;
    }

    async fn create_and_set_offer(&self) -> Result<String, platform::Error> {
        self.offers_created.set(self.offers_created.get() + 1);
        Ok(format!("offer-{}", self.offers_created.get()))
    }

    async fn create_and_set_answer(
        &self,
    ) -> Result<String, platform::Error> {
        Ok("answer".to_owned())
    }

    async fn set_remote_description(
        &self,
        sdp: platform::SdpType,
    ) -> Result<(), platform::Error> {
        let text = match sdp {
            platform::SdpType::Offer(s) => format!("offer:{}", s),
            platform::SdpType::Answer(s) => format!("answer:{}", s),
        };
        self.remote_descriptions.borrow_mut().push(text);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), platform::Error> {
        assert!(
            !self.remote_descriptions.borrow().is_empty(),
            "ICE candidate applied before remote description",
        );
        self.applied_candidates
            .borrow_mut()
            .push(candidate.candidate.clone());
        Ok(())
    }

    fn add_track(&self, track: Rc<dyn platform::MediaStreamTrack>) {
        self.added_tracks.borrow_mut().push(track.id());
    }

    fn remove_track(&self, track_id: &str) {
        self.removed_tracks.borrow_mut().push(track_id.to_owned());
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

/// Factory handing out recorded [`FakeConn`]s.
#[derive(Default)]
pub struct FakeFactory {
    pub created: RefCell<Vec<Rc<FakeConn>>>,
}

impl platform::PeerConnectionFactory for FakeFactory {
    fn create(
        &self,
        _: &[echo::conf::IceServer],
    ) -> Result<Rc<dyn platform::RtcPeerConnection>, platform::Error> {
        let conn = Rc::new(FakeConn::default());
        self.created.borrow_mut().push(Rc::clone(&conn));
        Ok(conn)
    }
}

// ----------------------------------------------------------------------------
// Whole-participant stack
// ----------------------------------------------------------------------------

/// One participant's full engine stack over the shared fakes.
pub struct Stack {
    pub handle: SessionHandle,
    pub media: Rc<FakeMedia>,
    pub factory: Rc<FakeFactory>,
    pub echo: Echo,
}

/// Builds a participant stack connected to the provided bus and directory.
pub fn stack(
    name: &str,
    bus: &FakeBus,
    directory: &Rc<DirectoryInner>,
    conf: Conf,
) -> Stack {
    let media = FakeMedia::new(name);
    let factory = Rc::new(FakeFactory::default());
    let echo = Echo::new(
        Rc::clone(&media) as Rc<dyn platform::MediaDevices>,
        Rc::clone(&factory) as Rc<dyn platform::PeerConnectionFactory>,
        conf,
    );
    let handle = echo.init_session(
        info(name),
        bus.endpoint() as Rc<dyn SignalTransport>,
        FakeDirectory::new(name, Rc::clone(directory))
            as Rc<dyn SessionDirectory>,
    );
    Stack {
        handle,
        media,
        factory,
        echo,
    }
}
