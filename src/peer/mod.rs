//! Media connections to remote channel participants.

mod repo;

use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use derive_more::Display;
use futures::{channel::mpsc, future, FutureExt as _};
use medea_macro::dispatchable;
use tracerr::Traced;

use echo_signal_proto::{IceCandidate, ParticipantId};

use crate::{
    media::track::{local, remote},
    platform,
    utils::{Caused, EngineError, TaskHandle},
};

#[doc(inline)]
pub use self::repo::PeerRepository;

/// Errors occurring during signaling with a remote peer.
#[derive(Clone, Debug, Display)]
pub enum PeerError {
    /// Occurs when a new media connection cannot be created.
    #[display(fmt = "failed to create peer connection: {}", _0)]
    CreatePeer(platform::Error),

    /// Occurs when an SDP offer cannot be obtained.
    #[display(fmt = "failed to create SDP offer: {}", _0)]
    CreateOffer(platform::Error),

    /// Occurs when an SDP answer cannot be obtained.
    #[display(fmt = "failed to create SDP answer: {}", _0)]
    CreateAnswer(platform::Error),

    /// Occurs when a remote SDP description cannot be applied.
    #[display(fmt = "failed to set remote SDP description: {}", _0)]
    SetRemoteDescription(platform::Error),

    /// Occurs when a buffered or received ICE candidate cannot be applied.
    #[display(fmt = "failed to add ICE candidate: {}", _0)]
    AddIceCandidate(platform::Error),

    /// Occurs on an attempt to perform an illegal [`NegotiationState`]
    /// transition.
    #[display(fmt = "illegal negotiation transition: {} -> {}", _0, _1)]
    IllegalTransition(NegotiationState, NegotiationState),
}

impl Caused for PeerError {
    fn name(&self) -> &'static str {
        match self {
            Self::CreatePeer(_) => "CreatePeer",
            Self::CreateOffer(_) => "CreateOffer",
            Self::CreateAnswer(_) => "CreateAnswer",
            Self::SetRemoteDescription(_) => "SetRemoteDescription",
            Self::AddIceCandidate(_) => "AddIceCandidate",
            Self::IllegalTransition(..) => "IllegalTransition",
        }
    }

    fn cause(self) -> Option<platform::Error> {
        match self {
            Self::CreatePeer(err)
            | Self::CreateOffer(err)
            | Self::CreateAnswer(err)
            | Self::SetRemoteDescription(err)
            | Self::AddIceCandidate(err) => Some(err),
            Self::IllegalTransition(..) => None,
        }
    }
}

type Result<T> = std::result::Result<T, Traced<PeerError>>;

/// Explicit negotiation state of a [`PeerConnection`].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NegotiationState {
    /// Connection created, no SDP exchanged yet.
    #[display(fmt = "new")]
    New,

    /// Local offer is sent, remote answer is awaited.
    #[display(fmt = "offer-sent")]
    OfferSent,

    /// Remote offer is applied, local answer is being prepared.
    #[display(fmt = "offer-received")]
    OfferReceived,

    /// Local answer is applied as the local description.
    #[display(fmt = "answered")]
    Answered,

    /// Offer/answer exchange is complete.
    #[display(fmt = "stable")]
    Stable,

    /// Connection is closed and the entry is defunct.
    #[display(fmt = "closed")]
    Closed,
}

impl NegotiationState {
    /// Indicates whether this state may transition into `next`.
    ///
    /// [`NegotiationState::Closed`] is reachable from every state, and
    /// renegotiation re-enters the offer exchange from
    /// [`NegotiationState::Stable`].
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use NegotiationState as S;

        matches!(
            (self, next),
            (_, S::Closed)
                | (S::New, S::OfferSent)
                | (S::New, S::OfferReceived)
                | (S::OfferSent, S::Stable)
                | (S::OfferReceived, S::Answered)
                | (S::Answered, S::Stable)
                | (S::Stable, S::OfferSent)
                | (S::Stable, S::OfferReceived)
        )
    }
}

/// Events emitted by [`PeerConnection`]s and handled by the session.
#[dispatchable(self: &Self, async_trait(?Send))]
#[derive(Clone)]
pub enum PeerEvent {
    /// [`PeerConnection`] prepared a local SDP offer to be relayed.
    NewSdpOffer {
        /// ID of the remote participant the offer is addressed to.
        remote_id: ParticipantId,

        /// The prepared SDP offer.
        sdp: String,
    },

    /// [`PeerConnection`] prepared a local SDP answer to be relayed.
    NewSdpAnswer {
        /// ID of the remote participant the answer is addressed to.
        remote_id: ParticipantId,

        /// The prepared SDP answer.
        sdp: String,
    },

    /// [`PeerConnection`] discovered a local ICE candidate to be relayed.
    IceCandidateDiscovered {
        /// ID of the remote participant the candidate is addressed to.
        remote_id: ParticipantId,

        /// The discovered candidate.
        candidate: IceCandidate,
    },

    /// [`PeerConnection`] received a media track from its remote peer.
    NewRemoteTrack {
        /// ID of the remote participant the track belongs to.
        remote_id: ParticipantId,

        /// The received track.
        track: remote::Track,
    },

    /// State of the underlying media connection changed.
    ConnectionStateChanged {
        /// ID of the remote participant of the connection.
        remote_id: ParticipantId,

        /// The new connection state.
        state: platform::PeerConnectionState,
    },

    /// Negotiation with the remote peer failed beyond repair of this entry.
    NegotiationFailed {
        /// ID of the remote participant of the failed entry.
        remote_id: ParticipantId,

        /// The failure itself.
        error: EngineError,
    },
}

/// Media connection to a single remote channel participant.
///
/// All operations mutating one entry are serialized by the single-threaded
/// event loop; asynchronous platform work runs in tasks registered on the
/// entry and aborted by [`PeerConnection::close()`], so no continuation
/// outlives its entry.
pub struct PeerConnection {
    /// ID of the remote participant this connection reaches.
    remote_id: ParticipantId,

    /// Underlying platform connection.
    peer: Rc<dyn platform::RtcPeerConnection>,

    /// Explicit negotiation state of this entry.
    state: Cell<NegotiationState>,

    /// Indicator whether a remote description has been applied.
    has_remote_description: Cell<bool>,

    /// ICE candidates received before the remote description was set, in
    /// arrival order.
    pending_ice_candidates: RefCell<Vec<IceCandidate>>,

    /// Indicator whether a drain task currently applies buffered
    /// candidates.
    ///
    /// While a drain is running every new candidate is appended to the
    /// buffer instead of being applied directly, preserving arrival order.
    draining_ice: Cell<bool>,

    /// Sink of [`PeerEvent`]s emitted by this entry.
    peer_events_sender: mpsc::UnboundedSender<PeerEvent>,

    /// Abort handles of the tasks driving this entry's negotiation.
    tasks: RefCell<Vec<TaskHandle>>,
}

impl PeerConnection {
    /// Creates a new [`PeerConnection`] over the provided platform
    /// connection, attaching every provided local track as an outgoing one.
    #[must_use]
    pub fn new(
        remote_id: ParticipantId,
        peer: Rc<dyn platform::RtcPeerConnection>,
        peer_events_sender: mpsc::UnboundedSender<PeerEvent>,
        tracks: Vec<Rc<local::Track>>,
    ) -> Rc<Self> {
        let this = Rc::new(Self {
            remote_id,
            peer,
            state: Cell::new(NegotiationState::New),
            has_remote_description: Cell::new(false),
            pending_ice_candidates: RefCell::new(Vec::new()),
            draining_ice: Cell::new(false),
            peer_events_sender,
            tasks: RefCell::new(Vec::new()),
        });

        let sender = this.peer_events_sender.clone();
        let id = this.remote_id.clone();
        this.peer.on_ice_candidate(Some(Box::new(move |candidate| {
            drop(sender.unbounded_send(PeerEvent::IceCandidateDiscovered {
                remote_id: id.clone(),
                candidate,
            }));
        })));

        let sender = this.peer_events_sender.clone();
        let id = this.remote_id.clone();
        this.peer.on_track(Some(Box::new(move |track| {
            drop(sender.unbounded_send(PeerEvent::NewRemoteTrack {
                remote_id: id.clone(),
                track: remote::Track::new(track),
            }));
        })));

        let sender = this.peer_events_sender.clone();
        let id = this.remote_id.clone();
        this.peer.on_connection_state_change(Some(Box::new(
            move |state| {
                drop(sender.unbounded_send(
                    PeerEvent::ConnectionStateChanged {
                        remote_id: id.clone(),
                        state,
                    },
                ));
            },
        )));

        for track in &tracks {
            this.peer.add_track(track.platform_track());
        }

        this
    }

    /// Returns ID of the remote participant of this connection.
    #[must_use]
    pub fn remote_id(&self) -> ParticipantId {
        self.remote_id.clone()
    }

    /// Returns the current [`NegotiationState`] of this entry.
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state.get()
    }

    /// Moves this entry into the `next` [`NegotiationState`].
    ///
    /// # Errors
    ///
    /// With [`PeerError::IllegalTransition`] if the move is not allowed by
    /// the state machine.
    pub fn transition_to(&self, next: NegotiationState) -> Result<()> {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            return Err(tracerr::new!(PeerError::IllegalTransition(
                current, next
            )));
        }
        self.state.set(next);
        Ok(())
    }

    /// Adds the provided local track to this connection's outgoing set.
    pub fn add_local_track(&self, track: &Rc<local::Track>) {
        self.peer.add_track(track.platform_track());
    }

    /// Removes the local track with the provided ID from this connection's
    /// outgoing set.
    pub fn remove_local_track(&self, track_id: &str) {
        self.peer.remove_track(track_id);
    }

    /// Starts an offer exchange: transitions into
    /// [`NegotiationState::OfferSent`] right away and prepares the SDP offer
    /// in a task of this entry, emitting [`PeerEvent::NewSdpOffer`] once
    /// done.
    ///
    /// # Errors
    ///
    /// With [`PeerError::IllegalTransition`] if this entry is neither
    /// [`NegotiationState::New`] nor [`NegotiationState::Stable`].
    pub fn start_offer(self: &Rc<Self>) -> Result<()> {
        self.transition_to(NegotiationState::OfferSent)?;

        let this = Rc::clone(self);
        self.spawn_task(async move {
            let offer = this
                .peer
                .create_and_set_offer()
                .await
                .map_err(PeerError::CreateOffer)
                .map_err(tracerr::wrap!());
            match offer {
                Ok(sdp) => {
                    drop(this.peer_events_sender.unbounded_send(
                        PeerEvent::NewSdpOffer {
                            remote_id: this.remote_id.clone(),
                            sdp,
                        },
                    ));
                }
                Err(e) => this.report_failure(e),
            }
        });
        Ok(())
    }

    /// Processes an offer of the remote peer: transitions into
    /// [`NegotiationState::OfferReceived`] right away, then applies the
    /// remote description, flushes buffered ICE candidates, prepares an
    /// answer and emits [`PeerEvent::NewSdpAnswer`], finishing in
    /// [`NegotiationState::Stable`].
    ///
    /// # Errors
    ///
    /// With [`PeerError::IllegalTransition`] if this entry is neither
    /// [`NegotiationState::New`] nor [`NegotiationState::Stable`].
    pub fn process_offer(self: &Rc<Self>, offer: String) -> Result<()> {
        self.transition_to(NegotiationState::OfferReceived)?;

        let this = Rc::clone(self);
        self.spawn_task(async move {
            if let Err(e) = this.process_offer_task(offer).await {
                this.report_failure(e);
            }
        });
        Ok(())
    }

    /// Applies an answer of the remote peer, flushing buffered ICE
    /// candidates and finishing in [`NegotiationState::Stable`].
    ///
    /// # Errors
    ///
    /// With [`PeerError::IllegalTransition`] if no offer of this entry is
    /// outstanding.
    pub fn apply_answer(self: &Rc<Self>, answer: String) -> Result<()> {
        let current = self.state.get();
        if current != NegotiationState::OfferSent {
            return Err(tracerr::new!(PeerError::IllegalTransition(
                current,
                NegotiationState::Stable,
            )));
        }

        let this = Rc::clone(self);
        self.spawn_task(async move {
            let applied = this
                .set_remote_description(platform::SdpType::Answer(answer))
                .await
                .and_then(|_| this.transition_to(NegotiationState::Stable));
            if let Err(e) = applied {
                this.report_failure(e);
            }
        });
        Ok(())
    }

    /// Buffers the remote peer's ICE candidate, scheduling its application
    /// once (and only after) the remote description is set.
    ///
    /// Candidates are always applied in arrival order.
    pub fn add_ice_candidate(self: &Rc<Self>, candidate: IceCandidate) {
        self.pending_ice_candidates.borrow_mut().push(candidate);
        if self.has_remote_description.get() {
            self.drain_ice_candidates();
        }
    }

    /// Closes this connection: cancels its in-flight negotiation tasks,
    /// unbinds platform callbacks, drops buffered candidates and releases
    /// the underlying connection.
    ///
    /// Safe to call at any negotiation state, repeatedly.
    pub fn close(&self) {
        self.state.set(NegotiationState::Closed);
        self.tasks.borrow_mut().clear();
        self.pending_ice_candidates.borrow_mut().clear();
        self.peer.on_ice_candidate(None);
        self.peer.on_track(None);
        self.peer.on_connection_state_change(None);
        self.peer.close();
    }

    /// Body of the [`PeerConnection::process_offer()`] task.
    async fn process_offer_task(self: &Rc<Self>, offer: String) -> Result<()> {
        self.set_remote_description(platform::SdpType::Offer(offer))
            .await?;

        let answer = self
            .peer
            .create_and_set_answer()
            .await
            .map_err(PeerError::CreateAnswer)
            .map_err(tracerr::wrap!())?;
        self.transition_to(NegotiationState::Answered)?;

        drop(self.peer_events_sender.unbounded_send(
            PeerEvent::NewSdpAnswer {
                remote_id: self.remote_id.clone(),
                sdp: answer,
            },
        ));

        // The answer is handed over to the transport, so the exchange is
        // complete from this side.
        self.transition_to(NegotiationState::Stable)
    }

    /// Applies the provided SDP as the remote description and flushes the
    /// candidates buffered up to now.
    async fn set_remote_description(
        self: &Rc<Self>,
        sdp: platform::SdpType,
    ) -> Result<()> {
        self.peer
            .set_remote_description(sdp)
            .await
            .map_err(PeerError::SetRemoteDescription)
            .map_err(tracerr::wrap!())?;
        self.has_remote_description.set(true);
        self.drain_ice_candidates();
        Ok(())
    }

    /// Spawns the task applying buffered ICE candidates in FIFO order,
    /// unless one is already running.
    fn drain_ice_candidates(self: &Rc<Self>) {
        if self.draining_ice.get() {
            return;
        }
        self.draining_ice.set(true);

        let this = Rc::clone(self);
        self.spawn_task(async move {
            loop {
                let next = {
                    let mut pending =
                        this.pending_ice_candidates.borrow_mut();
                    if pending.is_empty() {
                        None
                    } else {
                        Some(pending.remove(0))
                    }
                };
                let candidate = match next {
                    Some(candidate) => candidate,
                    None => break,
                };

                let applied = this
                    .peer
                    .add_ice_candidate(&candidate)
                    .await
                    .map_err(PeerError::AddIceCandidate)
                    .map_err(tracerr::wrap!());
                if let Err(e) = applied {
                    this.draining_ice.set(false);
                    this.report_failure(e);
                    return;
                }
            }
            this.draining_ice.set(false);
        });
    }

    /// Emits [`PeerEvent::NegotiationFailed`] for this entry.
    fn report_failure(&self, err: Traced<PeerError>) {
        drop(self.peer_events_sender.unbounded_send(
            PeerEvent::NegotiationFailed {
                remote_id: self.remote_id.clone(),
                error: EngineError::from(err),
            },
        ));
    }

    /// Spawns an abortable task owned by this entry.
    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let (fut, abort) = future::abortable(task);
        platform::spawn(fut.map(drop));
        self.tasks.borrow_mut().push(TaskHandle::from(abort));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt as _;
    use tokio::task;

    use super::*;

    /// Recording fake of a platform connection.
    #[derive(Default)]
    struct FakePeer {
        remote_description_set: Cell<bool>,
        applied_candidates: RefCell<Vec<String>>,
        added_tracks: RefCell<Vec<String>>,
        removed_tracks: RefCell<Vec<String>>,
        offers_created: Cell<u32>,
        closed: Cell<bool>,
        hang_offer: Cell<bool>,
    }

    #[async_trait::async_trait(?Send)]
    impl platform::RtcPeerConnection for FakePeer {
        fn on_ice_candidate(
            &self,
            _: Option<Box<dyn FnMut(IceCandidate)>>,
        ) {
        }

        fn on_track(
            &self,
            _: Option<Box<dyn FnMut(Rc<dyn platform::MediaStreamTrack>)>>,
        ) {
        }

        fn on_connection_state_change(
            &self,
            _: Option<Box<dyn FnMut(platform::PeerConnectionState)>>,
        ) {
        }

        async fn create_and_set_offer(
            &self,
        ) -> std::result::Result<String, platform::Error> {
            if self.hang_offer.get() {
                futures::future::pending::<()>().await;
            }
            self.offers_created.set(self.offers_created.get() + 1);
            Ok(format!("offer-{}", self.offers_created.get()))
        }

        async fn create_and_set_answer(
            &self,
        ) -> std::result::Result<String, platform::Error> {
            Ok("answer".to_owned())
        }

        async fn set_remote_description(
            &self,
            _: platform::SdpType,
        ) -> std::result::Result<(), platform::Error> {
            self.remote_description_set.set(true);
            Ok(())
        }

        async fn add_ice_candidate(
            &self,
            candidate: &IceCandidate,
        ) -> std::result::Result<(), platform::Error> {
            assert!(
                self.remote_description_set.get(),
                "candidate applied before remote description",
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

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate-{}", n), Some(0), None)
    }

    fn peer_with_fake(
    ) -> (Rc<FakePeer>, Rc<PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)
    {
        let fake = Rc::new(FakePeer::default());
        let (tx, rx) = mpsc::unbounded();
        let peer = PeerConnection::new(
            "bob".into(),
            Rc::clone(&fake) as Rc<dyn platform::RtcPeerConnection>,
            tx,
            Vec::new(),
        );
        (fake, peer, rx)
    }

    async fn settle() {
        for _ in 0..20 {
            task::yield_now().await;
        }
    }

    #[test]
    fn transition_matrix() {
        use NegotiationState as S;

        for state in
            [S::New, S::OfferSent, S::OfferReceived, S::Answered, S::Stable]
        {
            assert!(state.can_transition_to(S::Closed));
        }
        assert!(S::New.can_transition_to(S::OfferSent));
        assert!(S::New.can_transition_to(S::OfferReceived));
        assert!(S::OfferSent.can_transition_to(S::Stable));
        assert!(S::OfferReceived.can_transition_to(S::Answered));
        assert!(S::Answered.can_transition_to(S::Stable));
        assert!(S::Stable.can_transition_to(S::OfferSent));
        assert!(S::Stable.can_transition_to(S::OfferReceived));

        assert!(!S::New.can_transition_to(S::Stable));
        assert!(!S::OfferSent.can_transition_to(S::OfferReceived));
        assert!(!S::OfferSent.can_transition_to(S::Answered));
        assert!(!S::Closed.can_transition_to(S::New));
        assert!(!S::Closed.can_transition_to(S::OfferSent));
        assert!(!S::Answered.can_transition_to(S::OfferSent));
    }

    #[tokio::test]
    async fn ice_buffered_until_remote_description_and_flushed_in_order() {
        task::LocalSet::new()
            .run_until(async {
                let (fake, peer, _rx) = peer_with_fake();

                peer.add_ice_candidate(candidate(1));
                peer.add_ice_candidate(candidate(2));
                settle().await;
                assert!(fake.applied_candidates.borrow().is_empty());

                peer.process_offer("offer".to_owned()).unwrap();
                settle().await;

                // A candidate arriving mid-drain keeps its place in line.
                peer.add_ice_candidate(candidate(3));
                settle().await;

                assert_eq!(
                    *fake.applied_candidates.borrow(),
                    vec![
                        "candidate-1".to_owned(),
                        "candidate-2".to_owned(),
                        "candidate-3".to_owned(),
                    ],
                );
                assert_eq!(peer.state(), NegotiationState::Stable);
            })
            .await;
    }

    #[tokio::test]
    async fn offer_flow_emits_sdp_and_transitions() {
        task::LocalSet::new()
            .run_until(async {
                let (_fake, peer, mut rx) = peer_with_fake();

                peer.start_offer().unwrap();
                assert_eq!(peer.state(), NegotiationState::OfferSent);
                settle().await;

                match rx.next().await.unwrap() {
                    PeerEvent::NewSdpOffer { remote_id, sdp } => {
                        assert_eq!(remote_id, "bob".into());
                        assert_eq!(sdp, "offer-1");
                    }
                    _ => panic!("expected NewSdpOffer"),
                }

                peer.apply_answer("answer".to_owned()).unwrap();
                settle().await;
                assert_eq!(peer.state(), NegotiationState::Stable);
            })
            .await;
    }

    #[tokio::test]
    async fn answer_flow_emits_sdp_and_finishes_stable() {
        task::LocalSet::new()
            .run_until(async {
                let (_fake, peer, mut rx) = peer_with_fake();

                peer.process_offer("offer".to_owned()).unwrap();
                settle().await;

                match rx.next().await.unwrap() {
                    PeerEvent::NewSdpAnswer { sdp, .. } => {
                        assert_eq!(sdp, "answer");
                    }
                    _ => panic!("expected NewSdpAnswer"),
                }
                assert_eq!(peer.state(), NegotiationState::Stable);
            })
            .await;
    }

    #[tokio::test]
    async fn answer_without_outstanding_offer_is_rejected() {
        task::LocalSet::new()
            .run_until(async {
                let (_fake, peer, _rx) = peer_with_fake();

                let err = peer.apply_answer("answer".to_owned()).unwrap_err();
                assert!(matches!(
                    err.as_ref(),
                    PeerError::IllegalTransition(NegotiationState::New, _),
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn close_aborts_inflight_negotiation() {
        task::LocalSet::new()
            .run_until(async {
                let (fake, peer, mut rx) = peer_with_fake();
                fake.hang_offer.set(true);

                peer.start_offer().unwrap();
                settle().await;
                peer.close();

                tokio::time::timeout(Duration::from_millis(50), async {
                    settle().await;
                })
                .await
                .unwrap();

                assert!(fake.closed.get());
                assert_eq!(peer.state(), NegotiationState::Closed);
                assert!(rx.try_next().is_err(), "no event after close");
            })
            .await;
    }
}
