//! Storage of [`PeerConnection`]s of a session.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use futures::channel::mpsc;
use tracerr::Traced;

use echo_signal_proto::ParticipantId;

use crate::{
    conf::IceServer,
    media::{track::local, MediaManager},
    platform,
};

use super::{PeerConnection, PeerError, PeerEvent};

/// [`PeerConnection`] factory and repository.
///
/// Sole owner of the `participant id -> connection` map: entries are only
/// ever created and removed here, and (outside transient join/leave
/// windows) the key set equals the set of remote roster participants. At
/// most one live entry exists per participant.
pub struct PeerRepository {
    /// Factory of underlying platform connections.
    factory: Rc<dyn platform::PeerConnectionFactory>,

    /// ICE servers injected into every created connection.
    ice_servers: Vec<IceServer>,

    /// [`MediaManager`] supplying the local tracks attached to created
    /// connections.
    media_manager: Rc<MediaManager>,

    /// Sink injected into every created [`PeerConnection`].
    peer_events_sender: mpsc::UnboundedSender<PeerEvent>,

    /// Remote participant ID to its [`PeerConnection`].
    peers: RefCell<HashMap<ParticipantId, Rc<PeerConnection>>>,
}

impl PeerRepository {
    /// Creates a new empty [`PeerRepository`].
    #[must_use]
    pub fn new(
        factory: Rc<dyn platform::PeerConnectionFactory>,
        ice_servers: Vec<IceServer>,
        media_manager: Rc<MediaManager>,
        peer_events_sender: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            ice_servers,
            media_manager,
            peer_events_sender,
            peers: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the [`PeerConnection`] to the provided participant, creating
    /// it if absent.
    ///
    /// A created connection gets every currently active local track
    /// attached as an outgoing one.
    ///
    /// # Errors
    ///
    /// With [`PeerError::CreatePeer`] if the platform fails to create the
    /// underlying connection.
    pub fn get_or_create(
        &self,
        remote_id: &ParticipantId,
    ) -> Result<Rc<PeerConnection>, Traced<PeerError>> {
        if let Some(peer) = self.peers.borrow().get(remote_id) {
            return Ok(Rc::clone(peer));
        }

        let conn = self
            .factory
            .create(&self.ice_servers)
            .map_err(PeerError::CreatePeer)
            .map_err(tracerr::wrap!())?;
        let peer = PeerConnection::new(
            remote_id.clone(),
            conn,
            self.peer_events_sender.clone(),
            self.media_manager.active_tracks(),
        );

        drop(
            self.peers
                .borrow_mut()
                .insert(remote_id.clone(), Rc::clone(&peer)),
        );
        Ok(peer)
    }

    /// Looks up the [`PeerConnection`] to the provided participant.
    #[must_use]
    pub fn get(
        &self,
        remote_id: &ParticipantId,
    ) -> Option<Rc<PeerConnection>> {
        self.peers.borrow().get(remote_id).cloned()
    }

    /// Returns every stored [`PeerConnection`].
    #[must_use]
    pub fn get_all(&self) -> Vec<Rc<PeerConnection>> {
        self.peers.borrow().values().cloned().collect()
    }

    /// Returns IDs of every stored entry.
    #[must_use]
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.peers.borrow().keys().cloned().collect()
    }

    /// Closes and removes the entry of the provided participant.
    ///
    /// No-op if no such entry exists.
    pub fn close(&self, remote_id: &ParticipantId) {
        if let Some(peer) = self.peers.borrow_mut().remove(remote_id) {
            peer.close();
        }
    }

    /// Closes and removes every entry.
    pub fn close_all(&self) {
        for (_, peer) in self.peers.borrow_mut().drain() {
            peer.close();
        }
    }

    /// Adds the provided local track to every entry's outgoing set.
    pub fn add_local_track_to_all(&self, track: &Rc<local::Track>) {
        for peer in self.peers.borrow().values() {
            peer.add_local_track(track);
        }
    }

    /// Removes the local track with the provided ID from every entry's
    /// outgoing set.
    pub fn remove_local_track_from_all(&self, track_id: &str) {
        for peer in self.peers.borrow().values() {
            peer.remove_local_track(track_id);
        }
    }
}
