//! General library interface.

use std::{cell::RefCell, rc::Rc};

use echo_signal_proto::ParticipantInfo;

use crate::{
    conf::Conf,
    directory::SessionDirectory,
    media::MediaManager,
    platform,
    session::{Session, SessionHandle},
    signal::SignalTransport,
};

/// Entry point of the voice engine.
///
/// Owns the [`MediaManager`] shared by every instantiated [`Session`], so
/// capture devices are acquired once regardless of how many sessions the
/// embedder spins up over time.
pub struct Echo {
    /// Engine configuration applied to every instantiated session.
    conf: Conf,

    /// Factory of platform media connections.
    factory: Rc<dyn platform::PeerConnectionFactory>,

    /// [`MediaManager`] shared between sessions.
    media_manager: Rc<MediaManager>,

    /// Sessions instantiated by this [`Echo`] instance.
    sessions: RefCell<Vec<Session>>,
}

impl Echo {
    /// Instantiates the engine over the provided platform media stack.
    #[must_use]
    pub fn new(
        devices: Rc<dyn platform::MediaDevices>,
        factory: Rc<dyn platform::PeerConnectionFactory>,
        conf: Conf,
    ) -> Self {
        Self {
            conf,
            factory,
            media_manager: Rc::new(MediaManager::new(devices)),
            sessions: RefCell::new(Vec::new()),
        }
    }

    /// Creates a new detached [`Session`] for the provided local identity
    /// and returns its handle.
    ///
    /// The session talks to its voice channel through the provided
    /// transport and directory seams; it is not joined anywhere yet.
    pub fn init_session(
        &self,
        me: ParticipantInfo,
        transport: Rc<dyn SignalTransport>,
        directory: Rc<dyn SessionDirectory>,
    ) -> SessionHandle {
        let session = Session::new(
            me,
            transport,
            directory,
            Rc::clone(&self.factory),
            Rc::clone(&self.media_manager),
            self.conf.clone(),
        );
        let handle = session.new_handle();
        self.sessions.borrow_mut().push(session);
        handle
    }

    /// Drops every instantiated [`Session`], leaving the joined channels.
    pub fn dispose(self) {
        for session in self.sessions.into_inner() {
            session.close();
        }
    }
}
