//! Roster of a voice channel and its per-participant state.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use tracerr::Traced;

use echo_signal_proto::{ParticipantId, ParticipantInfo};

use crate::{
    media::track::remote,
    utils::{Callback, HandlerDetachedError},
};

/// Service which manages the roster of remote [`Participant`]s.
#[derive(Default)]
pub struct Participants {
    /// Remote participant ID to its [`Participant`].
    participants: RefCell<HashMap<ParticipantId, Participant>>,

    /// Callback invoked when a remote participant appears in the roster.
    on_new_participant: Callback<ParticipantHandle>,
}

impl Participants {
    /// Sets the callback invoked when a remote participant appears in the
    /// roster.
    pub fn on_new_participant<F>(&self, f: F)
    where
        F: Fn(ParticipantHandle) + 'static,
    {
        self.on_new_participant.set_func(f);
    }

    /// Inserts a [`Participant`] built from the provided snapshot.
    ///
    /// No-op if the participant is already present.
    pub fn create_participant(&self, info: ParticipantInfo) {
        let is_new =
            !self.participants.borrow().contains_key(&info.user_id);
        if is_new {
            let id = info.user_id.clone();
            let participant = Participant::new(info);
            self.on_new_participant.call(participant.new_handle());
            drop(
                self.participants.borrow_mut().insert(id, participant),
            );
        }
    }

    /// Looks up a [`Participant`] by its ID.
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<Participant> {
        self.participants.borrow().get(id).cloned()
    }

    /// Removes the [`Participant`] with the provided ID, invoking its
    /// `on_close` callback.
    pub fn remove(&self, id: &ParticipantId) {
        if let Some(participant) = self.participants.borrow_mut().remove(id) {
            participant.0.on_close.call0();
        }
    }

    /// Returns IDs of every participant in the roster.
    #[must_use]
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.borrow().keys().cloned().collect()
    }

    /// Removes every participant, invoking their `on_close` callbacks.
    pub fn clear(&self) {
        let removed: Vec<_> =
            self.participants.borrow_mut().drain().collect();
        for (_, participant) in removed {
            participant.0.on_close.call0();
        }
    }
}

/// Actual state of a remote channel participant.
struct InnerParticipant {
    /// ID of this participant.
    id: ParticipantId,

    /// Display name of this participant.
    username: String,

    /// Avatar of this participant, if any.
    avatar_url: Option<String>,

    /// Mute flag of this participant.
    is_muted: Cell<bool>,

    /// Camera flag of this participant.
    has_video: Cell<bool>,

    /// Screen-share flag of this participant.
    is_screen_sharing: Cell<bool>,

    /// Speaking flag of this participant.
    is_speaking: Cell<bool>,

    /// Callback invoked when any flag of this participant changes.
    on_update: Callback<()>,

    /// Callback invoked when a [`remote::Track`] of this participant
    /// arrives.
    on_remote_track_added: Callback<remote::Track>,

    /// Callback invoked when this participant leaves the roster.
    on_close: Callback<()>,
}

/// Remote channel participant, used by the engine side.
#[derive(Clone)]
pub struct Participant(Rc<InnerParticipant>);

impl Participant {
    /// Instantiates a new [`Participant`] from the provided snapshot.
    #[must_use]
    pub fn new(info: ParticipantInfo) -> Self {
        Self(Rc::new(InnerParticipant {
            id: info.user_id,
            username: info.username,
            avatar_url: info.avatar_url,
            is_muted: Cell::new(info.is_muted),
            has_video: Cell::new(info.has_video),
            is_screen_sharing: Cell::new(info.is_screen_sharing),
            is_speaking: Cell::new(false),
            on_update: Callback::default(),
            on_remote_track_added: Callback::default(),
            on_close: Callback::default(),
        }))
    }

    /// Returns ID of this participant.
    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.0.id.clone()
    }

    /// Returns the current snapshot of this participant.
    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.0.id.clone(),
            username: self.0.username.clone(),
            avatar_url: self.0.avatar_url.clone(),
            is_muted: self.0.is_muted.get(),
            has_video: self.0.has_video.get(),
            is_screen_sharing: self.0.is_screen_sharing.get(),
        }
    }

    /// Updates the mute flag of this participant.
    pub fn set_muted(&self, is_muted: bool) {
        if self.0.is_muted.replace(is_muted) != is_muted {
            self.0.on_update.call0();
        }
    }

    /// Updates the camera flag of this participant.
    pub fn set_has_video(&self, has_video: bool) {
        if self.0.has_video.replace(has_video) != has_video {
            self.0.on_update.call0();
        }
    }

    /// Updates the screen-share flag of this participant.
    pub fn set_screen_sharing(&self, is_screen_sharing: bool) {
        if self.0.is_screen_sharing.replace(is_screen_sharing)
            != is_screen_sharing
        {
            self.0.on_update.call0();
        }
    }

    /// Updates the speaking flag of this participant.
    pub fn set_speaking(&self, is_speaking: bool) {
        if self.0.is_speaking.replace(is_speaking) != is_speaking {
            self.0.on_update.call0();
        }
    }

    /// Indicates whether this participant currently speaks.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.0.is_speaking.get()
    }

    /// Passes a received [`remote::Track`] of this participant to the
    /// embedder.
    pub fn add_remote_track(&self, track: remote::Track) {
        self.0.on_remote_track_added.call(track);
    }

    /// Creates a new external handle to this [`Participant`].
    #[must_use]
    pub fn new_handle(&self) -> ParticipantHandle {
        ParticipantHandle(Rc::downgrade(&self.0))
    }
}

/// External handle to a [`Participant`].
///
/// Actually, represents a [`Weak`]-based handle to `InnerParticipant`.
pub struct ParticipantHandle(Weak<InnerParticipant>);

impl ParticipantHandle {
    /// Returns ID of this participant.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn id(&self) -> Result<ParticipantId, Traced<HandlerDetachedError>> {
        upgrade_or_detached!(self.0).map(|inner| inner.id.clone())
    }

    /// Returns the current snapshot of this participant.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn info(
        &self,
    ) -> Result<ParticipantInfo, Traced<HandlerDetachedError>> {
        upgrade_or_detached!(self.0)
            .map(|inner| Participant(inner).info())
    }

    /// Indicates whether this participant currently speaks.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn is_speaking(&self) -> Result<bool, Traced<HandlerDetachedError>> {
        upgrade_or_detached!(self.0).map(|inner| inner.is_speaking.get())
    }

    /// Sets the callback invoked when any flag of this participant changes.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn on_update<F>(
        &self,
        f: F,
    ) -> Result<(), Traced<HandlerDetachedError>>
    where
        F: Fn(()) + 'static,
    {
        upgrade_or_detached!(self.0).map(|inner| inner.on_update.set_func(f))
    }

    /// Sets the callback invoked when a [`remote::Track`] of this
    /// participant arrives.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn on_remote_track_added<F>(
        &self,
        f: F,
    ) -> Result<(), Traced<HandlerDetachedError>>
    where
        F: Fn(remote::Track) + 'static,
    {
        upgrade_or_detached!(self.0)
            .map(|inner| inner.on_remote_track_added.set_func(f))
    }

    /// Sets the callback invoked when this participant leaves the roster.
    ///
    /// # Errors
    ///
    /// With [`HandlerDetachedError`] if the participant left the roster.
    pub fn on_close<F>(
        &self,
        f: F,
    ) -> Result<(), Traced<HandlerDetachedError>>
    where
        F: Fn(()) + 'static,
    {
        upgrade_or_detached!(self.0).map(|inner| inner.on_close.set_func(f))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn info(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            user_id: id.into(),
            username: id.to_uppercase(),
            avatar_url: None,
            is_muted: false,
            has_video: false,
            is_screen_sharing: false,
        }
    }

    #[test]
    fn roster_tracks_joins_and_leaves() {
        let participants = Participants::default();

        participants.create_participant(info("alice"));
        participants.create_participant(info("bob"));
        participants.create_participant(info("alice"));

        let mut ids = participants.ids();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(ids, vec!["alice".into(), "bob".into()]);

        participants.remove(&"alice".into());
        assert_eq!(participants.ids(), vec!["bob".into()]);

        participants.clear();
        assert!(participants.ids().is_empty());
    }

    #[test]
    fn duplicate_join_keeps_existing_state() {
        let participants = Participants::default();
        participants.create_participant(info("alice"));
        participants
            .get(&"alice".into())
            .unwrap()
            .set_muted(true);

        // A re-delivered join must not reset the flags.
        participants.create_participant(info("alice"));
        assert!(participants.get(&"alice".into()).unwrap().info().is_muted);
    }

    #[test]
    fn flag_patch_fires_update_only_on_change() {
        let participants = Participants::default();
        participants.create_participant(info("alice"));
        let participant = participants.get(&"alice".into()).unwrap();

        let updates = Rc::new(std::cell::Cell::new(0));
        let counter = Rc::clone(&updates);
        participant
            .new_handle()
            .on_update(move |()| counter.set(counter.get() + 1))
            .unwrap();

        participant.set_has_video(true);
        participant.set_has_video(true);
        participant.set_speaking(true);

        assert_eq!(updates.get(), 2);
    }

    #[test]
    fn handle_detaches_on_removal() {
        let participants = Participants::default();
        participants.create_participant(info("alice"));
        let handle =
            participants.get(&"alice".into()).unwrap().new_handle();

        participants.remove(&"alice".into());

        assert!(handle.id().is_err());
    }
}
