//! Local speaking detection.
//!
//! Watches the energy envelope of the local microphone track and turns it
//! into debounced speaking/stopped transitions: the rising edge fires
//! immediately, the falling edge only after the configured silence window
//! passes without a loud sample. Exactly one event is emitted per
//! transition.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{
    channel::mpsc, future, stream::LocalBoxStream, FutureExt as _,
    StreamExt as _,
};

use crate::{conf, platform, utils::TaskHandle};

/// Transition of the local participant's speaking state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpeakingEvent {
    /// Local participant started speaking.
    Speaking,

    /// Local participant went silent for the whole silence window.
    Stopped,
}

/// Actual state of a [`SpeakingDetector`].
struct InnerSpeakingDetector {
    /// Detection thresholds.
    conf: conf::Speaking,

    /// Current speaking state.
    is_speaking: Cell<bool>,

    /// Mute state of the watched track.
    ///
    /// A muted track counts as silent regardless of its level samples.
    is_muted: Cell<bool>,

    /// Armed falling-edge debounce timer, if any.
    pending_stop: RefCell<Option<TaskHandle>>,

    /// Task draining the watched level stream.
    sampling: RefCell<Option<TaskHandle>>,

    /// Sink of emitted [`SpeakingEvent`]s.
    events_tx: mpsc::UnboundedSender<SpeakingEvent>,
}

impl InnerSpeakingDetector {
    /// Feeds a single level sample into the detector.
    fn on_sample(self: &Rc<Self>, level: f32) {
        if level >= self.conf.level_threshold && !self.is_muted.get() {
            self.on_voice();
        } else {
            self.on_silence();
        }
    }

    /// Handles a loud sample: cancels an armed stop and fires the rising
    /// edge once.
    fn on_voice(&self) {
        drop(self.pending_stop.borrow_mut().take());
        if !self.is_speaking.get() {
            self.is_speaking.set(true);
            drop(self.events_tx.unbounded_send(SpeakingEvent::Speaking));
        }
    }

    /// Handles a silent sample: arms the debounce timer if the falling edge
    /// is not already pending.
    fn on_silence(self: &Rc<Self>) {
        if !self.is_speaking.get() || self.pending_stop.borrow().is_some() {
            return;
        }

        let window = self.conf.silence_window;
        let weak_inner = Rc::downgrade(self);
        let (timer, abort) = future::abortable(async move {
            platform::delay_for(window).await;
            if let Some(inner) = weak_inner.upgrade() {
                drop(inner.pending_stop.borrow_mut().take());
                inner.is_speaking.set(false);
                drop(inner.events_tx.unbounded_send(SpeakingEvent::Stopped));
            }
        });
        platform::spawn(timer.map(drop));

        self.pending_stop
            .borrow_mut()
            .replace(TaskHandle::from(abort));
    }
}

/// Detector of the local participant's speaking state.
///
/// Emitted [`SpeakingEvent`]s are consumed by the session, which broadcasts
/// them to the channel.
pub struct SpeakingDetector(Rc<InnerSpeakingDetector>);

impl SpeakingDetector {
    /// Creates a new stopped [`SpeakingDetector`] with the provided
    /// thresholds, returning the stream of its future transitions.
    #[must_use]
    pub fn new(
        conf: conf::Speaking,
    ) -> (Self, mpsc::UnboundedReceiver<SpeakingEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded();
        (
            Self(Rc::new(InnerSpeakingDetector {
                conf,
                is_speaking: Cell::new(false),
                is_muted: Cell::new(false),
                pending_stop: RefCell::new(None),
                sampling: RefCell::new(None),
                events_tx,
            })),
            events_rx,
        )
    }

    /// Starts sampling the provided level stream, replacing a previously
    /// watched one.
    pub fn start(&self, mut levels: LocalBoxStream<'static, f32>) {
        let inner = Rc::clone(&self.0);
        let (sampling, abort) = future::abortable(async move {
            while let Some(level) = levels.next().await {
                inner.on_sample(level);
            }
        });
        platform::spawn(sampling.map(drop));

        self.0.sampling.borrow_mut().replace(TaskHandle::from(abort));
    }

    /// Marks the watched track as muted or unmuted.
    ///
    /// Muting counts as a falling edge, so an active speaking state goes
    /// through the regular silence window before the stop is emitted.
    pub fn set_muted(&self, is_muted: bool) {
        self.0.is_muted.set(is_muted);
        if is_muted {
            self.0.on_silence();
        }
    }

    /// Indicates whether the local participant currently counts as
    /// speaking.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.0.is_speaking.get()
    }

    /// Stops sampling and resets the detector without emitting any
    /// transition.
    ///
    /// Pending debounce timers are cancelled deterministically.
    pub fn stop(&self) {
        drop(self.0.sampling.borrow_mut().take());
        drop(self.0.pending_stop.borrow_mut().take());
        self.0.is_speaking.set(false);
        self.0.is_muted.set(false);
    }
}
