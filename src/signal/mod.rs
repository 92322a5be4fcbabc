//! Adapter to the pub/sub signaling transport.
//!
//! The transport itself is an external collaborator: anything able to
//! deliver JSON [`Event`]s to every subscriber of a named topic with
//! at-least-once semantics fits behind [`SignalTransport`]. This module
//! scopes such a transport to a single voice channel topic and owns the
//! "wait until open" part of joining.

use std::rc::Rc;

use derive_more::Display;
use futures::{stream::LocalBoxStream, FutureExt as _, StreamExt as _};
use medea_reactive::ObservableCell;
use tracerr::Traced;

use echo_signal_proto::{ChannelId, Event};

use crate::{
    platform,
    utils::{Caused, TaskHandle},
};

/// Errors occurring in the signaling transport.
#[derive(Clone, Debug, Display)]
pub enum TransportError {
    /// Occurs when a topic subscription cannot be created.
    #[display(fmt = "failed to subscribe to topic: {}", _0)]
    SubscribeFailed(platform::Error),

    /// Occurs when the transport closes before the subscription opens.
    #[display(fmt = "transport closed while opening subscription")]
    InitFailed,

    /// Occurs when an event cannot be published.
    #[display(fmt = "failed to publish event: {}", _0)]
    SendFailed(platform::Error),
}

impl Caused for TransportError {
    fn name(&self) -> &'static str {
        match self {
            Self::SubscribeFailed(_) => "SubscribeFailed",
            Self::InitFailed => "InitFailed",
            Self::SendFailed(_) => "SendFailed",
        }
    }

    fn cause(self) -> Option<platform::Error> {
        match self {
            Self::SubscribeFailed(err) | Self::SendFailed(err) => Some(err),
            Self::InitFailed => None,
        }
    }
}

type Result<T> = std::result::Result<T, Traced<TransportError>>;

/// State of a transport subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportState {
    /// Subscription is being established.
    Connecting,

    /// Subscription is live and events flow.
    Open,

    /// Subscription is being torn down.
    Closing,

    /// Subscription is closed or could not be established.
    Closed,
}

/// Pub/sub transport between channel participants.
///
/// Delivery is at-least-once and unordered across different event kinds;
/// retrying failed publishes is the transport's own job, the engine treats
/// [`SignalTransport::send`] as fire-and-forget.
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait SignalTransport {
    /// Requests a subscription to the provided topic.
    ///
    /// The subscription is live once [`SignalTransport::on_state_change`]
    /// reports [`TransportState::Open`].
    ///
    /// # Errors
    ///
    /// Errors if the subscription request cannot be issued.
    fn subscribe(&self, topic: &str) -> Result<()>;

    /// Removes the subscription to the provided topic.
    fn unsubscribe(&self, topic: &str);

    /// Publishes the provided [`Event`] to the provided topic.
    ///
    /// # Errors
    ///
    /// Errors if the event cannot be handed to the transport.
    fn send(&self, topic: &str, event: &Event) -> Result<()>;

    /// Returns a stream of [`Event`]s delivered for the subscribed topics.
    fn on_message(&self) -> LocalBoxStream<'static, Event>;

    /// Returns a stream of this transport's [`TransportState`] changes.
    fn on_state_change(&self) -> LocalBoxStream<'static, TransportState>;
}

/// [`SignalTransport`] scoped to one voice channel topic.
pub struct SignalingChannel {
    /// Underlying transport.
    transport: Rc<dyn SignalTransport>,

    /// Topic of the voice channel this adapter is scoped to.
    topic: String,

    /// Mirror of the transport's reported state.
    state: Rc<ObservableCell<TransportState>>,

    /// Task piping transport state reports into [`SignalingChannel::state`].
    _state_task: TaskHandle,
}

impl SignalingChannel {
    /// Returns the topic of the provided voice channel.
    #[must_use]
    pub fn topic_of(channel_id: &ChannelId) -> String {
        format!("voice:{}", channel_id)
    }

    /// Opens a [`SignalingChannel`] on the provided channel's topic and
    /// waits until the transport reports the subscription live.
    ///
    /// # Errors
    ///
    /// With [`TransportError::SubscribeFailed`] if the subscription request
    /// cannot be issued, or [`TransportError::InitFailed`] if the transport
    /// closes before the subscription opens.
    pub async fn open(
        transport: Rc<dyn SignalTransport>,
        channel_id: &ChannelId,
    ) -> Result<Self> {
        let topic = Self::topic_of(channel_id);
        let state = Rc::new(ObservableCell::new(TransportState::Connecting));

        let mut transport_state = transport.on_state_change();
        let state_mirror = Rc::clone(&state);
        let (pipe, abort) = futures::future::abortable(async move {
            while let Some(new_state) = transport_state.next().await {
                state_mirror.set(new_state);
            }
        });
        platform::spawn(pipe.map(drop));

        transport.subscribe(&topic)?;

        let mut state_updates = state.subscribe();
        loop {
            match state.get() {
                TransportState::Open => break,
                TransportState::Closed => {
                    return Err(tracerr::new!(TransportError::InitFailed));
                }
                _ => {}
            }
            if state_updates.next().await.is_none() {
                return Err(tracerr::new!(TransportError::InitFailed));
            }
        }

        Ok(Self {
            transport,
            topic,
            state,
            _state_task: TaskHandle::from(abort),
        })
    }

    /// Publishes the provided [`Event`] on this channel's topic.
    ///
    /// # Errors
    ///
    /// Errors if the event cannot be handed to the transport.
    pub fn send(&self, event: &Event) -> Result<()> {
        self.transport.send(&self.topic, event)
    }

    /// Returns the current state of the underlying subscription.
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.state.get()
    }

    /// Removes the underlying topic subscription.
    pub fn close(&self) {
        self.transport.unsubscribe(&self.topic);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
