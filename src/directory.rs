//! Session directory seam.
//!
//! The directory is the REST side of voice presence: it answers which
//! participants are currently registered in which channels and persists the
//! local participant's mute/video/screen flags. It is consumed, never
//! implemented, by this engine.

use std::collections::HashMap;

use async_trait::async_trait;
use derive_more::Display;
use tracerr::Traced;

use echo_signal_proto::{ChannelId, ParticipantInfo};

use crate::{platform, utils::Caused};

/// Errors occurring when a session directory request fails.
#[derive(Clone, Debug, Display)]
pub enum DirectoryError {
    /// Request could not be performed or answered with an error status.
    #[display(fmt = "session directory request failed: {}", _0)]
    Request(platform::Error),
}

impl Caused for DirectoryError {
    fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "DirectoryError",
        }
    }

    fn cause(self) -> Option<platform::Error> {
        match self {
            Self::Request(err) => Some(err),
        }
    }
}

type Result<T> = std::result::Result<T, Traced<DirectoryError>>;

/// External session directory of voice channels.
#[async_trait(?Send)]
#[cfg_attr(feature = "mockable", mockall::automock)]
pub trait SessionDirectory {
    /// Registers the provided participant's presence in the provided
    /// channel.
    ///
    /// Registration is an idempotent upsert.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn register(
        &self,
        channel_id: &ChannelId,
        info: &ParticipantInfo,
    ) -> Result<()>;

    /// Removes the local participant's presence from the provided channel.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn deregister(&self, channel_id: &ChannelId) -> Result<()>;

    /// Persists the local participant's mute flag.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn set_muted(
        &self,
        channel_id: &ChannelId,
        is_muted: bool,
    ) -> Result<()>;

    /// Persists the local participant's camera flag.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn set_video(
        &self,
        channel_id: &ChannelId,
        has_video: bool,
    ) -> Result<()>;

    /// Persists the local participant's screen-share flag.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn set_screen_share(
        &self,
        channel_id: &ChannelId,
        is_screen_sharing: bool,
    ) -> Result<()>;

    /// Returns the current roster of every provided channel.
    ///
    /// # Errors
    ///
    /// Errors if the directory request fails.
    async fn sessions(
        &self,
        channel_ids: &[ChannelId],
    ) -> Result<HashMap<ChannelId, Vec<ParticipantInfo>>>;
}
