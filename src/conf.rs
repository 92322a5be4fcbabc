//! Engine configuration options.
//!
//! Every section is a plain [`serde`] struct with defaults, so the embedding
//! application may source it from its own config file or environment layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// All configuration settings of the voice engine.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Conf {
    /// ICE resolution settings of media connections.
    pub ice: Ice,

    /// Speaking detection settings.
    pub speaking: Speaking,
}

/// ICE resolution settings of media connections.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Ice {
    /// STUN/TURN servers offered to every created media connection.
    pub servers: Vec<IceServer>,
}

/// Description of a single STUN/TURN server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IceServer {
    /// URLs of this server.
    pub urls: Vec<String>,

    /// Username for authentication on this server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for authentication on this server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Speaking detection settings.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct Speaking {
    /// Normalized `[0.0, 1.0]` audio level at and above which the local
    /// participant counts as speaking.
    ///
    /// Defaults to `0.08`.
    #[default(0.08)]
    pub level_threshold: f32,

    /// Duration the audio level must stay below
    /// [`Speaking::level_threshold`] before a stopped transition is
    /// broadcast.
    ///
    /// Defaults to `600ms`.
    #[default(Duration::from_millis(600))]
    #[serde(with = "humantime_serde")]
    pub silence_window: Duration,
}
