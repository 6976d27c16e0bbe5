//! Capability contract for the video SDK.
//!
//! The session only talks to the SDK through [`VideoSdk`]. The LiveKit
//! adapter in `livekit_room` is the production implementation; tests use
//! scripted fakes.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::background::VirtualBackground;
use crate::roster::{MediaAction, UserId, UserInfo};

/// Lifecycle events delivered by the SDK, in no guaranteed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
    UserJoined {
        user_id: UserId,
        display_name: Option<String>,
    },
    UserLeft {
        user_id: UserId,
    },
    VideoStateChanged {
        user_id: UserId,
        action: MediaAction,
    },
    AudioStateChanged {
        user_id: UserId,
        action: MediaAction,
    },
    SessionJoined,
    SessionLeft,
    ChatMessage {
        sender_id: UserId,
        sender_name: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub user_id: UserId,
    pub display_name: String,
    pub video_on: bool,
}

/// Resolution tier requested when attaching remote video. Tiles are always
/// rendered at 720p.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoQuality {
    P720,
}

/// Result of probing the SDK at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkAvailability {
    pub available: bool,
    pub reason: Option<String>,
}

impl SdkAvailability {
    pub fn ready() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
    /// An operation that needs a joined session was called without one.
    #[error("not joined to a session")]
    NotJoined,
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    /// The SDK does not support the requested feature.
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("SDK call failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait VideoSdk: Send + Sync {
    /// Check whether the SDK can be used before offering a join.
    fn probe(&self) -> SdkAvailability;

    /// Join `session` with a signed session token. Lifecycle events for the
    /// session arrive on the returned receiver; a `SessionJoined` event is
    /// delivered once the roster can be queried.
    async fn join(
        &self,
        session: &str,
        signature: &str,
        user_name: &str,
    ) -> Result<UnboundedReceiver<SdkEvent>, SdkError>;

    async fn current_user(&self) -> Result<CurrentUser, SdkError>;

    /// Everyone in the session, the local user included, in SDK order.
    async fn all_users(&self) -> Result<Vec<UserInfo>, SdkError>;

    async fn start_audio(&self) -> Result<(), SdkError>;

    async fn stop_audio(&self) -> Result<(), SdkError>;

    async fn start_video(&self, background: Option<&VirtualBackground>) -> Result<(), SdkError>;

    async fn stop_video(&self) -> Result<(), SdkError>;

    /// Publish the screen as a separate video track. Camera video and the
    /// roster are unaffected.
    async fn start_screen_share(&self) -> Result<(), SdkError>;

    async fn stop_screen_share(&self) -> Result<(), SdkError>;

    /// Start receiving `user_id`'s video at the given tier.
    async fn attach_video(&self, user_id: &UserId, quality: VideoQuality) -> Result<(), SdkError>;

    async fn detach_video(&self, user_id: &UserId) -> Result<(), SdkError>;

    async fn send_chat(&self, message: &str) -> Result<(), SdkError>;

    async fn leave(&self) -> Result<(), SdkError>;
}
