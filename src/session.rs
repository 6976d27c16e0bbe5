//! One joined call: drives the roster from SDK events and executes its
//! directives against the rendering shell.
//!
//! All roster access goes through a single `tokio::sync::Mutex`, so SDK
//! events, the periodic sweep and user commands are applied one at a time
//! even though they originate from different tasks.

use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::background::{BackgroundMode, FallbackEffect, VirtualBackground};
use crate::chat::{ChatEntry, ChatLog};
use crate::roster::{
    Directive, MediaAction, Role, RosterState, TileHandle, TileStatus, UserId, UserInfo,
};
use crate::sdk::{SdkError, SdkEvent, VideoQuality, VideoSdk};
use crate::token::{SignatureRequest, SignatureSource, TokenError};

const MEETING_ID_LEN: usize = 6;
const MEETING_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random six character meeting id for "create meeting".
pub fn generate_meeting_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MEETING_ID_LEN)
        .map(|_| MEETING_ID_ALPHABET[rng.gen_range(0..MEETING_ID_ALPHABET.len())] as char)
        .collect()
}

/// Delays used by the session. Defaults match what the SDK needs in practice.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Pause between stopping and restarting local video.
    pub settle_delay: Duration,
    /// Wait after a background change before re-deriving the roster, so the
    /// post-restart video events land first.
    pub rebuild_delay: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            rebuild_delay: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Left,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub display_name: String,
    pub video_on: bool,
    pub audio_muted: bool,
    pub is_local: bool,
    pub is_presenter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterSummary {
    pub participants: Vec<ParticipantSummary>,
    pub presenter_id: Option<UserId>,
    pub remote_count: usize,
}

impl RosterSummary {
    fn of(roster: &RosterState) -> Self {
        let local = roster.local_user_id();
        let presenter = roster.presenter_id();
        let participants = roster
            .participants()
            .iter()
            .map(|p| {
                let is_local = p.user_id == *local;
                ParticipantSummary {
                    user_id: p.user_id.clone(),
                    display_name: p.display_name.clone(),
                    video_on: p.has_video(),
                    audio_muted: p.audio_muted,
                    is_local,
                    is_presenter: match roster.local_role() {
                        Role::Audience => presenter == Some(&p.user_id),
                        Role::Presenter => is_local,
                    },
                }
            })
            .collect();
        Self {
            participants,
            presenter_id: presenter.cloned(),
            remote_count: roster.remote_count(),
        }
    }
}

/// Rendering collaborator. Implementations own the on-screen tiles; the
/// session only ever refers to them by the handles returned from
/// [`CallView::attach_tile`].
pub trait CallView: Send + Sync {
    /// Create a tile for `user_id`. `placeholder` is set when the SDK could
    /// not attach video and a generic tile should be shown instead.
    fn attach_tile(
        &self,
        user_id: &UserId,
        display_name: &str,
        is_local: bool,
        placeholder: bool,
    ) -> TileHandle;

    fn update_tile(&self, handle: TileHandle, status: &TileStatus);

    fn remove_tile(&self, handle: TileHandle);

    fn roster_changed(&self, summary: &RosterSummary);

    fn chat_message(&self, entry: &ChatEntry);

    /// The SDK rejected `mode`; approximate it on the local preview.
    fn background_fallback(&self, mode: &BackgroundMode, effect: &FallbackEffect);

    fn session_ended(&self, reason: EndReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_name: String,
    pub user_name: String,
    pub role: Role,
}

impl JoinRequest {
    fn validate(&self) -> Result<(), JoinError> {
        if self.session_name.trim().is_empty() {
            return Err(JoinError::InvalidRequest("meeting id is required".to_string()));
        }
        if self.user_name.trim().is_empty() {
            return Err(JoinError::InvalidRequest("name is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("video SDK unavailable: {0}")]
    SdkUnavailable(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("failed to join session: {0}")]
    Sdk(SdkError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Background changes are reserved for the presenter.
    #[error("only the presenter can change the background")]
    NotPresenter,
    #[error("start your video first")]
    VideoOff,
    #[error("a background change is in progress")]
    TransitionInProgress,
    #[error("invalid background image: {0}")]
    InvalidBackground(String),
    #[error("the call has ended")]
    Ended,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Sdk(#[from] SdkError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingInfo {
    pub meeting_id: String,
    pub user_name: String,
    pub role: Role,
    pub presenter_id: Option<UserId>,
    pub participant_count: usize,
    pub background: BackgroundMode,
    pub audio_on: bool,
    pub video_on: bool,
    pub screen_sharing: bool,
    pub changing_background: bool,
}

#[derive(Debug, Default)]
struct LocalMedia {
    audio_on: bool,
    video_on: bool,
    screen_sharing: bool,
    background: BackgroundMode,
}

struct RestartFailure {
    error: SdkError,
    video_stopped: bool,
}

struct Inner {
    sdk: Arc<dyn VideoSdk>,
    view: Arc<dyn CallView>,
    timing: SessionTiming,
    meeting_id: String,
    user_name: String,
    local_user_id: UserId,
    role: Role,
    roster: Mutex<RosterState>,
    media: Mutex<LocalMedia>,
    chat: Mutex<ChatLog>,
    ended: AtomicBool,
}

pub struct CallSession {
    inner: Arc<Inner>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    /// Joins a call. On error nothing is rendered and no roster exists.
    pub async fn join(
        request: JoinRequest,
        sdk: Arc<dyn VideoSdk>,
        view: Arc<dyn CallView>,
        tokens: &dyn SignatureSource,
        timing: SessionTiming,
    ) -> Result<Self, JoinError> {
        request.validate()?;
        let session_name = request.session_name.trim().to_string();
        let user_name = request.user_name.trim().to_string();

        let availability = sdk.probe();
        if !availability.available {
            return Err(JoinError::SdkUnavailable(
                availability.reason.unwrap_or_else(|| "unknown reason".to_string()),
            ));
        }

        let signature = tokens
            .fetch(&SignatureRequest {
                session_name: session_name.clone(),
                role: request.role,
                user_name: user_name.clone(),
            })
            .await?;
        info!(session = %session_name, role = ?request.role, expires_at = %signature.expires_at, "joining session");

        let events = sdk
            .join(&session_name, &signature.token, &user_name)
            .await
            .map_err(JoinError::Sdk)?;

        let me = match sdk.current_user().await {
            Ok(me) => me,
            Err(e) => {
                if let Err(leave_err) = sdk.leave().await {
                    warn!("failed to leave after join error: {leave_err}");
                }
                return Err(JoinError::Sdk(e));
            }
        };

        let mut users = match sdk.all_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("initial user list unavailable, relying on events: {e}");
                Vec::new()
            }
        };
        if !users.iter().any(|u| u.user_id == me.user_id) {
            users.insert(
                0,
                UserInfo {
                    user_id: me.user_id.clone(),
                    display_name: Some(me.display_name.clone()),
                    role: request.role,
                    video_on: me.video_on,
                },
            );
        }

        let inner = Arc::new(Inner {
            sdk,
            view,
            timing,
            meeting_id: session_name,
            user_name,
            local_user_id: me.user_id.clone(),
            role: request.role,
            roster: Mutex::new(RosterState::new(me.user_id, request.role)),
            media: Mutex::new(LocalMedia::default()),
            chat: Mutex::new(ChatLog::default()),
            ended: AtomicBool::new(false),
        });

        {
            let mut roster = inner.roster.lock().await;
            let directives = roster.on_session_joined(&users);
            inner.execute(&mut roster, directives).await;
        }
        inner.start_local_media().await;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let event_loop = tokio::spawn(run_event_loop(inner.clone(), events, shutdown_rx));

        Ok(Self {
            inner,
            shutdown: Mutex::new(Some(shutdown_tx)),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    pub fn meeting_id(&self) -> &str {
        &self.inner.meeting_id
    }

    pub fn is_ended(&self) -> bool {
        self.inner.is_ended()
    }

    pub async fn info(&self) -> MeetingInfo {
        let (presenter_id, participant_count, changing_background) = {
            let roster = self.inner.roster.lock().await;
            let presenter = match roster.local_role() {
                Role::Presenter => Some(roster.local_user_id().clone()),
                Role::Audience => roster.presenter_id().cloned(),
            };
            (presenter, roster.remote_count(), roster.is_suppressed())
        };
        let media = self.inner.media.lock().await;
        MeetingInfo {
            meeting_id: self.inner.meeting_id.clone(),
            user_name: self.inner.user_name.clone(),
            role: self.inner.role,
            presenter_id,
            participant_count,
            background: media.background.clone(),
            audio_on: media.audio_on,
            video_on: media.video_on,
            screen_sharing: media.screen_sharing,
            changing_background,
        }
    }

    /// Returns whether audio is on afterwards.
    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let mut media = self.inner.media.lock().await;
        let action = if media.audio_on {
            self.inner.sdk.stop_audio().await?;
            MediaAction::Stop
        } else {
            self.inner.sdk.start_audio().await?;
            MediaAction::Start
        };
        media.audio_on = action == MediaAction::Start;

        let mut roster = self.inner.roster.lock().await;
        let directives = roster.on_audio_state(&self.inner.local_user_id, action);
        self.inner.execute(&mut roster, directives).await;
        Ok(media.audio_on)
    }

    /// Returns whether video is on afterwards.
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        // Suppression only changes state while the media lock is held.
        let mut media = self.inner.media.lock().await;
        self.ensure_active()?;
        if self.inner.roster.lock().await.is_suppressed() {
            return Err(SessionError::TransitionInProgress);
        }
        let action = if media.video_on {
            self.inner.sdk.stop_video().await?;
            MediaAction::Stop
        } else {
            let background = media.background.virtual_background();
            self.inner.start_video_with(background.as_ref()).await?;
            MediaAction::Start
        };
        media.video_on = action == MediaAction::Start;

        let mut roster = self.inner.roster.lock().await;
        let directives = roster.on_video_state(self.inner.local_user_id.clone(), action);
        self.inner.execute(&mut roster, directives).await;
        Ok(media.video_on)
    }

    /// Shares the screen as a second video track, or stops sharing. Returns
    /// whether the screen is shared afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool, SessionError> {
        self.ensure_active()?;
        let mut media = self.inner.media.lock().await;
        if media.screen_sharing {
            self.inner.sdk.stop_screen_share().await?;
        } else {
            self.inner.sdk.start_screen_share().await?;
        }
        media.screen_sharing = !media.screen_sharing;
        info!(sharing = media.screen_sharing, "screen share toggled");
        Ok(media.screen_sharing)
    }

    /// Restarts local video with `mode` applied.
    ///
    /// Rendering is suppressed for the duration of the restart, after which
    /// every tile is discarded and the roster is re-derived from a fresh user
    /// list. A participant leaving meanwhile is still removed immediately.
    /// When the SDK cannot apply the background the shell is asked to
    /// approximate it and plain video is restarted; `mode` is recorded as
    /// the selection either way.
    pub async fn set_background(&self, mode: BackgroundMode) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.inner.role != Role::Presenter {
            return Err(SessionError::NotPresenter);
        }
        mode.validate().map_err(SessionError::InvalidBackground)?;

        // Held until the restart is over so media toggles queue behind it.
        let mut media = self.inner.media.lock().await;
        self.ensure_active()?;
        if !media.video_on {
            return Err(SessionError::VideoOff);
        }
        if !self.inner.roster.lock().await.begin_suppression() {
            return Err(SessionError::TransitionInProgress);
        }
        info!(?mode, "changing background");

        let background = mode.virtual_background();
        match self.inner.restart_video(background.as_ref()).await {
            Ok(()) => info!(?mode, "background applied"),
            Err(failure) => {
                warn!(?mode, "background not applied, using local approximation: {}", failure.error);
                self.inner.view.background_fallback(&mode, &mode.fallback_effect());
                if failure.video_stopped {
                    if let Err(e) = self.inner.sdk.start_video(None).await {
                        warn!("failed to restart plain video: {e}");
                        media.video_on = false;
                    }
                }
            }
        }
        media.background = mode;
        drop(media);

        {
            let mut roster = self.inner.roster.lock().await;
            if self.inner.is_ended() {
                return Ok(());
            }
            let directives = roster.end_suppression();
            self.inner.execute(&mut roster, directives).await;
        }

        time::sleep(self.inner.timing.rebuild_delay).await;
        self.inner.rebuild().await;
        Ok(())
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatEntry, SessionError> {
        self.ensure_active()?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.inner.sdk.send_chat(text).await?;
        let entry = self
            .inner
            .chat
            .lock()
            .await
            .push(self.inner.user_name.clone(), text, true);
        self.inner.view.chat_message(&entry);
        Ok(entry)
    }

    pub async fn chat_history(&self) -> Vec<ChatEntry> {
        self.inner.chat.lock().await.entries()
    }

    /// Leaves the call. Cleanup runs even in the middle of a background
    /// change. Calling it again is a no-op.
    pub async fn leave(&self) -> Result<(), SessionError> {
        if self.inner.is_ended() {
            return Ok(());
        }
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("event loop ended abnormally: {e}");
            }
        }

        let result = self.inner.sdk.leave().await;
        self.inner.finish(EndReason::Left).await;
        result.map_err(SessionError::from)
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.inner.is_ended() {
            Err(SessionError::Ended)
        } else {
            Ok(())
        }
    }
}

impl Inner {
    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    async fn start_local_media(&self) {
        let mut media = self.media.lock().await;

        let audio = match self.sdk.start_audio().await {
            Ok(()) => MediaAction::Start,
            Err(e) => {
                warn!("failed to start local audio: {e}");
                MediaAction::Stop
            }
        };
        media.audio_on = audio == MediaAction::Start;

        let video = match self.sdk.start_video(None).await {
            Ok(()) => MediaAction::Start,
            Err(e) => {
                warn!("failed to start local video: {e}");
                MediaAction::Stop
            }
        };
        media.video_on = video == MediaAction::Start;

        let mut roster = self.roster.lock().await;
        let mut directives = roster.on_audio_state(&self.local_user_id, audio);
        directives.extend(roster.on_video_state(self.local_user_id.clone(), video));
        self.execute(&mut roster, directives).await;
    }

    async fn start_video_with(&self, background: Option<&VirtualBackground>) -> Result<(), SdkError> {
        match self.sdk.start_video(background).await {
            Err(e) if background.is_some() => {
                warn!("video start with background failed, starting plain video: {e}");
                self.sdk.start_video(None).await
            }
            result => result,
        }
    }

    async fn restart_video(&self, background: Option<&VirtualBackground>) -> Result<(), RestartFailure> {
        self.sdk.stop_video().await.map_err(|error| RestartFailure {
            error,
            video_stopped: false,
        })?;
        time::sleep(self.timing.settle_delay).await;
        self.sdk.start_video(background).await.map_err(|error| RestartFailure {
            error,
            video_stopped: true,
        })
    }

    async fn all_users(&self) -> Vec<UserInfo> {
        match self.sdk.all_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("failed to fetch user list: {e}");
                Vec::new()
            }
        }
    }

    async fn handle_event(&self, event: SdkEvent) {
        crate::dlog!("sdk event: {event:?}");
        let mut roster = self.roster.lock().await;
        let directives = match event {
            SdkEvent::UserJoined {
                user_id,
                display_name,
            } => {
                let users = if roster.local_role() == Role::Audience && roster.presenter_id().is_none() {
                    self.all_users().await
                } else {
                    Vec::new()
                };
                roster.on_user_joined(user_id, display_name, &users)
            }
            SdkEvent::UserLeft { user_id } => roster.on_user_left(&user_id),
            SdkEvent::VideoStateChanged { user_id, action } => roster.on_video_state(user_id, action),
            SdkEvent::AudioStateChanged { user_id, action } => roster.on_audio_state(&user_id, action),
            SdkEvent::SessionJoined => {
                let users = self.all_users().await;
                roster.refresh(&users)
            }
            SdkEvent::ChatMessage {
                sender_id,
                sender_name,
                message,
            } => {
                drop(roster);
                if sender_id != self.local_user_id {
                    let entry = self.chat.lock().await.push(sender_name, message, false);
                    self.view.chat_message(&entry);
                }
                return;
            }
            // Handled by the event loop.
            SdkEvent::SessionLeft => return,
        };
        self.execute(&mut roster, directives).await;
    }

    async fn sweep(&self) {
        let mut roster = self.roster.lock().await;
        if roster.is_suppressed() {
            return;
        }
        let users = self.all_users().await;
        let directives = roster.refresh(&users);
        if !directives.is_empty() {
            debug!(count = directives.len(), "sweep recovered missed participants");
        }
        self.execute(&mut roster, directives).await;
    }

    async fn rebuild(&self) {
        let users = self.all_users().await;
        let mut roster = self.roster.lock().await;
        if self.is_ended() {
            return;
        }
        let directives = roster.rebuild(&users);
        info!(users = users.len(), tiles = directives.len(), "roster rebuilt after background change");
        self.execute(&mut roster, directives).await;
    }

    /// Runs `directives` against the view and the SDK, feeding tile handles
    /// back into the roster.
    async fn execute(&self, roster: &mut RosterState, directives: Vec<Directive>) {
        let mut queue: VecDeque<Directive> = directives.into();
        let mut changed = false;
        while let Some(directive) = queue.pop_front() {
            changed = true;
            match directive {
                Directive::Attach {
                    user_id,
                    display_name,
                    is_local,
                } => {
                    let placeholder = match self.sdk.attach_video(&user_id, VideoQuality::P720).await {
                        Ok(()) => false,
                        Err(e) => {
                            warn!(user = %user_id, "video attach failed, showing placeholder: {e}");
                            true
                        }
                    };
                    let handle = self.view.attach_tile(&user_id, &display_name, is_local, placeholder);
                    crate::dlog!("tile {} attached for {user_id}", handle.get());
                    if let Some(follow_up) = roster.bind_handle(&user_id, handle) {
                        queue.push_back(follow_up);
                    }
                }
                Directive::UpdateStatus { handle, status, .. } => {
                    self.view.update_tile(handle, &status);
                }
                Directive::Remove { user_id, handle } => {
                    self.view.remove_tile(handle);
                    if !self.is_ended() && user_id != self.local_user_id {
                        if let Err(e) = self.sdk.detach_video(&user_id).await {
                            debug!(user = %user_id, "detach after removal: {e}");
                        }
                    }
                }
            }
        }
        if changed || roster.participants().is_empty() {
            self.view.roster_changed(&RosterSummary::of(roster));
        }
    }

    async fn finish(&self, reason: EndReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut roster = self.roster.lock().await;
        let directives = roster.teardown();
        self.execute(&mut roster, directives).await;
        drop(roster);

        let mut media = self.media.lock().await;
        media.audio_on = false;
        media.video_on = false;
        media.screen_sharing = false;
        info!(?reason, meeting = %self.meeting_id, "session ended");
        self.view.session_ended(reason);
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut events: UnboundedReceiver<SdkEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let period = inner.timing.sweep_interval;
    let mut sweep = time::interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(SdkEvent::SessionLeft) | None => {
                    info!("session closed by the SDK");
                    inner.finish(EndReason::Disconnected).await;
                    break;
                }
                Some(event) => inner.handle_event(event).await,
            },
            _ = sweep.tick() => inner.sweep().await,
        }
    }
    crate::dlog!("event loop stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sdk::{CurrentUser, SdkAvailability};
    use crate::token::Signature;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::{self, UnboundedSender};

    pub(crate) const ME: &str = "ME";

    fn uid(id: &str) -> UserId {
        UserId::from(id)
    }

    pub(crate) fn user(id: &str, name: &str, role: Role, video_on: bool) -> UserInfo {
        UserInfo {
            user_id: uid(id),
            display_name: Some(name.to_string()),
            role,
            video_on,
        }
    }

    #[derive(Default)]
    struct FakeState {
        users: Vec<UserInfo>,
        events: Option<UnboundedSender<SdkEvent>>,
        calls: Vec<String>,
        fail_attach: HashSet<UserId>,
        reject_backgrounds: bool,
        no_screen_share: bool,
        audio_delay: Duration,
    }

    pub(crate) struct FakeSdk {
        available: bool,
        state: StdMutex<FakeState>,
    }

    impl FakeSdk {
        pub(crate) fn new(users: Vec<UserInfo>) -> Arc<Self> {
            Arc::new(Self {
                available: true,
                state: StdMutex::new(FakeState {
                    users,
                    ..FakeState::default()
                }),
            })
        }

        fn emit(&self, event: SdkEvent) {
            let state = self.state.lock().unwrap();
            state.events.as_ref().unwrap().send(event).unwrap();
        }

        fn set_users(&self, users: Vec<UserInfo>) {
            self.state.lock().unwrap().users = users;
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.state.lock().unwrap().calls.push(call.into());
        }

        fn camera_on(&self) -> bool {
            let state = self.state.lock().unwrap();
            state.users.iter().any(|u| u.user_id == uid(ME) && u.video_on)
        }

        fn set_local_video(&self, on: bool) {
            let mut state = self.state.lock().unwrap();
            if let Some(me) = state.users.iter_mut().find(|u| u.user_id == uid(ME)) {
                me.video_on = on;
            }
        }
    }

    #[async_trait]
    impl VideoSdk for FakeSdk {
        fn probe(&self) -> SdkAvailability {
            if self.available {
                SdkAvailability::ready()
            } else {
                SdkAvailability::unavailable("not installed")
            }
        }

        async fn join(
            &self,
            session: &str,
            _signature: &str,
            _user_name: &str,
        ) -> Result<UnboundedReceiver<SdkEvent>, SdkError> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.state.lock().unwrap();
            state.events = Some(tx);
            state.calls.push(format!("join {session}"));
            Ok(rx)
        }

        async fn current_user(&self) -> Result<CurrentUser, SdkError> {
            Ok(CurrentUser {
                user_id: uid(ME),
                display_name: "Me".to_string(),
                video_on: false,
            })
        }

        async fn all_users(&self) -> Result<Vec<UserInfo>, SdkError> {
            Ok(self.state.lock().unwrap().users.clone())
        }

        async fn start_audio(&self) -> Result<(), SdkError> {
            let delay = self.state.lock().unwrap().audio_delay;
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            self.record("start_audio");
            Ok(())
        }

        async fn stop_audio(&self) -> Result<(), SdkError> {
            let delay = self.state.lock().unwrap().audio_delay;
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            self.record("stop_audio");
            Ok(())
        }

        async fn start_video(&self, background: Option<&VirtualBackground>) -> Result<(), SdkError> {
            let rejected = background.is_some() && self.state.lock().unwrap().reject_backgrounds;
            self.record(format!("start_video {background:?}"));
            if rejected {
                return Err(SdkError::Unsupported("virtual background".to_string()));
            }
            self.set_local_video(true);
            Ok(())
        }

        async fn stop_video(&self) -> Result<(), SdkError> {
            self.record("stop_video");
            self.set_local_video(false);
            Ok(())
        }

        async fn start_screen_share(&self) -> Result<(), SdkError> {
            if self.state.lock().unwrap().no_screen_share {
                return Err(SdkError::Unsupported("screen share".to_string()));
            }
            self.record("start_screen_share");
            Ok(())
        }

        async fn stop_screen_share(&self) -> Result<(), SdkError> {
            self.record("stop_screen_share");
            Ok(())
        }

        async fn attach_video(&self, user_id: &UserId, _quality: VideoQuality) -> Result<(), SdkError> {
            self.record(format!("attach {user_id}"));
            if self.state.lock().unwrap().fail_attach.contains(user_id) {
                return Err(SdkError::Failed("decoder busy".to_string()));
            }
            Ok(())
        }

        async fn detach_video(&self, user_id: &UserId) -> Result<(), SdkError> {
            self.record(format!("detach {user_id}"));
            Ok(())
        }

        async fn send_chat(&self, message: &str) -> Result<(), SdkError> {
            self.record(format!("chat {message}"));
            Ok(())
        }

        async fn leave(&self) -> Result<(), SdkError> {
            self.record("leave");
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum ViewCall {
        Attach {
            user_id: UserId,
            handle: TileHandle,
            placeholder: bool,
        },
        Update(TileHandle, TileStatus),
        Remove(TileHandle),
        Chat(String),
        Fallback(BackgroundMode, FallbackEffect),
        Ended(EndReason),
    }

    #[derive(Default)]
    pub(crate) struct RecordingView {
        next_handle: AtomicU64,
        calls: StdMutex<Vec<ViewCall>>,
        last_summary: StdMutex<Option<RosterSummary>>,
    }

    impl RecordingView {
        fn calls(&self) -> Vec<ViewCall> {
            self.calls.lock().unwrap().clone()
        }

        /// Live tiles per user, derived from attach/remove calls.
        fn live_tiles(&self) -> HashMap<UserId, usize> {
            let mut owners = HashMap::new();
            let mut live: HashMap<UserId, usize> = HashMap::new();
            for call in self.calls() {
                match call {
                    ViewCall::Attach { user_id, handle, .. } => {
                        owners.insert(handle, user_id.clone());
                        *live.entry(user_id).or_default() += 1;
                    }
                    ViewCall::Remove(handle) => {
                        let owner = owners.remove(&handle).expect("removed unknown handle");
                        *live.get_mut(&owner).unwrap() -= 1;
                    }
                    _ => {}
                }
            }
            live.retain(|_, count| *count > 0);
            live
        }

        fn attached_users(&self) -> Vec<UserId> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    ViewCall::Attach { user_id, .. } => Some(user_id),
                    _ => None,
                })
                .collect()
        }
    }

    impl CallView for RecordingView {
        fn attach_tile(
            &self,
            user_id: &UserId,
            _display_name: &str,
            _is_local: bool,
            placeholder: bool,
        ) -> TileHandle {
            let handle = TileHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
            self.calls.lock().unwrap().push(ViewCall::Attach {
                user_id: user_id.clone(),
                handle,
                placeholder,
            });
            handle
        }

        fn update_tile(&self, handle: TileHandle, status: &TileStatus) {
            self.calls
                .lock()
                .unwrap()
                .push(ViewCall::Update(handle, status.clone()));
        }

        fn remove_tile(&self, handle: TileHandle) {
            self.calls.lock().unwrap().push(ViewCall::Remove(handle));
        }

        fn roster_changed(&self, summary: &RosterSummary) {
            *self.last_summary.lock().unwrap() = Some(summary.clone());
        }

        fn chat_message(&self, entry: &ChatEntry) {
            self.calls
                .lock()
                .unwrap()
                .push(ViewCall::Chat(entry.text.clone()));
        }

        fn background_fallback(&self, mode: &BackgroundMode, effect: &FallbackEffect) {
            self.calls
                .lock()
                .unwrap()
                .push(ViewCall::Fallback(mode.clone(), effect.clone()));
        }

        fn session_ended(&self, reason: EndReason) {
            self.calls.lock().unwrap().push(ViewCall::Ended(reason));
        }
    }

    struct StaticTokens;

    #[async_trait]
    impl SignatureSource for StaticTokens {
        async fn fetch(&self, _request: &SignatureRequest) -> Result<Signature, TokenError> {
            Ok(Signature {
                token: "signed".to_string(),
                expires_at: Utc::now(),
            })
        }
    }

    struct FailingTokens;

    #[async_trait]
    impl SignatureSource for FailingTokens {
        async fn fetch(&self, _request: &SignatureRequest) -> Result<Signature, TokenError> {
            Err(TokenError::Exhausted {
                remote: "connection refused".to_string(),
                local: TokenError::NotConfigured.to_string(),
            })
        }
    }

    fn request(role: Role) -> JoinRequest {
        JoinRequest {
            session_name: "ROOM42".to_string(),
            user_name: "Me".to_string(),
            role,
        }
    }

    pub(crate) async fn join(
        role: Role,
        sdk: &Arc<FakeSdk>,
        view: &Arc<RecordingView>,
    ) -> CallSession {
        CallSession::join(
            request(role),
            sdk.clone(),
            view.clone(),
            &StaticTokens,
            SessionTiming::default(),
        )
        .await
        .expect("join should succeed")
    }

    /// Lets the event loop drain pending events. Time is paused, so this
    /// only advances once every task is idle.
    async fn settle() {
        time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn presenter_renders_everyone_with_video() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
            user("U2", "Bob", Role::Audience, false),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        assert_eq!(view.attached_users(), vec![uid("U1"), uid(ME)]);

        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U2"),
            action: MediaAction::Start,
        });
        settle().await;
        assert_eq!(view.live_tiles().get(&uid("U2")), Some(&1));

        let info = session.info().await;
        assert_eq!(info.participant_count, 2);
        assert!(info.audio_on);
        assert!(info.video_on);
        assert_eq!(info.presenter_id, Some(uid(ME)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_then_video_start_renders_once() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let _session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::UserJoined {
            user_id: uid("U1"),
            display_name: Some("Alice".to_string()),
        });
        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U1"),
            action: MediaAction::Start,
        });
        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U1"),
            action: MediaAction::Start,
        });
        settle().await;

        let attaches: Vec<_> = view
            .attached_users()
            .into_iter()
            .filter(|u| *u == uid("U1"))
            .collect();
        assert_eq!(attaches.len(), 1);
        assert_eq!(sdk.calls().iter().filter(|c| *c == "attach U1").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn audience_only_renders_the_presenter() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Audience, false),
            user("U2", "Viewer", Role::Audience, true),
            user("P", "Host", Role::Presenter, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Audience, &sdk, &view).await;

        assert_eq!(view.attached_users(), vec![uid("P")]);
        assert_eq!(session.info().await.presenter_id, Some(uid("P")));

        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U2"),
            action: MediaAction::Start,
        });
        settle().await;
        assert_eq!(view.attached_users(), vec![uid("P")]);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_video_start_gets_a_placeholder_tile() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let _session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U42"),
            action: MediaAction::Start,
        });
        settle().await;

        let summary = view.last_summary.lock().unwrap().clone().unwrap();
        let placeholder = summary
            .participants
            .iter()
            .find(|p| p.user_id == uid("U42"))
            .expect("placeholder participant");
        assert_eq!(placeholder.display_name, "User U42");
        assert_eq!(view.live_tiles().get(&uid("U42")), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn attach_failure_falls_back_to_placeholder_tile() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
            user("U2", "Bob", Role::Audience, true),
        ]);
        sdk.state.lock().unwrap().fail_attach.insert(uid("U1"));
        let view = Arc::new(RecordingView::default());
        let _session = join(Role::Presenter, &sdk, &view).await;

        let attaches: Vec<_> = view
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                ViewCall::Attach {
                    user_id,
                    placeholder,
                    ..
                } => Some((user_id, placeholder)),
                _ => None,
            })
            .collect();
        assert!(attaches.contains(&(uid("U1"), true)));
        assert!(attaches.contains(&(uid("U2"), false)));
    }

    #[tokio::test(start_paused = true)]
    async fn video_stop_updates_status_and_keeps_tile() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let _session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U1"),
            action: MediaAction::Stop,
        });
        settle().await;

        assert_eq!(view.live_tiles().get(&uid("U1")), Some(&1));
        assert!(view.calls().iter().any(|call| matches!(
            call,
            ViewCall::Update(_, status) if status.display_name == "Alice" && !status.video_on
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn user_left_removes_tile() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::UserLeft { user_id: uid("U1") });
        settle().await;

        assert_eq!(view.live_tiles().get(&uid("U1")), None);
        assert!(sdk.calls().contains(&"detach U1".to_string()));
        assert_eq!(session.info().await.participant_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_failure_aborts_join_without_roster() {
        let sdk = FakeSdk::new(vec![user("U1", "Alice", Role::Presenter, true)]);
        let view = Arc::new(RecordingView::default());
        let result = CallSession::join(
            request(Role::Audience),
            sdk.clone(),
            view.clone(),
            &FailingTokens,
            SessionTiming::default(),
        )
        .await;

        let Err(JoinError::Token(TokenError::Exhausted { remote, .. })) = result else {
            panic!("expected token failure");
        };
        assert_eq!(remote, "connection refused");
        assert!(sdk.calls().is_empty());
        assert!(view.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_sdk_refuses_join() {
        let sdk = Arc::new(FakeSdk {
            available: false,
            state: StdMutex::new(FakeState::default()),
        });
        let view = Arc::new(RecordingView::default());
        let result = CallSession::join(
            request(Role::Presenter),
            sdk,
            view,
            &StaticTokens,
            SessionTiming::default(),
        )
        .await;
        assert!(matches!(result, Err(JoinError::SdkUnavailable(reason)) if reason == "not installed"));
    }

    #[tokio::test(start_paused = true)]
    async fn blank_names_are_rejected() {
        let sdk = FakeSdk::new(Vec::new());
        let view = Arc::new(RecordingView::default());
        let mut req = request(Role::Presenter);
        req.user_name = "   ".to_string();
        let result =
            CallSession::join(req, sdk, view, &StaticTokens, SessionTiming::default()).await;
        assert!(matches!(result, Err(JoinError::InvalidRequest(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_merges_missed_participants() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let _session = join(Role::Presenter, &sdk, &view).await;

        // Join and video events for U5 were dropped.
        sdk.set_users(vec![
            user(ME, "Me", Role::Presenter, true),
            user("U5", "Eve", Role::Audience, true),
        ]);
        settle().await;
        assert_eq!(view.live_tiles().get(&uid("U5")), None);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(view.live_tiles().get(&uid("U5")), Some(&1));
        assert_eq!(view.live_tiles().get(&uid(ME)), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_retries_presenter_resolution_for_audience() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Audience, false)]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Audience, &sdk, &view).await;
        assert_eq!(session.info().await.presenter_id, None);

        sdk.set_users(vec![
            user(ME, "Me", Role::Audience, true),
            user("P", "Host", Role::Presenter, true),
        ]);
        time::sleep(Duration::from_secs(6)).await;

        assert_eq!(session.info().await.presenter_id, Some(uid("P")));
        assert_eq!(view.attached_users(), vec![uid("P")]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_change_rebuilds_roster_and_honours_leaves() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
            user("U3", "Carol", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = Arc::new(join(Role::Presenter, &sdk, &view).await);
        assert_eq!(view.live_tiles().len(), 3);

        let transition = tokio::spawn({
            let session = session.clone();
            async move { session.set_background(BackgroundMode::Green).await }
        });
        settle().await;
        assert!(session.info().await.changing_background);

        // Dropped while suppressed.
        sdk.emit(SdkEvent::VideoStateChanged {
            user_id: uid("U1"),
            action: MediaAction::Stop,
        });
        // Still processed while suppressed.
        sdk.emit(SdkEvent::UserLeft { user_id: uid("U3") });
        sdk.set_users(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        settle().await;
        assert_eq!(view.live_tiles().get(&uid("U3")), None);
        assert!(!view
            .calls()
            .iter()
            .any(|call| matches!(call, ViewCall::Update(..))));

        transition.await.unwrap().expect("background applied");

        let live = view.live_tiles();
        assert_eq!(live.get(&uid("U1")), Some(&1));
        assert_eq!(live.get(&uid(ME)), Some(&1));
        assert_eq!(live.get(&uid("U3")), None);
        assert_eq!(view.attached_users().iter().filter(|u| **u == uid("U3")).count(), 1);

        let info = session.info().await;
        assert_eq!(info.background, BackgroundMode::Green);
        assert!(!info.changing_background);
        assert!(sdk
            .calls()
            .iter()
            .any(|c| c.starts_with("start_video Some(Color(")));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_background_falls_back_and_is_still_recorded() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        sdk.state.lock().unwrap().reject_backgrounds = true;
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        session
            .set_background(BackgroundMode::Blur)
            .await
            .expect("fallback is not an error");

        assert!(view.calls().contains(&ViewCall::Fallback(
            BackgroundMode::Blur,
            FallbackEffect::Blur { radius_px: 8 }
        )));
        let calls = sdk.calls();
        let rejected = calls
            .iter()
            .position(|c| c == "start_video Some(Blur)")
            .expect("background attempted");
        assert_eq!(calls[rejected + 1], "start_video None");
        let info = session.info().await;
        assert_eq!(info.background, BackgroundMode::Blur);
        assert!(info.video_on);
        assert_eq!(view.live_tiles().get(&uid(ME)), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn background_requires_presenter_with_video() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Audience, false)]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Audience, &sdk, &view).await;
        assert_eq!(
            session.set_background(BackgroundMode::Black).await,
            Err(SessionError::NotPresenter)
        );

        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;
        assert_eq!(session.toggle_video().await, Ok(false));
        assert_eq!(
            session.set_background(BackgroundMode::Black).await,
            Err(SessionError::VideoOff)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn video_toggle_queued_behind_background_change_matches_the_camera() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = Arc::new(join(Role::Presenter, &sdk, &view).await);
        sdk.state.lock().unwrap().audio_delay = Duration::from_millis(50);

        // A slow mute holds local media while both requests queue up.
        let mute = tokio::spawn({
            let session = session.clone();
            async move { session.toggle_audio().await }
        });
        let transition = tokio::spawn({
            let session = session.clone();
            async move { session.set_background(BackgroundMode::Green).await }
        });
        let toggle = tokio::spawn({
            let session = session.clone();
            async move { session.toggle_video().await }
        });

        assert_eq!(mute.await.unwrap(), Ok(false));
        transition.await.unwrap().expect("background applied");
        let toggled = toggle.await.unwrap();
        settle().await;

        let camera_on = sdk.camera_on();
        let info = session.info().await;
        assert_eq!(info.video_on, camera_on);
        assert_eq!(info.background, BackgroundMode::Green);
        assert_eq!(view.live_tiles().contains_key(&uid(ME)), camera_on);
        match toggled {
            Ok(video_on) => assert_eq!(video_on, camera_on),
            Err(err) => {
                assert_eq!(err, SessionError::TransitionInProgress);
                assert!(camera_on);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn screen_share_toggles_without_touching_tiles() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Audience, false),
            user("P", "Host", Role::Presenter, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Audience, &sdk, &view).await;
        let rendered = view.calls().len();

        assert_eq!(session.toggle_screen_share().await, Ok(true));
        assert!(session.info().await.screen_sharing);
        assert_eq!(session.toggle_screen_share().await, Ok(false));
        assert!(!session.info().await.screen_sharing);
        assert!(sdk
            .calls()
            .ends_with(&["start_screen_share".to_string(), "stop_screen_share".to_string()]));
        assert_eq!(view.calls().len(), rendered);

        sdk.state.lock().unwrap().no_screen_share = true;
        assert!(matches!(
            session.toggle_screen_share().await,
            Err(SessionError::Sdk(SdkError::Unsupported(_)))
        ));
        assert!(!session.info().await.screen_sharing);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_image_background_falls_back_to_an_image_fill() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        sdk.state.lock().unwrap().reject_backgrounds = true;
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        let remote = BackgroundMode::Image("https://example.com/office.png".to_string());
        assert!(matches!(
            session.set_background(remote).await,
            Err(SessionError::InvalidBackground(_))
        ));
        assert!(!sdk.calls().contains(&"stop_video".to_string()));

        let url = "data:image/png;base64,iVBORw0KGgo=".to_string();
        session
            .set_background(BackgroundMode::Image(url.clone()))
            .await
            .expect("fallback is not an error");
        assert!(view.calls().contains(&ViewCall::Fallback(
            BackgroundMode::Image(url.clone()),
            FallbackEffect::Image { url: url.clone() }
        )));
        assert_eq!(session.info().await.background, BackgroundMode::Image(url));
    }

    #[tokio::test(start_paused = true)]
    async fn leave_mid_transition_tears_everything_down() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = Arc::new(join(Role::Presenter, &sdk, &view).await);

        let transition = tokio::spawn({
            let session = session.clone();
            async move { session.set_background(BackgroundMode::Blue).await }
        });
        settle().await;

        session.leave().await.expect("leave");
        assert!(view.live_tiles().is_empty());
        assert_eq!(view.calls().last(), Some(&ViewCall::Ended(EndReason::Left)));

        transition.await.unwrap().expect("transition finishes quietly");
        assert!(view.live_tiles().is_empty());
        assert!(sdk.calls().contains(&"leave".to_string()));
        assert_eq!(session.toggle_audio().await, Err(SessionError::Ended));
        // Leaving twice is harmless.
        assert_eq!(session.leave().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn sdk_disconnect_ends_session() {
        let sdk = FakeSdk::new(vec![
            user(ME, "Me", Role::Presenter, false),
            user("U1", "Alice", Role::Audience, true),
        ]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::SessionLeft);
        settle().await;

        assert!(session.is_ended());
        assert!(view.live_tiles().is_empty());
        assert!(view
            .calls()
            .contains(&ViewCall::Ended(EndReason::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn toggling_audio_updates_local_tile() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        assert_eq!(session.toggle_audio().await, Ok(false));
        assert!(sdk.calls().contains(&"stop_audio".to_string()));
        assert!(view.calls().iter().any(|call| matches!(
            call,
            ViewCall::Update(_, status) if status.audio_muted
        )));
        assert_eq!(session.toggle_audio().await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn chat_messages_are_logged() {
        let sdk = FakeSdk::new(vec![user(ME, "Me", Role::Presenter, false)]);
        let view = Arc::new(RecordingView::default());
        let session = join(Role::Presenter, &sdk, &view).await;

        sdk.emit(SdkEvent::ChatMessage {
            sender_id: uid("U1"),
            sender_name: "Alice".to_string(),
            message: "hello".to_string(),
        });
        settle().await;
        let entry = session.send_chat("  hi there ").await.expect("sent");
        assert_eq!(entry.text, "hi there");
        assert_eq!(session.send_chat("   ").await, Err(SessionError::EmptyMessage));

        let history = session.chat_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender_name, "Alice");
        assert!(!history[0].own);
        assert!(history[1].own);
        assert!(sdk.calls().contains(&"chat hi there".to_string()));
        assert!(view.calls().contains(&ViewCall::Chat("hello".to_string())));
    }

    #[test]
    fn sdk_and_token_errors_convert_with_their_messages() {
        let err: SessionError = SdkError::UnknownUser(uid("U9")).into();
        assert_eq!(err, SessionError::Sdk(SdkError::UnknownUser(uid("U9"))));
        assert_eq!(err.to_string(), "unknown user U9");

        let join: JoinError = TokenError::NotConfigured.into();
        assert_eq!(join.to_string(), "SDK key and secret are not configured");
        assert_eq!(
            JoinError::Sdk(SdkError::NotJoined).to_string(),
            "failed to join session: not joined to a session"
        );
        assert_eq!(
            SessionError::InvalidBackground("image is empty".into()).to_string(),
            "invalid background image: image is empty"
        );
    }

    #[test]
    fn meeting_ids_are_six_base36_characters() {
        for _ in 0..50 {
            let id = generate_meeting_id();
            assert_eq!(id.len(), 6);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }
}
