//! Participant roster and video tile reconciliation.
//!
//! `RosterState` turns the unordered stream of SDK lifecycle events into a
//! duplicate-free list of tile directives. It performs no I/O: the session
//! feeds it events together with whatever user-list snapshot the SDK
//! returned, executes the directives it hands back, and reports tile handles
//! through [`RosterState::bind_handle`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Opaque, stable participant identifier assigned by the SDK.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Role of a participant in the call. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Audience,
}

impl Role {
    /// Numeric role flag used by the SDK and inside session signatures.
    pub fn role_type(self) -> u8 {
        match self {
            Role::Presenter => 1,
            Role::Audience => 0,
        }
    }

    pub fn from_role_type(flag: u8) -> Self {
        if flag == 1 {
            Role::Presenter
        } else {
            Role::Audience
        }
    }
}

/// Opaque reference to the on-screen tile for one participant, minted by the
/// rendering shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileHandle(u64);

impl TileHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaAction {
    Start,
    Stop,
}

/// One entry of the SDK's full user list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub role: Role,
    pub video_on: bool,
}

/// Per-participant tile lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// In the roster, no tile.
    Known { video_on: bool },
    /// Attach directive issued, handle not yet reported back.
    Attaching { video_on: bool },
    /// Tile on screen. `live` is false after a video stop; the tile is kept.
    Rendered { handle: TileHandle, live: bool },
}

impl TileState {
    pub fn video_on(&self) -> bool {
        match *self {
            TileState::Known { video_on } | TileState::Attaching { video_on } => video_on,
            TileState::Rendered { live, .. } => live,
        }
    }

    pub fn handle(&self) -> Option<TileHandle> {
        match *self {
            TileState::Rendered { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub audio_muted: bool,
    pub state: TileState,
}

impl Participant {
    fn new(user_id: UserId, display_name: Option<String>, video_on: bool) -> Self {
        let display_name = display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| placeholder_name(&user_id));
        Self {
            user_id,
            display_name,
            audio_muted: false,
            state: TileState::Known { video_on },
        }
    }

    pub fn has_video(&self) -> bool {
        self.state.video_on()
    }

    pub fn render_handle(&self) -> Option<TileHandle> {
        self.state.handle()
    }

    fn status(&self) -> TileStatus {
        TileStatus {
            display_name: self.display_name.clone(),
            video_on: self.has_video(),
            audio_muted: self.audio_muted,
        }
    }
}

/// Name shown for a participant the SDK has not named yet.
pub fn placeholder_name(user_id: &UserId) -> String {
    format!("User {user_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileStatus {
    pub display_name: String,
    pub video_on: bool,
    pub audio_muted: bool,
}

/// Instruction for the rendering shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Create a tile. The shell must report the new handle via `bind_handle`.
    Attach {
        user_id: UserId,
        display_name: String,
        is_local: bool,
    },
    /// Refresh the label/indicators of an existing tile.
    UpdateStatus {
        user_id: UserId,
        handle: TileHandle,
        status: TileStatus,
    },
    Remove { user_id: UserId, handle: TileHandle },
}

/// Roster of one call session.
#[derive(Debug)]
pub struct RosterState {
    participants: Vec<Participant>,
    local_user_id: UserId,
    local_role: Role,
    presenter_id: Option<UserId>,
    suppress_rendering: bool,
}

impl RosterState {
    pub fn new(local_user_id: UserId, local_role: Role) -> Self {
        Self {
            participants: Vec::new(),
            local_user_id,
            local_role,
            presenter_id: None,
            suppress_rendering: false,
        }
    }

    /// Participants in insertion order.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }

    pub fn local_user_id(&self) -> &UserId {
        &self.local_user_id
    }

    pub fn local_role(&self) -> Role {
        self.local_role
    }

    pub fn presenter_id(&self) -> Option<&UserId> {
        self.presenter_id.as_ref()
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_rendering
    }

    /// Number of participants other than the local user.
    pub fn remote_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.user_id != self.local_user_id)
            .count()
    }

    pub fn on_session_joined(&mut self, users: &[UserInfo]) -> Vec<Directive> {
        info!(users = users.len(), role = ?self.local_role, "session roster snapshot");
        let mut directives = self.merge(users);
        directives.extend(self.identify_presenter(users));
        directives
    }

    /// `users` is the SDK's current full user list, used for presenter
    /// resolution when the local client is Audience.
    pub fn on_user_joined(
        &mut self,
        user_id: UserId,
        display_name: Option<String>,
        users: &[UserInfo],
    ) -> Vec<Directive> {
        if user_id == self.local_user_id {
            return Vec::new();
        }

        let mut directives = Vec::new();
        match self.position(&user_id) {
            Some(index) => {
                // Usually a placeholder created by an early video start.
                let mut renamed = false;
                if let Some(name) = display_name.filter(|name| !name.trim().is_empty()) {
                    if let Some(participant) = self.participants.get_mut(index) {
                        if participant.display_name != name {
                            participant.display_name = name;
                            renamed = true;
                        }
                    }
                }
                if renamed {
                    directives.extend(self.status_update(index));
                }
            }
            None => {
                debug!(user = %user_id, "participant joined");
                self.insert(user_id, display_name, false);
            }
        }

        directives.extend(self.identify_presenter(users));
        directives
    }

    /// Removal is unconditional: it is emitted even while rendering is
    /// suppressed.
    pub fn on_user_left(&mut self, user_id: &UserId) -> Vec<Directive> {
        let Some(index) = self.position(user_id) else {
            return Vec::new();
        };
        let participant = self.participants.remove(index);
        debug!(user = %user_id, "participant left");

        participant
            .render_handle()
            .map(|handle| Directive::Remove {
                user_id: participant.user_id,
                handle,
            })
            .into_iter()
            .collect()
    }

    pub fn on_video_state(&mut self, user_id: UserId, action: MediaAction) -> Vec<Directive> {
        if self.suppress_rendering {
            debug!(user = %user_id, ?action, "video state change dropped while suppressed");
            return Vec::new();
        }
        match action {
            MediaAction::Start => self.video_started(user_id),
            MediaAction::Stop => self.video_stopped(&user_id),
        }
    }

    pub fn on_audio_state(&mut self, user_id: &UserId, action: MediaAction) -> Vec<Directive> {
        if self.suppress_rendering {
            return Vec::new();
        }
        let Some(index) = self.position(user_id) else {
            return Vec::new();
        };
        let muted = action == MediaAction::Stop;
        match self.participants.get_mut(index) {
            Some(participant) if participant.audio_muted != muted => {
                participant.audio_muted = muted;
            }
            _ => return Vec::new(),
        }
        self.status_update(index).into_iter().collect()
    }

    /// Resolves the presenter for an Audience client. First resolution wins;
    /// once set, the presenter is never re-resolved.
    pub fn identify_presenter(&mut self, users: &[UserInfo]) -> Vec<Directive> {
        if self.local_role != Role::Audience || self.presenter_id.is_some() {
            return Vec::new();
        }

        let local = &self.local_user_id;
        let chosen = users
            .iter()
            .filter(|u| u.user_id != *local)
            .find(|u| u.role == Role::Presenter)
            .or_else(|| users.iter().find(|u| u.user_id != *local))
            .map(|u| u.user_id.clone())
            .or_else(|| {
                self.participants
                    .iter()
                    .find(|p| p.user_id != *local)
                    .map(|p| p.user_id.clone())
            });

        let Some(presenter) = chosen else {
            debug!("no presenter candidate yet");
            return Vec::new();
        };
        info!(presenter = %presenter, "presenter identified");
        self.presenter_id = Some(presenter.clone());

        let snapshot = users.iter().find(|u| u.user_id == presenter);
        let index = match (self.position(&presenter), snapshot) {
            (Some(index), _) => index,
            (None, Some(user)) => self.insert(presenter, user.display_name.clone(), false),
            (None, None) => return Vec::new(),
        };

        // Catch up if the presenter's video is already flowing.
        if snapshot.is_some_and(|u| u.video_on) {
            if let Some(participant) = self.participants.get_mut(index) {
                if let TileState::Known { .. } = participant.state {
                    participant.state = TileState::Known { video_on: true };
                }
            }
        }
        self.try_render(index).into_iter().collect()
    }

    /// Periodic sweep: merges participants missed by dropped or reordered
    /// events and retries presenter resolution.
    pub fn refresh(&mut self, users: &[UserInfo]) -> Vec<Directive> {
        if self.suppress_rendering {
            return Vec::new();
        }
        let mut directives = self.merge(users);
        directives.extend(self.identify_presenter(users));
        directives
    }

    /// Returns false if a suppression window is already open.
    pub fn begin_suppression(&mut self) -> bool {
        if self.suppress_rendering {
            return false;
        }
        self.suppress_rendering = true;
        true
    }

    /// Closes the suppression window and discards the whole roster. Every
    /// existing tile gets a removal directive; call [`RosterState::rebuild`]
    /// afterwards to re-derive the roster from a fresh snapshot.
    pub fn end_suppression(&mut self) -> Vec<Directive> {
        self.suppress_rendering = false;
        self.drain_tiles()
    }

    pub fn rebuild(&mut self, users: &[UserInfo]) -> Vec<Directive> {
        if self.suppress_rendering {
            return Vec::new();
        }
        self.merge(users)
    }

    /// Stores the handle the shell created for an attach directive.
    ///
    /// Returns a follow-up directive when the handle cannot be kept (the
    /// participant left or was re-added meanwhile) or when the video stopped
    /// while the tile was being created.
    pub fn bind_handle(&mut self, user_id: &UserId, handle: TileHandle) -> Option<Directive> {
        let index = self.position(user_id);
        let participant = index.and_then(|i| self.participants.get_mut(i));
        match participant {
            Some(participant) => match participant.state {
                TileState::Attaching { video_on } => {
                    participant.state = TileState::Rendered {
                        handle,
                        live: video_on,
                    };
                    if video_on {
                        None
                    } else {
                        index.and_then(|i| self.status_update(i))
                    }
                }
                state => {
                    warn!(user = %user_id, ?state, "unexpected tile handle, discarding");
                    Some(Directive::Remove {
                        user_id: user_id.clone(),
                        handle,
                    })
                }
            },
            None => {
                debug!(user = %user_id, "tile handle arrived after participant left");
                Some(Directive::Remove {
                    user_id: user_id.clone(),
                    handle,
                })
            }
        }
    }

    /// Leave-session cleanup. Bypasses suppression.
    pub fn teardown(&mut self) -> Vec<Directive> {
        self.suppress_rendering = false;
        self.presenter_id = None;
        self.drain_tiles()
    }

    fn video_started(&mut self, user_id: UserId) -> Vec<Directive> {
        let index = match self.position(&user_id) {
            Some(index) => index,
            None => {
                debug!(user = %user_id, "video started before join, adding placeholder");
                self.insert(user_id.clone(), None, false)
            }
        };

        if self.local_role == Role::Audience
            && self.presenter_id.is_none()
            && user_id != self.local_user_id
        {
            info!(presenter = %user_id, "presenter assumed from first video start");
            self.presenter_id = Some(user_id);
        }

        let Some(participant) = self.participants.get_mut(index) else {
            return Vec::new();
        };
        let state = participant.state;
        match state {
            TileState::Known { .. } => {
                participant.state = TileState::Known { video_on: true };
                self.try_render(index).into_iter().collect()
            }
            TileState::Attaching { .. } => {
                participant.state = TileState::Attaching { video_on: true };
                Vec::new()
            }
            TileState::Rendered { handle, live: false } => {
                participant.state = TileState::Rendered { handle, live: true };
                self.status_update(index).into_iter().collect()
            }
            TileState::Rendered { live: true, .. } => Vec::new(),
        }
    }

    fn video_stopped(&mut self, user_id: &UserId) -> Vec<Directive> {
        let Some(index) = self.position(user_id) else {
            return Vec::new();
        };
        let Some(participant) = self.participants.get_mut(index) else {
            return Vec::new();
        };
        let state = participant.state;
        match state {
            TileState::Known { .. } => {
                participant.state = TileState::Known { video_on: false };
                Vec::new()
            }
            TileState::Attaching { .. } => {
                participant.state = TileState::Attaching { video_on: false };
                Vec::new()
            }
            TileState::Rendered { handle, live: true } => {
                participant.state = TileState::Rendered { handle, live: false };
                self.status_update(index).into_iter().collect()
            }
            TileState::Rendered { live: false, .. } => Vec::new(),
        }
    }

    fn merge(&mut self, users: &[UserInfo]) -> Vec<Directive> {
        let mut directives = Vec::new();
        for user in users {
            if self.position(&user.user_id).is_some() {
                continue;
            }
            let index = self.insert(user.user_id.clone(), user.display_name.clone(), user.video_on);
            directives.extend(self.try_render(index));
        }
        directives
    }

    fn is_eligible(&self, user_id: &UserId) -> bool {
        if *user_id == self.local_user_id {
            return self.local_role == Role::Presenter;
        }
        match self.local_role {
            Role::Presenter => true,
            Role::Audience => self.presenter_id.as_ref() == Some(user_id),
        }
    }

    fn try_render(&mut self, index: usize) -> Option<Directive> {
        if self.suppress_rendering {
            return None;
        }
        let participant = self.participants.get(index)?;
        if participant.state != (TileState::Known { video_on: true })
            || !self.is_eligible(&participant.user_id)
        {
            return None;
        }
        let is_local = participant.user_id == self.local_user_id;
        let participant = self.participants.get_mut(index)?;
        participant.state = TileState::Attaching { video_on: true };
        Some(Directive::Attach {
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            is_local,
        })
    }

    fn status_update(&self, index: usize) -> Option<Directive> {
        if self.suppress_rendering {
            return None;
        }
        let participant = self.participants.get(index)?;
        let handle = participant.render_handle()?;
        Some(Directive::UpdateStatus {
            user_id: participant.user_id.clone(),
            handle,
            status: participant.status(),
        })
    }

    fn drain_tiles(&mut self) -> Vec<Directive> {
        self.participants
            .drain(..)
            .filter_map(|p| {
                let handle = p.render_handle()?;
                Some(Directive::Remove {
                    user_id: p.user_id,
                    handle,
                })
            })
            .collect()
    }

    fn insert(&mut self, user_id: UserId, display_name: Option<String>, video_on: bool) -> usize {
        self.participants
            .push(Participant::new(user_id, display_name, video_on));
        self.participants.len() - 1
    }

    fn position(&self, user_id: &UserId) -> Option<usize> {
        self.participants.iter().position(|p| p.user_id == *user_id)
    }
}
