//! [`CallView`] backed by the Tauri webview: every call becomes an event the
//! frontend renders.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tauri::{AppHandle, Emitter, Runtime};

use crate::background::{BackgroundMode, FallbackEffect};
use crate::chat::ChatEntry;
use crate::roster::{TileHandle, TileStatus, UserId};
use crate::session::{CallView, EndReason, RosterSummary};

pub const TILE_ATTACH: &str = "tile://attach";
pub const TILE_UPDATE: &str = "tile://update";
pub const TILE_REMOVE: &str = "tile://remove";
pub const ROSTER_CHANGED: &str = "roster://changed";
pub const CHAT_MESSAGE: &str = "chat://message";
pub const BACKGROUND_FALLBACK: &str = "background://fallback";
pub const SESSION_ENDED: &str = "session://ended";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TileAttached<'a> {
    handle: u64,
    user_id: &'a UserId,
    display_name: &'a str,
    is_local: bool,
    placeholder: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TileUpdated<'a> {
    handle: u64,
    #[serde(flatten)]
    status: &'a TileStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackgroundFallback<'a> {
    mode: &'a BackgroundMode,
    effect: &'a FallbackEffect,
}

/// Hands out tile handles and forwards everything to the frontend.
pub struct WebviewView<R: Runtime> {
    app: AppHandle<R>,
    next_handle: AtomicU64,
}

impl<R: Runtime> WebviewView<R> {
    pub fn new(app: AppHandle<R>) -> Self {
        Self {
            app,
            next_handle: AtomicU64::new(1),
        }
    }

    fn emit<S: Serialize + Clone>(&self, event: &str, payload: S) {
        if let Err(e) = self.app.emit(event, payload) {
            tracing::warn!("failed to emit {event}: {e}");
        }
    }
}

impl<R: Runtime> CallView for WebviewView<R> {
    fn attach_tile(
        &self,
        user_id: &UserId,
        display_name: &str,
        is_local: bool,
        placeholder: bool,
    ) -> TileHandle {
        let handle = TileHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.emit(
            TILE_ATTACH,
            TileAttached {
                handle: handle.get(),
                user_id,
                display_name,
                is_local,
                placeholder,
            },
        );
        handle
    }

    fn update_tile(&self, handle: TileHandle, status: &TileStatus) {
        self.emit(
            TILE_UPDATE,
            TileUpdated {
                handle: handle.get(),
                status,
            },
        );
    }

    fn remove_tile(&self, handle: TileHandle) {
        self.emit(TILE_REMOVE, handle.get());
    }

    fn roster_changed(&self, summary: &RosterSummary) {
        self.emit(ROSTER_CHANGED, summary);
    }

    fn chat_message(&self, entry: &ChatEntry) {
        self.emit(CHAT_MESSAGE, entry);
    }

    fn background_fallback(&self, mode: &BackgroundMode, effect: &FallbackEffect) {
        self.emit(BACKGROUND_FALLBACK, BackgroundFallback { mode, effect });
    }

    fn session_ended(&self, reason: EndReason) {
        self.emit(SESSION_ENDED, reason);
    }
}
