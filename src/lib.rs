pub mod background;
pub mod chat;
pub mod livekit_room;
pub mod local_audio;
pub mod local_video;
pub mod logging;
pub mod roster;
pub mod sdk;
pub mod session;
pub mod settings;
pub mod signature_server;
pub mod token;
mod webview;

use background::BackgroundMode;
use chat::ChatEntry;
use livekit_room::LiveKitSdk;
use roster::Role;
use sdk::{SdkAvailability, VideoSdk};
use session::{CallSession, JoinRequest, MeetingInfo, SessionTiming};
use settings::Settings;
use std::future::Future;
use std::sync::Arc;
use tauri::{AppHandle, Manager, State, WindowEvent};
use token::TokenClient;
use tokio::sync::Mutex as TokioMutex;
use webview::WebviewView;

struct SettingsPath(std::path::PathBuf);

/// The call this window is in, if any. Ended sessions stay here until the
/// next join replaces them.
#[derive(Default)]
struct ActiveCall(TokioMutex<Option<Arc<CallSession>>>);

impl ActiveCall {
    async fn current(&self) -> Result<Arc<CallSession>, String> {
        self.0
            .lock()
            .await
            .clone()
            .ok_or_else(|| "Not in a meeting".to_string())
    }

    /// Runs `connect` without holding the slot, so other commands are not
    /// blocked behind the network join. A call stored in the meantime wins
    /// and the new session is left again.
    async fn join_with<F>(&self, connect: F) -> Result<MeetingInfo, String>
    where
        F: Future<Output = Result<CallSession, String>>,
    {
        if in_live_call(&*self.0.lock().await) {
            return Err(ALREADY_IN_CALL.to_string());
        }

        let session = connect.await?;

        let mut active = self.0.lock().await;
        if in_live_call(&active) {
            drop(active);
            if let Err(e) = session.leave().await {
                tracing::warn!("failed to leave duplicate meeting: {e}");
            }
            return Err(ALREADY_IN_CALL.to_string());
        }
        let info = session.info().await;
        *active = Some(Arc::new(session));
        Ok(info)
    }

    async fn leave(&self) -> Result<(), String> {
        let session = self.0.lock().await.take();
        match session {
            Some(session) => session.leave().await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}

#[tauri::command]
fn sdk_status(settings_path: State<'_, SettingsPath>) -> SdkAvailability {
    let settings = Settings::load_or_default(&settings_path.0);
    LiveKitSdk::new(settings.livekit_url).probe()
}

#[tauri::command]
fn save_settings(settings_path: State<'_, SettingsPath>, settings: Settings) -> Result<(), String> {
    settings.save(&settings_path.0).map_err(|e| format!("{e:#}"))
}

#[tauri::command]
fn load_settings(settings_path: State<'_, SettingsPath>) -> Result<Settings, String> {
    Ok(Settings::load_or_default(&settings_path.0))
}

const ALREADY_IN_CALL: &str = "Already in a meeting, leave it first";

fn in_live_call(active: &Option<Arc<CallSession>>) -> bool {
    active.as_ref().is_some_and(|session| !session.is_ended())
}

async fn join(
    app: AppHandle,
    settings_path: &SettingsPath,
    call: &ActiveCall,
    request: JoinRequest,
) -> Result<MeetingInfo, String> {
    let settings = Settings::load_or_default(&settings_path.0);
    let sdk: Arc<dyn VideoSdk> = Arc::new(LiveKitSdk::new(settings.livekit_url.clone()));
    let tokens = TokenClient::new(
        settings.signature_server(),
        settings.credentials(),
        settings.token_ttl_secs,
    );
    let view = Arc::new(WebviewView::new(app));

    call.join_with(async {
        CallSession::join(request, sdk, view, &tokens, SessionTiming::default())
            .await
            .map_err(|e| e.to_string())
    })
    .await
}

#[tauri::command]
async fn join_meeting(
    app: AppHandle,
    settings_path: State<'_, SettingsPath>,
    call: State<'_, ActiveCall>,
    session_name: String,
    user_name: String,
    role: Role,
) -> Result<MeetingInfo, String> {
    let request = JoinRequest {
        session_name: session_name.trim().to_uppercase(),
        user_name,
        role,
    };
    join(app, &settings_path, &call, request).await
}

/// Starts a new meeting under a fresh id and joins it as presenter.
#[tauri::command]
async fn create_meeting(
    app: AppHandle,
    settings_path: State<'_, SettingsPath>,
    call: State<'_, ActiveCall>,
    user_name: String,
) -> Result<MeetingInfo, String> {
    let request = JoinRequest {
        session_name: session::generate_meeting_id(),
        user_name,
        role: Role::Presenter,
    };
    join(app, &settings_path, &call, request).await
}

#[tauri::command]
async fn leave_meeting(call: State<'_, ActiveCall>) -> Result<(), String> {
    call.leave().await
}

#[tauri::command]
async fn meeting_info(call: State<'_, ActiveCall>) -> Result<Option<MeetingInfo>, String> {
    let session = call.0.lock().await.clone();
    match session {
        Some(session) if !session.is_ended() => Ok(Some(session.info().await)),
        _ => Ok(None),
    }
}

#[tauri::command]
async fn toggle_audio(call: State<'_, ActiveCall>) -> Result<bool, String> {
    let session = call.current().await?;
    session.toggle_audio().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn toggle_video(call: State<'_, ActiveCall>) -> Result<bool, String> {
    let session = call.current().await?;
    session.toggle_video().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn toggle_screen_share(call: State<'_, ActiveCall>) -> Result<bool, String> {
    let session = call.current().await?;
    session.toggle_screen_share().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn set_background(call: State<'_, ActiveCall>, mode: BackgroundMode) -> Result<(), String> {
    let session = call.current().await?;
    session.set_background(mode).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn send_chat(call: State<'_, ActiveCall>, text: String) -> Result<ChatEntry, String> {
    let session = call.current().await?;
    session.send_chat(&text).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn chat_history(call: State<'_, ActiveCall>) -> Result<Vec<ChatEntry>, String> {
    let session = call.current().await?;
    Ok(session.chat_history().await)
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    logging::init_tracing();

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .manage(ActiveCall::default())
        .setup(|app| {
            let app_dir = app.path().app_config_dir().map_err(|e| e.to_string())?;
            app.manage(SettingsPath(app_dir.join("settings.json")));
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::CloseRequested { .. } = event {
                let call = window.state::<ActiveCall>();
                if let Err(e) = tauri::async_runtime::block_on(call.leave()) {
                    tracing::warn!("failed to leave meeting on close: {e}");
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            sdk_status,
            save_settings,
            load_settings,
            join_meeting,
            create_meeting,
            leave_meeting,
            meeting_info,
            toggle_audio,
            toggle_video,
            toggle_screen_share,
            set_background,
            send_chat,
            chat_history,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
