//! LiveKit implementation of [`VideoSdk`].
//!
//! Connects to a LiveKit room with a session signature, translates room
//! events into [`SdkEvent`]s, plays subscribed remote audio and publishes the
//! local microphone, camera and screen share.

use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::prelude::*;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as TokioMutex;

use crate::background::VirtualBackground;
use crate::local_audio::{self, MicrophoneHandle};
use crate::local_video::{self, VideoHandle};
use crate::roster::{MediaAction, Role, UserId, UserInfo};
use crate::sdk::{CurrentUser, SdkAvailability, SdkError, SdkEvent, VideoQuality, VideoSdk};

pub const CHAT_TOPIC: &str = "chat";

/// Reads the role flag carried in participant metadata (`{"role":1}`).
/// Anything unreadable is treated as audience.
pub fn role_from_metadata(metadata: &str) -> Role {
    serde_json::from_str::<serde_json::Value>(metadata)
        .ok()
        .and_then(|value| value.get("role").and_then(|role| role.as_u64()))
        .map(|flag| Role::from_role_type(u8::try_from(flag).unwrap_or(0)))
        .unwrap_or(Role::Audience)
}

fn decode_chat(topic: Option<&str>, payload: &[u8]) -> Option<String> {
    if topic != Some(CHAT_TOPIC) {
        return None;
    }
    let text = String::from_utf8_lossy(payload).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn non_empty(name: String) -> Option<String> {
    (!name.trim().is_empty()).then_some(name)
}

fn media_action(muted: bool) -> MediaAction {
    if muted {
        MediaAction::Stop
    } else {
        MediaAction::Start
    }
}

fn is_screen_share(source: TrackSource) -> bool {
    matches!(source, TrackSource::Screenshare | TrackSource::ScreenshareAudio)
}

fn remote_video_on(participant: &RemoteParticipant) -> bool {
    participant.track_publications().values().any(|publication| {
        publication.kind() == TrackKind::Video
            && !is_screen_share(publication.source())
            && !publication.is_muted()
    })
}

/// The parts of a [`RoomEvent`] the session cares about, lifted out of the
/// SDK's participant and publication handles.
#[derive(Debug, Clone, PartialEq)]
enum RoomSignal {
    Joined {
        identity: String,
        name: String,
    },
    Left {
        identity: String,
    },
    Track {
        identity: String,
        remote: bool,
        kind: TrackKind,
        source: TrackSource,
        muted: bool,
    },
    Data {
        identity: String,
        name: String,
        topic: Option<String>,
        payload: Vec<u8>,
    },
    Disconnected,
}

impl RoomSignal {
    fn from_event(event: &RoomEvent) -> Option<Self> {
        let signal = match event {
            RoomEvent::ParticipantConnected(participant) => RoomSignal::Joined {
                identity: participant.identity().to_string(),
                name: participant.name(),
            },
            RoomEvent::ParticipantDisconnected(participant) => RoomSignal::Left {
                identity: participant.identity().to_string(),
            },
            RoomEvent::TrackPublished {
                publication,
                participant,
            } => RoomSignal::Track {
                identity: participant.identity().to_string(),
                remote: true,
                kind: publication.kind(),
                source: publication.source(),
                muted: publication.is_muted(),
            },
            RoomEvent::TrackUnpublished {
                publication,
                participant,
            } => RoomSignal::Track {
                identity: participant.identity().to_string(),
                remote: true,
                kind: publication.kind(),
                source: publication.source(),
                muted: true,
            },
            RoomEvent::TrackMuted {
                participant,
                publication,
            }
            | RoomEvent::TrackUnmuted {
                participant,
                publication,
            } => {
                let (identity, remote) = match participant {
                    Participant::Remote(remote) => (remote.identity().to_string(), true),
                    Participant::Local(local) => (local.identity().to_string(), false),
                };
                RoomSignal::Track {
                    identity,
                    remote,
                    kind: publication.kind(),
                    source: publication.source(),
                    muted: matches!(event, RoomEvent::TrackMuted { .. }),
                }
            }
            RoomEvent::DataReceived {
                payload,
                topic,
                participant: Some(sender),
                ..
            } => RoomSignal::Data {
                identity: sender.identity().to_string(),
                name: sender.name(),
                topic: topic.clone(),
                payload: payload.to_vec(),
            },
            RoomEvent::Disconnected { reason } => {
                crate::dlog!("[LK] disconnected from room: {reason:?}");
                RoomSignal::Disconnected
            }
            _ => return None,
        };
        Some(signal)
    }
}

/// Maps a room signal to the session event it stands for. Local tracks and
/// screen shares never reach the roster.
fn translate(signal: RoomSignal) -> Option<SdkEvent> {
    match signal {
        RoomSignal::Joined { identity, name } => Some(SdkEvent::UserJoined {
            user_id: UserId::new(identity),
            display_name: non_empty(name),
        }),
        RoomSignal::Left { identity } => Some(SdkEvent::UserLeft {
            user_id: UserId::new(identity),
        }),
        RoomSignal::Track { remote: false, .. } => None,
        RoomSignal::Track { source, .. } if is_screen_share(source) => None,
        RoomSignal::Track {
            identity,
            kind,
            muted,
            ..
        } => {
            let user_id = UserId::new(identity);
            let action = media_action(muted);
            Some(match kind {
                TrackKind::Video => SdkEvent::VideoStateChanged { user_id, action },
                _ => SdkEvent::AudioStateChanged { user_id, action },
            })
        }
        RoomSignal::Data {
            identity,
            name,
            topic,
            payload,
        } => {
            let message = decode_chat(topic.as_deref(), &payload)?;
            let sender_name = non_empty(name).unwrap_or_else(|| identity.clone());
            Some(SdkEvent::ChatMessage {
                sender_id: UserId::new(identity),
                sender_name,
                message,
            })
        }
        RoomSignal::Disconnected => Some(SdkEvent::SessionLeft),
    }
}

struct Connection {
    room: Arc<Room>,
    microphone: Option<MicrophoneHandle>,
    camera: Option<VideoHandle>,
    screen: Option<VideoHandle>,
}

/// A LiveKit-backed video SDK. One instance serves one call at a time.
pub struct LiveKitSdk {
    url: String,
    connection: TokioMutex<Option<Connection>>,
}

impl LiveKitSdk {
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.split_whitespace().collect::<Vec<_>>().join(""),
            connection: TokioMutex::new(None),
        }
    }

    async fn room(&self) -> Result<Arc<Room>, SdkError> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.room.clone())
            .ok_or(SdkError::NotJoined)
    }

    fn spawn_event_pump(room: Arc<Room>, mut events: mpsc::UnboundedReceiver<RoomEvent>, tx: UnboundedSender<SdkEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let RoomEvent::TrackSubscribed {
                    track, participant, ..
                } = &event
                {
                    crate::dlog!("[LK] track subscribed from {}: sid={}, kind={:?}",
                        participant.identity(), track.sid(), track.kind());
                    if let RemoteTrack::Audio(audio_track) = track {
                        spawn_audio_playback(audio_track.clone());
                    }
                }

                let Some(signal) = RoomSignal::from_event(&event) else {
                    continue;
                };
                let disconnected = signal == RoomSignal::Disconnected;
                if let Some(translated) = translate(signal) {
                    crate::dlog!("[LK] {translated:?}");
                    if tx.send(translated).is_err() {
                        crate::dlog!("[LK] session stopped listening, ending event pump");
                        break;
                    }
                }
                if disconnected {
                    break;
                }
            }
            drop(room);
        });
    }

    fn with_remote<T>(
        room: &Room,
        user_id: &UserId,
        f: impl FnOnce(&RemoteParticipant) -> T,
    ) -> Result<T, SdkError> {
        room.remote_participants()
            .values()
            .find(|p| p.identity().to_string() == user_id.as_str())
            .map(f)
            .ok_or_else(|| SdkError::UnknownUser(user_id.clone()))
    }
}

#[async_trait]
impl VideoSdk for LiveKitSdk {
    fn probe(&self) -> SdkAvailability {
        if self.url.is_empty() {
            SdkAvailability::unavailable("LiveKit server URL is not configured")
        } else if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            SdkAvailability::unavailable(format!("LiveKit URL must start with ws:// or wss://, got {}", self.url))
        } else {
            SdkAvailability::ready()
        }
    }

    async fn join(
        &self,
        session: &str,
        signature: &str,
        user_name: &str,
    ) -> Result<UnboundedReceiver<SdkEvent>, SdkError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(SdkError::Failed("already in a session".to_string()));
        }

        crate::dlog!("[LK] connecting to {} for session {session} as {user_name}", self.url);
        let token = signature.split_whitespace().collect::<Vec<_>>().join("");
        let (room, events) = Room::connect(&self.url, &token, RoomOptions::default())
            .await
            .map_err(|e| {
                crate::dlog!("[LK] connection failed: {e}");
                SdkError::Failed(format!("failed to connect to LiveKit: {e}"))
            })?;
        let room = Arc::new(room);
        crate::dlog!("[LK] connected to room {}", room.name());

        let (tx, rx) = mpsc::unbounded_channel();
        Self::spawn_event_pump(room.clone(), events, tx.clone());
        let _ = tx.send(SdkEvent::SessionJoined);

        *connection = Some(Connection {
            room,
            microphone: None,
            camera: None,
            screen: None,
        });
        Ok(rx)
    }

    async fn current_user(&self) -> Result<CurrentUser, SdkError> {
        let connection = self.connection.lock().await;
        let connection = connection.as_ref().ok_or(SdkError::NotJoined)?;
        let local = connection.room.local_participant();
        Ok(CurrentUser {
            user_id: UserId::new(local.identity().to_string()),
            display_name: local.name(),
            video_on: connection.camera.is_some(),
        })
    }

    async fn all_users(&self) -> Result<Vec<UserInfo>, SdkError> {
        let connection = self.connection.lock().await;
        let connection = connection.as_ref().ok_or(SdkError::NotJoined)?;
        let local = connection.room.local_participant();

        let mut users = vec![UserInfo {
            user_id: UserId::new(local.identity().to_string()),
            display_name: non_empty(local.name()),
            role: role_from_metadata(&local.metadata()),
            video_on: connection.camera.is_some(),
        }];

        let mut remotes: Vec<_> = connection.room.remote_participants().into_values().collect();
        remotes.sort_by_key(|p| p.identity().to_string());
        users.extend(remotes.iter().map(|remote| UserInfo {
            user_id: UserId::new(remote.identity().to_string()),
            display_name: non_empty(remote.name()),
            role: role_from_metadata(&remote.metadata()),
            video_on: remote_video_on(remote),
        }));
        Ok(users)
    }

    async fn start_audio(&self) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if connection.microphone.is_some() {
            return Ok(());
        }
        let handle = local_audio::start_microphone(&connection.room)
            .await
            .map_err(|e| SdkError::Failed(format!("{e:#}")))?;
        connection.microphone = Some(handle);
        Ok(())
    }

    async fn stop_audio(&self) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if let Some(handle) = connection.microphone.take() {
            handle
                .stop(&connection.room)
                .await
                .map_err(|e| SdkError::Failed(format!("{e:#}")))?;
        }
        Ok(())
    }

    async fn start_video(&self, background: Option<&VirtualBackground>) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if connection.camera.is_some() {
            return Err(SdkError::Failed("video already started".to_string()));
        }
        connection.camera = Some(local_video::start_camera(&connection.room, background).await?);
        Ok(())
    }

    async fn stop_video(&self) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if let Some(handle) = connection.camera.take() {
            handle.stop(&connection.room).await?;
        }
        Ok(())
    }

    async fn start_screen_share(&self) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if connection.screen.is_some() {
            return Err(SdkError::Failed("screen share already started".to_string()));
        }
        connection.screen = Some(local_video::start_screen_share(&connection.room).await?);
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<(), SdkError> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().ok_or(SdkError::NotJoined)?;
        if let Some(handle) = connection.screen.take() {
            handle.stop(&connection.room).await?;
        }
        Ok(())
    }

    async fn attach_video(&self, user_id: &UserId, quality: VideoQuality) -> Result<(), SdkError> {
        let room = self.room().await?;
        if room.local_participant().identity().to_string() == user_id.as_str() {
            // Local preview comes from the camera track itself.
            return Ok(());
        }
        let subscribed = Self::with_remote(&room, user_id, |remote| {
            remote
                .track_publications()
                .values()
                .filter(|publication| publication.kind() == TrackKind::Video)
                .map(|publication| publication.set_subscribed(true))
                .count()
        })?;
        if subscribed == 0 {
            return Err(SdkError::Failed(format!("{user_id} has no video track")));
        }
        crate::dlog!("[LK] attached video for {user_id} at {quality:?}");
        Ok(())
    }

    async fn detach_video(&self, user_id: &UserId) -> Result<(), SdkError> {
        let room = self.room().await?;
        Self::with_remote(&room, user_id, |remote| {
            for publication in remote.track_publications().values() {
                if publication.kind() == TrackKind::Video {
                    publication.set_subscribed(false);
                }
            }
        })
    }

    async fn send_chat(&self, message: &str) -> Result<(), SdkError> {
        let room = self.room().await?;
        room.local_participant()
            .publish_data(DataPacket {
                payload: message.as_bytes().to_vec(),
                topic: Some(CHAT_TOPIC.to_string()),
                reliable: true,
                ..Default::default()
            })
            .await
            .map_err(|e| SdkError::Failed(format!("failed to send chat message: {e}")))
    }

    async fn leave(&self) -> Result<(), SdkError> {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        if let Some(handle) = connection.microphone.take() {
            if let Err(e) = handle.stop(&connection.room).await {
                crate::dlog!("[LK] failed to stop microphone on leave: {e:#}");
            }
        }
        for handle in [connection.camera.take(), connection.screen.take()].into_iter().flatten() {
            if let Err(e) = handle.stop(&connection.room).await {
                crate::dlog!("[LK] failed to stop video track on leave: {e}");
            }
        }
        connection
            .room
            .close()
            .await
            .map_err(|e| SdkError::Failed(format!("failed to disconnect: {e}")))
    }
}

/// Receives audio frames from a remote track and plays them on the default
/// output device.
fn spawn_audio_playback(track: RemoteAudioTrack) {
    tokio::spawn(async move {
        let mut audio_stream = NativeAudioStream::new(track.rtc_track(), 48_000, 2);
        crate::dlog!("[LK] audio playback started for track {}", track.sid());

        // Rodio's output stream is not Send; it lives on its own thread.
        let (pcm_tx, pcm_rx) = std::sync::mpsc::channel::<(Vec<f32>, u32, u32)>();
        std::thread::spawn(move || {
            use rodio::{buffer::SamplesBuffer, stream::OutputStreamBuilder, Sink};
            let stream = match OutputStreamBuilder::open_default_stream() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("failed to open audio output: {e}");
                    return;
                }
            };
            let sink = Sink::connect_new(stream.mixer());
            while let Ok((samples, sample_rate, channels)) = pcm_rx.recv() {
                sink.append(SamplesBuffer::new(channels as u16, sample_rate, samples));
            }
        });

        while let Some(frame) = audio_stream.next().await {
            let samples: Vec<f32> = frame.data.iter().map(|&s| s as f32 / 32768.0).collect();
            if pcm_tx
                .send((samples, frame.sample_rate, frame.num_channels))
                .is_err()
            {
                break;
            }
        }
        crate::dlog!("[LK] audio stream ended for track {}", track.sid());
    });
}
