//! Outgoing video tracks: the camera and the screen share.
//!
//! Frames are synthesised from the selected backdrop: solid colour
//! backgrounds are painted directly, everything else gets a neutral grey.
//! Blur and image backgrounds need a segmentation pipeline this client does
//! not have, so they are reported as unsupported. The screen share is
//! painted the same way in its own colour.

use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::webrtc::video_frame::{I420Buffer, VideoFrame, VideoRotation};
use livekit::webrtc::video_source::native::NativeVideoSource;
use livekit::webrtc::video_source::{RtcVideoSource, VideoResolution};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::background::{Rgb, VirtualBackground};
use crate::sdk::SdkError;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / 15);
const NEUTRAL: Rgb = Rgb(0x3A, 0x3A, 0x3A);
const SCREEN: Rgb = Rgb(0x1E, 0x22, 0x2A);

/// A published painted track. Stop it with [`VideoHandle::stop`].
pub struct VideoHandle {
    track_sid: TrackSid,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// BT.601 limited-range conversion.
fn rgb_to_yuv(Rgb(r, g, b): Rgb) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 16.0 + 0.257 * r + 0.504 * g + 0.098 * b;
    let u = 128.0 - 0.148 * r - 0.291 * g + 0.439 * b;
    let v = 128.0 + 0.439 * r - 0.368 * g - 0.071 * b;
    (
        y.round().clamp(0.0, 255.0) as u8,
        u.round().clamp(0.0, 255.0) as u8,
        v.round().clamp(0.0, 255.0) as u8,
    )
}

fn backdrop_color(background: Option<&VirtualBackground>) -> Result<Rgb, SdkError> {
    match background {
        None => Ok(NEUTRAL),
        Some(VirtualBackground::Color(color)) => Ok(*color),
        Some(VirtualBackground::Blur) => Err(SdkError::Unsupported("background blur".to_string())),
        Some(VirtualBackground::Image(_)) => {
            Err(SdkError::Unsupported("image backgrounds".to_string()))
        }
    }
}

fn paint(buffer: &mut I420Buffer, color: Rgb) {
    let (y, u, v) = rgb_to_yuv(color);
    let (y_plane, u_plane, v_plane) = buffer.data_mut();
    y_plane.fill(y);
    u_plane.fill(u);
    v_plane.fill(v);
}

/// Publishes a camera track painted with `background`.
pub async fn start_camera(
    room: &Room,
    background: Option<&VirtualBackground>,
) -> Result<VideoHandle, SdkError> {
    let color = backdrop_color(background)?;
    publish_painted(room, "camera", TrackSource::Camera, color).await
}

/// Publishes the screen share track.
pub async fn start_screen_share(room: &Room) -> Result<VideoHandle, SdkError> {
    publish_painted(room, "screen", TrackSource::Screenshare, SCREEN).await
}

async fn publish_painted(
    room: &Room,
    name: &str,
    kind: TrackSource,
    color: Rgb,
) -> Result<VideoHandle, SdkError> {
    let source = NativeVideoSource::new(VideoResolution {
        width: WIDTH,
        height: HEIGHT,
    });
    let track = LocalVideoTrack::create_video_track(name, RtcVideoSource::Native(source.clone()));
    let publication = room
        .local_participant()
        .publish_track(
            LocalTrack::Video(track),
            TrackPublishOptions {
                source: kind,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| SdkError::Failed(format!("failed to publish {name} track: {e}")))?;
    crate::dlog!("[{name}] published {} painted {}", publication.sid(), color.hex());

    let (shutdown, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut frame = VideoFrame {
            rotation: VideoRotation::VideoRotation0,
            timestamp_us: 0,
            buffer: I420Buffer::new(WIDTH, HEIGHT),
        };
        paint(&mut frame.buffer, color);

        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    frame.timestamp_us = started.elapsed().as_micros() as i64;
                    source.capture_frame(&frame);
                }
            }
        }
        crate::dlog!("[video] frame loop stopped");
    });

    Ok(VideoHandle {
        track_sid: publication.sid(),
        shutdown,
        task,
    })
}

impl VideoHandle {
    pub async fn stop(self, room: &Room) -> Result<(), SdkError> {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        room.local_participant()
            .unpublish_track(&self.track_sid)
            .await
            .map_err(|e| SdkError::Failed(format!("failed to unpublish video track: {e}")))?;
        Ok(())
    }
}
