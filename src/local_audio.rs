//! Microphone capture published as the local audio track.
//!
//! cpal delivers samples on its own thread in whatever layout the device
//! prefers; they are downmixed to mono, cut into 10 ms frames and pushed into
//! a LiveKit `NativeAudioSource` from a tokio task.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::webrtc::audio_frame::AudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const SAMPLE_RATE: u32 = 48_000;
const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE / 100) as usize; // 10ms
const FRAME_QUEUE: usize = 1024;

/// Running microphone publication. Dropping it without [`stop`] leaves the
/// track published until the room closes.
///
/// [`stop`]: MicrophoneHandle::stop
pub struct MicrophoneHandle {
    track_sid: TrackSid,
    capture_shutdown: std::sync::mpsc::Sender<()>,
    capture_thread: std::thread::JoinHandle<()>,
    pump_shutdown: oneshot::Sender<()>,
    pump: tokio::task::JoinHandle<()>,
}

/// Accumulates mono samples and hands out fixed-size frames.
#[derive(Debug, Default)]
struct FrameChunker {
    pending: Vec<i16>,
}

impl FrameChunker {
    fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= SAMPLES_PER_FRAME {
            frames.push(self.pending.drain(..SAMPLES_PER_FRAME).collect());
        }
        frames
    }
}

fn downmix_i16(data: &[i16], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|chunk| {
            let avg = chunk.iter().map(|s| *s as f32).sum::<f32>() / chunk.len() as f32;
            avg.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

fn downmix_f32(data: &[f32], channels: usize) -> Vec<i16> {
    data.chunks(channels)
        .map(|chunk| {
            let avg = chunk.iter().copied().sum::<f32>() / chunk.len() as f32;
            (avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
        })
        .collect()
}

fn downmix_u16(data: &[u16], channels: usize) -> Vec<i16> {
    let centred: Vec<f32> = data
        .iter()
        .map(|s| (*s as f32 / u16::MAX as f32) * 2.0 - 1.0)
        .collect();
    downmix_f32(&centred, channels)
}

fn select_input_config() -> Result<(cpal::Device, StreamConfig, SampleFormat)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No default input device")?;
    let configs = device
        .supported_input_configs()
        .context("Failed to query input configs")?;

    let (config, sample_format) = configs
        .filter(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
        .map(|c| {
            let format = c.sample_format();
            (c.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)).config(), format)
        })
        .next()
        .context("No 48kHz input config available")?;

    if config.channels == 0 {
        anyhow::bail!("Input device reports 0 channels");
    }
    Ok((device, config, sample_format))
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    frame_tx: mpsc::Sender<Vec<i16>>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let err_fn = |err| crate::dlog!("[mic] stream error: {err}");
    let mut chunker = FrameChunker::default();
    let mut forward = move |mono: Vec<i16>| {
        for frame in chunker.push(&mono) {
            // Drop frames rather than block the audio thread.
            let _ = frame_tx.try_send(frame);
        }
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _| forward(downmix_i16(data, channels)),
            err_fn,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _| forward(downmix_f32(data, channels)),
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _| forward(downmix_u16(data, channels)),
            err_fn,
            None,
        ),
        other => anyhow::bail!("Unsupported mic sample format {other:?}"),
    };
    stream.context("Failed to open mic stream")
}

/// cpal streams are not `Send`, so the stream lives on a dedicated thread
/// until shutdown is signalled.
fn spawn_capture_thread(
    frame_tx: mpsc::Sender<Vec<i16>>,
    shutdown_rx: std::sync::mpsc::Receiver<()>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stream = select_input_config().and_then(|(device, config, format)| {
            crate::dlog!("[mic] capturing {} channel(s) as {format:?}", config.channels);
            let stream = build_stream(&device, &config, format, frame_tx)?;
            stream.play().context("Failed to start mic stream")?;
            Ok(stream)
        });

        let stream = match stream {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };

        while let Err(std::sync::mpsc::RecvTimeoutError::Timeout) =
            shutdown_rx.recv_timeout(Duration::from_millis(200))
        {}
        drop(stream);
        crate::dlog!("[mic] capture thread ended");
    })
}

/// Opens the default microphone and publishes it to `room`.
pub async fn start_microphone(room: &Room) -> Result<MicrophoneHandle> {
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<i16>>(FRAME_QUEUE);
    let (capture_shutdown, shutdown_rx) = std::sync::mpsc::channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let capture_thread = spawn_capture_thread(frame_tx, shutdown_rx, ready_tx);

    tokio::task::spawn_blocking(move || ready_rx.recv())
        .await
        .context("Mic startup task failed")?
        .context("Mic thread exited before starting")??;

    let source = NativeAudioSource::new(
        AudioSourceOptions {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        },
        SAMPLE_RATE,
        1,
        100,
    );
    let track = LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source.clone()));
    let publication = room
        .local_participant()
        .publish_track(
            LocalTrack::Audio(track),
            TrackPublishOptions {
                source: TrackSource::Microphone,
                ..Default::default()
            },
        )
        .await;
    let publication = match publication {
        Ok(publication) => publication,
        Err(e) => {
            let _ = capture_shutdown.send(());
            return Err(e).context("Failed to publish microphone track");
        }
    };

    let (pump_shutdown, mut pump_shutdown_rx) = oneshot::channel();
    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut pump_shutdown_rx => break,
                frame = frame_rx.recv() => {
                    let Some(samples) = frame else { break };
                    let frame = AudioFrame {
                        data: Cow::Owned(samples),
                        sample_rate: SAMPLE_RATE,
                        num_channels: 1,
                        samples_per_channel: SAMPLES_PER_FRAME as u32,
                    };
                    if let Err(e) = source.capture_frame(&frame).await {
                        crate::dlog!("[mic] failed to capture frame: {e}");
                        break;
                    }
                }
            }
        }
    });

    Ok(MicrophoneHandle {
        track_sid: publication.sid(),
        capture_shutdown,
        capture_thread,
        pump_shutdown,
        pump,
    })
}

impl MicrophoneHandle {
    pub async fn stop(self, room: &Room) -> Result<()> {
        let _ = self.capture_shutdown.send(());
        let _ = self.pump_shutdown.send(());
        let thread = self.capture_thread;
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        let _ = self.pump.await;

        room.local_participant()
            .unpublish_track(&self.track_sid)
            .await
            .context("Failed to unpublish microphone track")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_emits_whole_frames_only() {
        let mut chunker = FrameChunker::default();
        assert!(chunker.push(&vec![1; SAMPLES_PER_FRAME - 1]).is_empty());

        let frames = chunker.push(&vec![2; SAMPLES_PER_FRAME + 5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), SAMPLES_PER_FRAME);
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[0][SAMPLES_PER_FRAME - 1], 2);
        assert_eq!(chunker.pending.len(), 6);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        assert_eq!(downmix_i16(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix_f32(&[1.0, 1.0, -1.0, 0.0], 2), vec![i16::MAX, -(i16::MAX / 2)]);
    }

    #[test]
    fn unsigned_samples_are_centred() {
        let mono = downmix_u16(&[0, u16::MAX], 1);
        assert_eq!(mono, vec![-i16::MAX, i16::MAX]);
    }
}
