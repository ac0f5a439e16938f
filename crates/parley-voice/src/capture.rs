//! Microphone capture via CPAL.
//!
//! The stream callback runs on the audio thread with a fixed budget: it
//! only accumulates samples into fixed-size hops and pushes them onto an
//! unbounded channel. VAD, recognition and state transitions all happen
//! on the segmentation worker that drains the channel. A shared
//! `CaptureGate` pauses the feed while the synthesizer is speaking so the
//! system never transcribes its own voice.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Audio capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default 16000).
    pub sample_rate: u32,
    /// Channel count (default 1, mono).
    pub channels: u16,
    /// Samples per hop (default 480 = 30ms at 16kHz).
    pub hop_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            hop_size: 480,
        }
    }
}

/// One hop of captured audio.
#[derive(Debug, Clone)]
pub struct AudioHop {
    /// f32 PCM, normalized to -1.0..1.0.
    pub samples: Vec<f32>,
    pub captured_at: Instant,
}

/// Pause/resume switch shared between the capture callback, the
/// segmentation worker and the turn controller.
///
/// Both ends honor it: the callback drops samples while paused (nothing
/// stale queues up), and the worker drops any hop that slipped in before
/// the pause landed. `pause()`/`resume()` are idempotent.
#[derive(Debug, Default)]
pub struct CaptureGate {
    paused: AtomicBool,
}

impl CaptureGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop feeding audio into the pipeline. In-flight recognizer calls
    /// are allowed to complete.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("⏸️ Capture paused");
        }
    }

    /// Resume feeding audio. Hops queued while paused were already
    /// discarded, so no stale audio replays.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("▶️ Capture resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Owns the microphone device and produces the hop stream.
pub struct CaptureLoop {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl CaptureLoop {
    /// Open the default input device. `DeviceUnavailable` here is fatal:
    /// reported to the caller, no retry.
    pub fn new(config: AudioConfig) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("no input device available".to_string()))?;
        info!(
            "🎤 Capture device: {} ({} Hz, {} ch, hop {})",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.sample_rate,
            config.channels,
            config.hop_size
        );
        // Probe the default config so an unusable device fails here, not
        // at stream build time.
        let _ = device.default_input_config()?;
        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start the input stream. Keep the returned `Stream` alive; dropping
    /// it stops capture.
    pub fn start(
        &self,
        hop_tx: mpsc::UnboundedSender<AudioHop>,
        gate: Arc<CaptureGate>,
    ) -> VoiceResult<Stream> {
        let hop_size = self.config.hop_size;
        let mut pending = Vec::with_capacity(hop_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if gate.is_paused() {
                    // Drop mid-hop remainders too; a hop must never mix
                    // pre-pause and post-resume audio.
                    pending.clear();
                    return;
                }
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= hop_size {
                        let hop = AudioHop {
                            samples: std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(hop_size),
                            ),
                            captured_at: Instant::now(),
                        };
                        if hop_tx.send(hop).is_err() {
                            warn!("Hop channel closed; capture output discarded");
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }

    /// Rebuild the stream after a silently-stopped device. Retried once
    /// per detection by the pipeline watchdog.
    pub fn restart(
        &self,
        hop_tx: mpsc::UnboundedSender<AudioHop>,
        gate: Arc<CaptureGate>,
    ) -> VoiceResult<Stream> {
        warn!("Restarting capture stream after silent stop");
        self.start(hop_tx, gate)
    }

    /// Names of available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}
