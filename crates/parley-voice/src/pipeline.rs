//! Pipeline assembly: capture → segmentation → recognition → turn → synthesis.
//!
//! Four cooperating execution contexts, communicating only over channels:
//!
//! - the cpal callback (audio thread) producing hops;
//! - a capture-owner thread that keeps the stream alive and restarts a
//!   silently-stopped device (once per detection);
//! - the segmentation worker, which owns the VAD gate (`!Send`) and the
//!   recognizer — the only thread with an inference call in flight;
//! - the turn controller and the synthesis worker.
//!
//! There is no global state: everything is constructed here once and
//! moved into the thread that owns it.

use crate::capture::{AudioConfig, AudioHop, CaptureGate, CaptureLoop};
use crate::chat::ChatBackend;
use crate::emotion::EmotionClassifier;
use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::{RecognizerEvent, StreamingRecognizer};
use crate::segment::{SegmentationEngine, SegmenterConfig};
use crate::synth::{
    run_synthesis_worker, AudioSink, PacingConfig, SpeechSynthesisQueue, SynthesizerBackend,
};
use crate::turn::{TurnConfig, TurnController};
use crate::vad::{VadConfig, VoiceActivityGate};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Hops older than this with capture unpaused mean the device went quiet.
const DEVICE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub pacing: PacingConfig,
    pub turn: TurnConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            segmenter: SegmenterConfig::default(),
            pacing: PacingConfig::default(),
            turn: TurnConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Capture, VAD and segmentation must agree on sample rate and hop
    /// size; mismatches here are construction errors, not runtime ones.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.audio.sample_rate != self.vad.sample_rate {
            return Err(VoiceError::Config(format!(
                "capture sample rate ({}) must match VAD sample rate ({})",
                self.audio.sample_rate, self.vad.sample_rate
            )));
        }
        if self.audio.sample_rate != self.segmenter.sample_rate {
            return Err(VoiceError::Config(format!(
                "capture sample rate ({}) must match segmenter sample rate ({})",
                self.audio.sample_rate, self.segmenter.sample_rate
            )));
        }
        if self.audio.hop_size != self.segmenter.hop_size {
            return Err(VoiceError::Config(format!(
                "capture hop size ({}) must match segmenter hop size ({})",
                self.audio.hop_size, self.segmenter.hop_size
            )));
        }
        Ok(())
    }
}

/// Builds a recognizer bound to the pipeline's event channel. The
/// backend is chosen at configuration time; the pipeline never knows
/// which one it got.
pub type RecognizerFactory =
    Box<dyn FnOnce(mpsc::UnboundedSender<RecognizerEvent>) -> Box<dyn StreamingRecognizer> + Send>;

/// External collaborators wired in at startup.
pub struct Backends {
    pub recognizer: RecognizerFactory,
    pub chat: Box<dyn ChatBackend>,
    pub emotion: Arc<dyn EmotionClassifier>,
    pub synthesizer: Box<dyn SynthesizerBackend>,
    pub sink: Box<dyn AudioSink>,
}

/// The assembled voice pipeline. `start` spawns the workers; `stop`
/// (or drop) shuts them down and joins them.
pub struct VoicePipeline {
    config: PipelineConfig,
    gate: Arc<CaptureGate>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl VoicePipeline {
    pub fn new(config: PipelineConfig) -> VoiceResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            gate: CaptureGate::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Pause/resume switch, shared with the turn controller. Callers may
    /// use it to mute the pipeline; reading it is for display only.
    pub fn gate(&self) -> Arc<CaptureGate> {
        Arc::clone(&self.gate)
    }

    /// Start all workers. Fails fast if the microphone is unavailable.
    pub fn start(&mut self, backends: Backends) -> VoiceResult<()> {
        if !self.workers.is_empty() {
            return Err(VoiceError::Config("pipeline already started".to_string()));
        }
        info!("🚀 Starting voice pipeline");

        let (hop_tx, hop_rx) = mpsc::unbounded_channel::<AudioHop>();
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (queue, synth_rx) = SpeechSynthesisQueue::new();

        let recognizer = (backends.recognizer)(event_tx);

        // Probe the device before spawning anything.
        let capture = CaptureLoop::new(self.config.audio.clone())?;

        // Millis since pipeline start of the most recent hop, for the
        // device watchdog.
        let started = Instant::now();
        let last_hop_ms = Arc::new(AtomicU64::new(0));

        let capture_worker =
            self.spawn_capture_owner(capture, hop_tx, started, Arc::clone(&last_hop_ms));
        self.workers.push(capture_worker);
        let segmentation_worker =
            self.spawn_segmentation_worker(hop_rx, segment_tx, recognizer, started, last_hop_ms);
        self.workers.push(segmentation_worker);

        let controller = TurnController::new(
            self.config.turn.clone(),
            segment_rx,
            event_rx,
            Arc::clone(&self.gate),
            backends.chat,
            backends.emotion,
            queue,
        );
        self.workers
            .push(thread::spawn(move || controller.run()));

        let pacing = self.config.pacing.clone();
        let synthesizer = backends.synthesizer;
        let sink = backends.sink;
        self.workers.push(thread::spawn(move || {
            run_synthesis_worker(synth_rx, synthesizer, sink, pacing)
        }));

        info!("✅ Voice pipeline started");
        Ok(())
    }

    /// Owns the cpal stream (it is `!Send`, so it lives and dies on this
    /// thread) and rebuilds it when the device stalls.
    fn spawn_capture_owner(
        &self,
        capture: CaptureLoop,
        hop_tx: mpsc::UnboundedSender<AudioHop>,
        started: Instant,
        last_hop_ms: Arc<AtomicU64>,
    ) -> thread::JoinHandle<()> {
        let gate = Arc::clone(&self.gate);
        let shutdown = Arc::clone(&self.shutdown);
        thread::spawn(move || {
            let mut stream = match capture.start(hop_tx.clone(), Arc::clone(&gate)) {
                Ok(s) => s,
                Err(e) => {
                    error!("Capture failed to start: {}", e);
                    return;
                }
            };
            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(500));
                if gate.is_paused() {
                    // Silence is expected while paused; re-arm the clock.
                    last_hop_ms
                        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    continue;
                }
                let last = Duration::from_millis(last_hop_ms.load(Ordering::Relaxed));
                if started.elapsed().saturating_sub(last) > DEVICE_STALL_TIMEOUT {
                    warn!("No audio for {:?}; restarting device", DEVICE_STALL_TIMEOUT);
                    drop(stream);
                    match capture.restart(hop_tx.clone(), Arc::clone(&gate)) {
                        Ok(s) => stream = s,
                        Err(e) => {
                            error!("Device restart failed, capture is down: {}", e);
                            return;
                        }
                    }
                    last_hop_ms
                        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
            }
            drop(stream);
        })
    }

    /// The worker that owns the gate and recognizer: reads hops, runs
    /// VAD, drives the segmentation state machine.
    fn spawn_segmentation_worker(
        &self,
        mut hop_rx: mpsc::UnboundedReceiver<AudioHop>,
        segment_tx: mpsc::UnboundedSender<crate::segment::SpeechSegment>,
        recognizer: Box<dyn StreamingRecognizer>,
        started: Instant,
        last_hop_ms: Arc<AtomicU64>,
    ) -> thread::JoinHandle<()> {
        let gate_flag = Arc::clone(&self.gate);
        let vad_config = self.config.vad.clone();
        let seg_config = self.config.segmenter.clone();
        thread::spawn(move || {
            // The WebRTC classifier is !Send; it must be built here.
            let vad_gate = match VoiceActivityGate::from_config(&vad_config) {
                Ok(g) => g,
                Err(e) => {
                    error!("VAD construction failed, segmentation down: {}", e);
                    return;
                }
            };
            let hop_size = seg_config.hop_size;
            let mut engine =
                SegmentationEngine::new(seg_config, vad_gate, recognizer, segment_tx);

            while let Some(hop) = hop_rx.blocking_recv() {
                last_hop_ms.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if gate_flag.is_paused() {
                    // A hop that raced the pause is stale; also drop
                    // any half-open segment rather than resume it
                    // across the response.
                    engine.cancel();
                    continue;
                }
                if hop.samples.len() != hop_size {
                    continue;
                }
                if let Err(e) = engine.push_hop(&hop.samples) {
                    error!("Segment handoff failed, stopping worker: {}", e);
                    break;
                }
            }
            info!("⏹️ Segmentation worker stopped");
        })
    }

    /// Stop all workers and wait for them.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("🛑 Stopping voice pipeline");
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.shutdown.store(false, Ordering::SeqCst);
        info!("✅ Voice pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_sample_rates_are_rejected() {
        let mut config = PipelineConfig::default();
        config.vad.sample_rate = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mismatched_hop_sizes_are_rejected() {
        let mut config = PipelineConfig::default();
        config.segmenter.hop_size = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_is_consistent() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
