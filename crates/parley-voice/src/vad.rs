//! Voice activity gating over a hop-level classifier.
//!
//! The concrete classifier is WebRTC VAD. It is wrapped behind the
//! `HopClassifier` trait so the segmentation engine (and its tests) never
//! depend on the real model. A classifier failure on a single hop is
//! treated as "no voice" — losing one hop of sensitivity is preferred to
//! halting capture.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Per-hop verdict. Transient: consumed immediately, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    /// Speech probability in [0, 1]. WebRTC VAD is binary, so 0.0 or 1.0.
    pub probability: f32,
    /// `probability` compared against the gate threshold.
    pub is_voice: bool,
}

/// Hop-level binary speech classifier.
///
/// Input is one fixed-size hop of i16 PCM; output is a speech probability.
/// Hop size is fixed at construction — changing it means rebuilding the
/// classifier.
pub trait HopClassifier {
    /// Classify one hop. Must be called with exactly `hop_size()` samples.
    fn process(&mut self, hop: &[i16]) -> VoiceResult<f32>;

    /// Expected hop length in samples.
    fn hop_size(&self) -> usize;
}

/// Configuration for the WebRTC VAD classifier.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz).
    pub sample_rate: u32,
    /// Aggressiveness (0-3, where 3 is most aggressive).
    pub mode: u8,
    /// Probability above this counts as voice (default 0.5).
    pub threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
            threshold: 0.5,
        }
    }
}

fn vad_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::VadInit(format!(
            "WebRTC VAD only supports 8000/16000/32000/48000 Hz, got {}",
            other
        ))),
    }
}

/// WebRTC VAD behind the `HopClassifier` contract.
///
/// Uses 30ms hops (480 samples at 16kHz) — the largest frame WebRTC VAD
/// accepts. Not `Send`; construct it on the thread that will own it.
pub struct WebRtcClassifier {
    vad: Vad,
    hop_size: usize,
}

impl WebRtcClassifier {
    /// Construct the classifier. Invalid sample rate or mode is fatal here;
    /// nothing recovers from a classifier that never existed.
    pub fn new(config: &VadConfig) -> VoiceResult<Self> {
        if config.mode > 3 {
            return Err(VoiceError::VadInit(format!(
                "VAD mode must be 0-3, got {}",
                config.mode
            )));
        }
        let rate = vad_rate(config.sample_rate)?;
        let mut vad = Vad::new();
        vad.set_mode(vad_mode(config.mode));
        vad.set_sample_rate(rate);

        // 30ms hops; WebRTC VAD accepts 10/20/30ms frames.
        let hop_size = (config.sample_rate as usize * 30) / 1000;
        info!(
            "✅ VAD classifier ready ({} Hz, mode {}, hop {} samples)",
            config.sample_rate, config.mode, hop_size
        );
        Ok(Self { vad, hop_size })
    }
}

impl HopClassifier for WebRtcClassifier {
    fn process(&mut self, hop: &[i16]) -> VoiceResult<f32> {
        if hop.len() != self.hop_size {
            return Err(VoiceError::VadProcessing(format!(
                "expected {} samples, got {}",
                self.hop_size,
                hop.len()
            )));
        }
        let is_speech = self
            .vad
            .is_voice_segment(hop)
            .map_err(|e| VoiceError::VadProcessing(format!("classifier failed: {:?}", e)))?;
        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    fn hop_size(&self) -> usize {
        self.hop_size
    }
}

/// Turns a raw hop stream into per-hop voice decisions.
///
/// Owns the classifier and the threshold. Per-hop classifier errors are
/// logged and mapped to a "no voice" decision (fail safe).
pub struct VoiceActivityGate {
    classifier: Box<dyn HopClassifier>,
    threshold: f32,
}

impl VoiceActivityGate {
    pub fn new(classifier: Box<dyn HopClassifier>, threshold: f32) -> Self {
        Self {
            classifier,
            threshold,
        }
    }

    /// Build a gate over the WebRTC classifier from config.
    pub fn from_config(config: &VadConfig) -> VoiceResult<Self> {
        let classifier = WebRtcClassifier::new(config)?;
        Ok(Self::new(Box::new(classifier), config.threshold))
    }

    /// Evaluate one hop of f32 PCM (-1.0..1.0).
    pub fn evaluate(&mut self, hop: &[f32]) -> VadDecision {
        let hop_i16: Vec<i16> = hop
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        match self.classifier.process(&hop_i16) {
            Ok(probability) => VadDecision {
                probability,
                is_voice: probability > self.threshold,
            },
            Err(e) => {
                debug!("VAD hop failed, treating as silence: {}", e);
                VadDecision {
                    probability: 0.0,
                    is_voice: false,
                }
            }
        }
    }

    /// Expected hop length in samples.
    pub fn hop_size(&self) -> usize {
        self.classifier.hop_size()
    }
}
