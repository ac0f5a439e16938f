//! Speech segmentation state machine.
//!
//! Ties the voice-activity gate, the pre-speech ring and the streaming
//! recognizer together. Two states: `Idle` (buffering recent hops so
//! onset context survives VAD reaction latency) and `Speaking`
//! (accumulating a segment and feeding the recognizer). A segment closes
//! after `post_buffer_frames` consecutive silent hops or when it reaches
//! `max_recording_secs` of audio, whichever fires first.

use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::StreamingRecognizer;
use crate::ring::RingBuffer;
use crate::vad::VoiceActivityGate;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Segmentation state. Exposed read-only for display; control decisions
/// happen inside the engine only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// No speech; recent hops go to the pre-speech ring.
    Idle,
    /// An utterance is open; every hop feeds segment and recognizer.
    Speaking,
}

/// One completed utterance, handed off for persistence and emotion analysis.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Accumulated PCM: pre-speech context plus every hop until offset.
    pub samples: Vec<f32>,
    /// When the segment closed.
    pub timestamp: DateTime<Utc>,
    /// Audio duration implied by `samples`.
    pub duration: Duration,
    pub sample_rate: u32,
}

/// Why an open segment closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    SilenceGap,
    Timeout,
}

/// Configuration for the segmentation engine.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Samples per hop; must match the gate's hop size in production.
    pub hop_size: usize,
    pub sample_rate: u32,
    /// Hops of pre-speech context kept while idle (default 8 = 240ms at
    /// 30ms hops).
    pub pre_buffer_frames: usize,
    /// Consecutive silent hops that close a segment (default 27 ≈ 800ms).
    pub post_buffer_frames: usize,
    /// Hard cap on segment length; closes regardless of VAD (default 30s).
    pub max_recording_secs: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            hop_size: 480,
            sample_rate: 16000,
            pre_buffer_frames: 8,
            post_buffer_frames: 27,
            max_recording_secs: 30,
        }
    }
}

/// The segmentation engine. Owns the gate, the recognizer and the
/// pre-speech ring; runs for the process lifetime (no terminal state).
pub struct SegmentationEngine {
    config: SegmenterConfig,
    gate: VoiceActivityGate,
    recognizer: Box<dyn StreamingRecognizer>,
    state: SegmentState,
    pre_buffer: RingBuffer,
    segment: Vec<f32>,
    silence_hops: usize,
    max_segment_samples: usize,
    segment_tx: mpsc::UnboundedSender<SpeechSegment>,
}

impl SegmentationEngine {
    pub fn new(
        config: SegmenterConfig,
        gate: VoiceActivityGate,
        recognizer: Box<dyn StreamingRecognizer>,
        segment_tx: mpsc::UnboundedSender<SpeechSegment>,
    ) -> Self {
        let pre_capacity = (config.hop_size * config.pre_buffer_frames).max(1);
        let max_segment_samples = config.sample_rate as usize * config.max_recording_secs as usize;
        Self {
            pre_buffer: RingBuffer::new(pre_capacity),
            state: SegmentState::Idle,
            segment: Vec::new(),
            silence_hops: 0,
            max_segment_samples,
            config,
            gate,
            recognizer,
            segment_tx,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Process one hop of captured audio.
    ///
    /// Recognizer chunk errors are logged and swallowed: losing one hop of
    /// transcript beats halting capture.
    pub fn push_hop(&mut self, hop: &[f32]) -> VoiceResult<()> {
        let decision = self.gate.evaluate(hop);

        match (self.state, decision.is_voice) {
            (SegmentState::Idle, false) => {
                // Sliding window of onset context; oldest hops fall off.
                self.pre_buffer.write(hop);
            }
            (SegmentState::Idle, true) => {
                info!("🎤 Speech onset (p={:.2})", decision.probability);
                self.open_segment(hop)?;
            }
            (SegmentState::Speaking, true) => {
                self.silence_hops = 0;
                self.append_hop(hop);
                self.maybe_close()?;
            }
            (SegmentState::Speaking, false) => {
                self.silence_hops += 1;
                self.append_hop(hop);
                self.maybe_close()?;
            }
        }
        Ok(())
    }

    /// Discard the open segment without handing it off. The next onset's
    /// `start_span()` resets the recognizer, so no final is emitted for a
    /// cancelled span.
    pub fn cancel(&mut self) {
        if self.state == SegmentState::Speaking {
            warn!("Segment cancelled ({} samples dropped)", self.segment.len());
        }
        self.segment.clear();
        self.silence_hops = 0;
        self.pre_buffer.clear();
        self.state = SegmentState::Idle;
    }

    fn open_segment(&mut self, trigger_hop: &[f32]) -> VoiceResult<()> {
        self.segment.clear();
        self.silence_hops = 0;
        self.recognizer.start_span();

        // Onset context first, then the triggering hop — fed exactly once.
        let pre = self.pre_buffer.drain_all();
        if !pre.is_empty() {
            self.segment.extend_from_slice(&pre);
            if let Err(e) = self.recognizer.process_chunk(&pre) {
                warn!("Recognizer rejected pre-speech chunk: {}", e);
            }
        }
        self.state = SegmentState::Speaking;
        self.append_hop(trigger_hop);
        self.maybe_close()
    }

    fn append_hop(&mut self, hop: &[f32]) {
        self.segment.extend_from_slice(hop);
        if let Err(e) = self.recognizer.process_chunk(hop) {
            warn!("Recognizer rejected chunk: {}", e);
        }
    }

    fn maybe_close(&mut self) -> VoiceResult<()> {
        // Timeout takes precedence regardless of the VAD verdict.
        if self.segment.len() >= self.max_segment_samples {
            return self.close_segment(CloseReason::Timeout);
        }
        if self.silence_hops >= self.config.post_buffer_frames {
            return self.close_segment(CloseReason::SilenceGap);
        }
        Ok(())
    }

    fn close_segment(&mut self, reason: CloseReason) -> VoiceResult<()> {
        let samples = std::mem::take(&mut self.segment);
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / self.config.sample_rate as f64,
        );
        info!(
            "🎯 Segment closed ({:?}, {:.2}s, {} samples)",
            reason,
            duration.as_secs_f64(),
            samples.len()
        );

        let segment = SpeechSegment {
            samples,
            timestamp: Utc::now(),
            duration,
            sample_rate: self.config.sample_rate,
        };
        // Hand off before finalizing so the final transcript always finds
        // its segment already delivered.
        self.segment_tx
            .send(segment)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;

        if let Err(e) = self.recognizer.end_span() {
            warn!("Recognizer failed to finalize span: {}", e);
        }

        self.pre_buffer.clear();
        self.silence_hops = 0;
        self.state = SegmentState::Idle;
        debug!("Back to Idle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::ScriptedRecognizer;
    use crate::vad::{HopClassifier, VoiceActivityGate};
    use std::collections::VecDeque;

    const HOP: usize = 256;

    /// Gate driven by a scripted verdict sequence; silence once exhausted.
    struct ScriptedHops {
        verdicts: VecDeque<bool>,
    }

    impl HopClassifier for ScriptedHops {
        fn process(&mut self, _hop: &[i16]) -> VoiceResult<f32> {
            Ok(if self.verdicts.pop_front().unwrap_or(false) {
                1.0
            } else {
                0.0
            })
        }
        fn hop_size(&self) -> usize {
            HOP
        }
    }

    struct Harness {
        engine: SegmentationEngine,
        segments: mpsc::UnboundedReceiver<SpeechSegment>,
        events: mpsc::UnboundedReceiver<crate::recognizer::RecognizerEvent>,
        spans: std::sync::Arc<std::sync::Mutex<Vec<Vec<f32>>>>,
    }

    fn harness(config: SegmenterConfig, verdicts: Vec<bool>) -> Harness {
        let gate = VoiceActivityGate::new(
            Box::new(ScriptedHops {
                verdicts: verdicts.into(),
            }),
            0.5,
        );
        let (event_tx, events) = mpsc::unbounded_channel();
        let recognizer = ScriptedRecognizer::new(event_tx);
        let spans = recognizer.spans();
        let (segment_tx, segments) = mpsc::unbounded_channel();
        Harness {
            engine: SegmentationEngine::new(config, gate, Box::new(recognizer), segment_tx),
            segments,
            events,
            spans,
        }
    }

    fn config(pre: usize, post: usize) -> SegmenterConfig {
        SegmenterConfig {
            hop_size: HOP,
            sample_rate: 16000,
            pre_buffer_frames: pre,
            post_buffer_frames: post,
            max_recording_secs: 30,
        }
    }

    /// Hops carry a distinct fill value so gaps and duplicates show up.
    fn hop(value: f32) -> Vec<f32> {
        vec![value; HOP]
    }

    #[test]
    fn end_to_end_scenario_from_silence_to_segment() {
        // 5 silent, 20 voiced, 25 silent; pre=5, post=20, hop=256.
        let mut verdicts = vec![false; 5];
        verdicts.extend(vec![true; 20]);
        verdicts.extend(vec![false; 25]);
        let mut h = harness(config(5, 20), verdicts);

        let mut closed_at = None;
        for i in 0..50 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
            if closed_at.is_none() && i >= 5 && h.engine.state() == SegmentState::Idle {
                closed_at = Some(i);
            }
        }

        // Offset fires on the 20th consecutive silent hop: overall hop 44
        // (0-based), i.e. after 20 voiced + 20 silent hops past onset.
        assert_eq!(closed_at, Some(44));

        let segment = h.segments.try_recv().unwrap();
        assert_eq!(segment.samples.len(), (5 + 20 + 20) * HOP);
        assert!(h.segments.try_recv().is_err(), "exactly one segment");

        // Pre-buffer context is the 5 hops immediately preceding onset.
        assert_eq!(segment.samples[0], 0.0);
        assert_eq!(segment.samples[4 * HOP], 4.0);
        assert_eq!(segment.samples[5 * HOP], 5.0); // triggering hop
    }

    #[test]
    fn span_equals_pre_buffer_plus_all_hops_no_gaps_no_duplicates() {
        let mut verdicts = vec![false; 3];
        verdicts.extend(vec![true; 4]);
        verdicts.extend(vec![false; 2]);
        let mut h = harness(config(3, 2), verdicts);

        let mut expected = Vec::new();
        for i in 0..9 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
        }
        // Pre-buffer (hops 0..3) ++ onset through last hop before offset.
        for i in 0..9 {
            expected.extend(hop(i as f32));
        }

        let spans = h.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], expected);
    }

    #[test]
    fn pre_buffer_keeps_only_newest_frames() {
        // 10 silent hops with pre=3: only hops 7, 8, 9 survive as context.
        let mut verdicts = vec![false; 10];
        verdicts.push(true);
        verdicts.extend(vec![false; 2]);
        let mut h = harness(config(3, 2), verdicts);

        for i in 0..13 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
        }

        let segment = h.segments.try_recv().unwrap();
        // 3 pre + voiced hop 10 + 2 silent = 6 hops.
        assert_eq!(segment.samples.len(), 6 * HOP);
        assert_eq!(segment.samples[0], 7.0);
        assert_eq!(segment.samples[HOP], 8.0);
        assert_eq!(segment.samples[2 * HOP], 9.0);
        assert_eq!(segment.samples[3 * HOP], 10.0);
    }

    #[test]
    fn offset_needs_consecutive_silence() {
        // Silence interrupted by voice resets the counter.
        let verdicts = vec![
            true, // onset
            false, false, // 2 silent
            true,  // resets counter
            false, false, false, // 3 silent -> closes at post=3
        ];
        let mut h = harness(config(0, 3), verdicts);

        for i in 0..7 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
            if i < 6 {
                assert_eq!(h.engine.state(), SegmentState::Speaking);
            }
        }
        assert_eq!(h.engine.state(), SegmentState::Idle);
        let segment = h.segments.try_recv().unwrap();
        assert_eq!(segment.samples.len(), 7 * HOP);
    }

    #[test]
    fn timeout_closes_segment_even_while_voiced() {
        let mut cfg = config(0, 100);
        cfg.max_recording_secs = 1; // 16000 samples = 62.5 hops of 256
        let mut h = harness(cfg, vec![true; 80]);

        let mut closed = None;
        for i in 0..80 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
            if closed.is_none() && h.engine.state() == SegmentState::Idle {
                closed = Some(i);
            }
        }
        // 63 hops * 256 = 16128 >= 16000 samples.
        assert_eq!(closed, Some(62));
        let segment = h.segments.try_recv().unwrap();
        assert_eq!(segment.samples.len(), 63 * HOP);
    }

    #[test]
    fn instant_offset_segment_is_still_valid() {
        // Voice for one hop, then silence with post=1: minimum duration is
        // not enforced here.
        let mut h = harness(config(0, 1), vec![true, false]);
        h.engine.push_hop(&hop(1.0)).unwrap();
        h.engine.push_hop(&hop(2.0)).unwrap();

        let segment = h.segments.try_recv().unwrap();
        assert_eq!(segment.samples.len(), 2 * HOP);
        assert_eq!(h.engine.state(), SegmentState::Idle);
    }

    #[test]
    fn final_event_emitted_after_segment_handoff() {
        let mut h = harness(config(0, 1), vec![true, false]);
        h.engine.push_hop(&hop(1.0)).unwrap();
        h.engine.push_hop(&hop(2.0)).unwrap();

        assert!(h.segments.try_recv().is_ok());
        assert!(matches!(
            h.events.try_recv().unwrap(),
            crate::recognizer::RecognizerEvent::Final { .. }
        ));
    }

    #[test]
    fn cancel_discards_open_segment() {
        let mut h = harness(config(2, 5), vec![false, true, true]);
        h.engine.push_hop(&hop(0.0)).unwrap();
        h.engine.push_hop(&hop(1.0)).unwrap();
        h.engine.push_hop(&hop(2.0)).unwrap();
        assert_eq!(h.engine.state(), SegmentState::Speaking);

        h.engine.cancel();
        assert_eq!(h.engine.state(), SegmentState::Idle);
        assert!(h.segments.try_recv().is_err());
    }

    #[test]
    fn consecutive_segments_do_not_leak_context() {
        // Two utterances separated by plenty of silence; second segment
        // must not contain first-segment samples.
        let verdicts = vec![
            true, false, // segment 1 (post=1)
            false, false, // idle, pre-buffer refills
            true, false, // segment 2
        ];
        let mut h = harness(config(1, 1), verdicts);
        for i in 0..6 {
            h.engine.push_hop(&hop(i as f32)).unwrap();
        }

        let first = h.segments.try_recv().unwrap();
        let second = h.segments.try_recv().unwrap();
        assert_eq!(first.samples.len(), 2 * HOP);
        // pre-buffer hop 3 + voiced hop 4 + silent hop 5.
        assert_eq!(second.samples.len(), 3 * HOP);
        assert_eq!(second.samples[0], 3.0);
    }
}
