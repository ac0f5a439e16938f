//! Turn controller: listen → transcribe → respond → speak → resume.
//!
//! Pairs each completed segment with its final transcript, pauses capture
//! for the whole response phase, streams the chat reply into
//! sentence-bounded synthesis tasks, and resumes capture only after the
//! last task finished playing. Capture and playback are therefore never
//! active at the same time, so the recognizer can never hear the
//! synthesizer.

use crate::capture::CaptureGate;
use crate::chat::ChatBackend;
use crate::emotion::EmotionClassifier;
use crate::error::VoiceError;
use crate::recognizer::RecognizerEvent;
use crate::segment::SpeechSegment;
use crate::synth::{SpeechSynthesisQueue, SpeechTask};
use crate::textflow::SentenceSplitter;
use crate::wav::write_segment_wav;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One user utterance ready for response generation. Consumed exactly
/// once to build the prompt.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub transcript: String,
    pub detected_emotion: Option<String>,
}

/// Configuration for the turn controller.
#[derive(Debug, Clone, Default)]
pub struct TurnConfig {
    /// When set, every completed segment is written here as a timestamped
    /// WAV for downstream analysis.
    pub persist_dir: Option<PathBuf>,
}

/// Drives the full conversational cycle on its own thread.
pub struct TurnController {
    config: TurnConfig,
    segment_rx: mpsc::UnboundedReceiver<SpeechSegment>,
    event_rx: mpsc::UnboundedReceiver<RecognizerEvent>,
    gate: Arc<CaptureGate>,
    chat: Box<dyn ChatBackend>,
    emotion: Arc<dyn EmotionClassifier>,
    queue: SpeechSynthesisQueue,
}

impl TurnController {
    pub fn new(
        config: TurnConfig,
        segment_rx: mpsc::UnboundedReceiver<SpeechSegment>,
        event_rx: mpsc::UnboundedReceiver<RecognizerEvent>,
        gate: Arc<CaptureGate>,
        chat: Box<dyn ChatBackend>,
        emotion: Arc<dyn EmotionClassifier>,
        queue: SpeechSynthesisQueue,
    ) -> Self {
        Self {
            config,
            segment_rx,
            event_rx,
            gate,
            chat,
            emotion,
            queue,
        }
    }

    /// Run until the segment channel closes. Span- and device-level
    /// errors are absorbed here; the loop always returns to listening.
    pub fn run(mut self) {
        info!("🔄 Turn controller started");
        while let Some(segment) = self.segment_rx.blocking_recv() {
            let Some(transcript) = self.await_final() else {
                break;
            };
            self.persist(&segment);

            let transcript = transcript.trim().to_string();
            if transcript.is_empty() {
                debug!("Empty transcript; staying in listening state");
                continue;
            }
            info!("📝 Transcript: {:?}", transcript);
            self.respond(&segment, transcript);
        }
        info!("⏹️ Turn controller stopped");
    }

    /// Drain recognizer events until this span's final arrives. Partials
    /// always precede the final of the same span.
    fn await_final(&mut self) -> Option<String> {
        loop {
            match self.event_rx.blocking_recv()? {
                RecognizerEvent::Partial { text } => {
                    debug!("Partial transcript: {:?}", text);
                }
                RecognizerEvent::Final { text } => return Some(text),
            }
        }
    }

    fn persist(&self, segment: &SpeechSegment) {
        let Some(ref dir) = self.config.persist_dir else {
            return;
        };
        match write_segment_wav(dir, &segment.samples, segment.sample_rate) {
            Ok(path) => debug!("Segment saved to {}", path.display()),
            Err(e) => warn!("Segment persistence failed: {}", e),
        }
    }

    /// The speak phase: capture stays paused from prompt build until the
    /// synthesis queue drains.
    fn respond(&mut self, segment: &SpeechSegment, transcript: String) {
        self.gate.pause();

        let detected_emotion = match self
            .emotion
            .classify(&segment.samples, segment.sample_rate)
        {
            Ok(label) => Some(label),
            Err(VoiceError::BackendBusy(_)) => None,
            Err(e) => {
                warn!("Emotion classification failed: {}", e);
                None
            }
        };
        let turn = ConversationTurn {
            transcript,
            detected_emotion,
        };
        let prompt = build_prompt(&turn);

        let mut splitter = SentenceSplitter::new();
        {
            let queue = &self.queue;
            let emotion = turn.detected_emotion.clone();
            let mut on_chunk = |chunk: &str| {
                for sentence in splitter.push(chunk) {
                    let task = SpeechTask {
                        text: sentence,
                        emotion: emotion.clone(),
                    };
                    if let Err(e) = queue.enqueue(task) {
                        warn!("Failed to enqueue speech task: {}", e);
                    }
                }
            };
            if let Err(e) = self.chat.chat_stream(&prompt, &mut on_chunk) {
                warn!("Chat backend failed; speaking what arrived: {}", e);
            }
        }
        if let Some(rest) = splitter.finish() {
            let task = SpeechTask {
                text: rest,
                emotion: turn.detected_emotion.clone(),
            };
            if let Err(e) = self.queue.enqueue(task) {
                warn!("Failed to enqueue trailing speech task: {}", e);
            }
        }

        // Block until playback is done, then hand the mic back.
        match self.queue.end_of_turn() {
            Ok(done) => {
                if done.blocking_recv().is_err() {
                    warn!("Synthesis worker gone; resuming capture anyway");
                }
            }
            Err(e) => warn!("Turn boundary enqueue failed: {}", e),
        }
        self.gate.resume();
    }
}

/// Enrich the transcript with the detected emotion, when available.
pub fn build_prompt(turn: &ConversationTurn) -> String {
    match turn.detected_emotion {
        Some(ref label) => format!("[The speaker sounds {}.] {}", label, turn.transcript),
        None => turn.transcript.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ScriptedChat;
    use crate::emotion::NeutralClassifier;
    use crate::error::VoiceResult;
    use crate::synth::{run_synthesis_worker, NullSink, PacingConfig, SynthesizerBackend};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        spoken: Arc<Mutex<Vec<String>>>,
        gate: Arc<CaptureGate>,
        paused_during_synthesis: Arc<Mutex<Vec<bool>>>,
    }

    impl SynthesizerBackend for Recording {
        fn synthesize(&self, text: &str) -> VoiceResult<Vec<f32>> {
            self.spoken.lock().unwrap().push(text.to_string());
            self.paused_during_synthesis
                .lock()
                .unwrap()
                .push(self.gate.is_paused());
            Ok(Vec::new())
        }
        fn sample_rate(&self) -> u32 {
            24000
        }
    }

    fn segment() -> SpeechSegment {
        SpeechSegment {
            samples: vec![0.0; 1600],
            timestamp: Utc::now(),
            duration: Duration::from_millis(100),
            sample_rate: 16000,
        }
    }

    fn run_one_turn(
        final_text: &str,
        chat_chunks: Vec<String>,
    ) -> (Vec<String>, Vec<bool>, Arc<CaptureGate>) {
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let gate = CaptureGate::new();
        let (queue, receiver) = SpeechSynthesisQueue::new();

        let spoken = Arc::new(Mutex::new(Vec::new()));
        let paused = Arc::new(Mutex::new(Vec::new()));
        let backend = Recording {
            spoken: Arc::clone(&spoken),
            gate: Arc::clone(&gate),
            paused_during_synthesis: Arc::clone(&paused),
        };
        let worker = std::thread::spawn(move || {
            run_synthesis_worker(
                receiver,
                Box::new(backend),
                Box::new(NullSink),
                PacingConfig {
                    comma_delay: Duration::ZERO,
                    sentence_delay: Duration::ZERO,
                },
            )
        });

        let controller = TurnController::new(
            TurnConfig::default(),
            segment_rx,
            event_rx,
            Arc::clone(&gate),
            Box::new(ScriptedChat::new(chat_chunks)),
            Arc::new(NeutralClassifier),
            queue,
        );
        let controller_thread = std::thread::spawn(move || controller.run());

        segment_tx.send(segment()).unwrap();
        event_tx
            .send(RecognizerEvent::Final {
                text: final_text.to_string(),
            })
            .unwrap();
        drop(segment_tx);
        drop(event_tx);

        controller_thread.join().unwrap();
        worker.join().unwrap();

        let spoken = Arc::try_unwrap(spoken).unwrap().into_inner().unwrap();
        let paused = Arc::try_unwrap(paused).unwrap().into_inner().unwrap();
        (spoken, paused, gate)
    }

    #[test]
    fn turn_speaks_sentences_in_order_and_resumes_capture() {
        let (spoken, paused, gate) = run_one_turn(
            "hello there",
            vec!["First one. Sec".to_string(), "ond one. And a tail".to_string()],
        );
        assert_eq!(spoken, vec!["First one.", "Second one.", "And a tail"]);
        // Capture was paused for every synthesized fragment.
        assert!(paused.iter().all(|&p| p));
        // And handed back once the queue drained.
        assert!(!gate.is_paused());
    }

    #[test]
    fn empty_transcript_skips_the_turn() {
        let (spoken, _, gate) = run_one_turn("   ", vec!["Never spoken.".to_string()]);
        assert!(spoken.is_empty());
        assert!(!gate.is_paused());
    }

    #[test]
    fn partials_are_consumed_before_final() {
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let gate = CaptureGate::new();
        let (queue, receiver) = SpeechSynthesisQueue::new();
        let worker = std::thread::spawn(move || {
            run_synthesis_worker(
                receiver,
                Box::new(crate::synth::PlaceholderSynthesizer),
                Box::new(NullSink),
                PacingConfig::default(),
            )
        });

        let controller = TurnController::new(
            TurnConfig::default(),
            segment_rx,
            event_rx,
            Arc::clone(&gate),
            Box::new(ScriptedChat::new(vec!["Ok.".to_string()])),
            Arc::new(NeutralClassifier),
            queue,
        );
        let thread = std::thread::spawn(move || controller.run());

        segment_tx.send(segment()).unwrap();
        event_tx
            .send(RecognizerEvent::Partial {
                text: "hel".to_string(),
            })
            .unwrap();
        event_tx
            .send(RecognizerEvent::Partial {
                text: "hello".to_string(),
            })
            .unwrap();
        event_tx
            .send(RecognizerEvent::Final {
                text: "hello".to_string(),
            })
            .unwrap();
        drop(segment_tx);
        drop(event_tx);

        thread.join().unwrap();
        worker.join().unwrap();
        assert!(!gate.is_paused());
    }

    #[test]
    fn prompt_carries_emotion_label() {
        let turn = ConversationTurn {
            transcript: "I lost my keys".to_string(),
            detected_emotion: Some("frustrated".to_string()),
        };
        assert_eq!(
            build_prompt(&turn),
            "[The speaker sounds frustrated.] I lost my keys"
        );
        let plain = ConversationTurn {
            transcript: "hi".to_string(),
            detected_emotion: None,
        };
        assert_eq!(build_prompt(&plain), "hi");
    }
}
