//! # Parley Voice — real-time duplex voice conversation pipeline
//!
//! Continuous microphone ingestion, VAD-gated speech segmentation, and
//! coordinated hand-off between a streaming recognizer, a turn-taking
//! controller and a speech synthesizer. Capture and inference run on
//! different threads and never block each other; capture and playback
//! are mutually exclusive so the system never hears itself talk.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Voice Pipeline                          │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────────────┐       │
//! │  │ Capture   │──▶│ Segmentation │──▶│ Streaming        │       │
//! │  │ (cpal)    │hop│ Idle/Speaking│   │ Recognizer       │       │
//! │  └───────────┘   └─────────────┘   └──────────────────┘       │
//! │        ▲                                    │ final            │
//! │        │ resume                             ▼                  │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────────────┐       │
//! │  │ Playback  │◀──│ Synthesis    │◀──│ Turn Controller  │       │
//! │  │ (rodio)   │   │ Queue (FIFO) │   │ (chat + emotion) │       │
//! │  └───────────┘   └─────────────┘   └──────────────────┘       │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod chat;
pub mod emotion;
pub mod error;
pub mod pipeline;
pub mod recognizer;
pub mod ring;
pub mod segment;
pub mod synth;
pub mod textflow;
pub mod turn;
pub mod vad;
pub mod wav;

pub use capture::{AudioConfig, AudioHop, CaptureGate, CaptureLoop};
pub use chat::{ChatBackend, HttpChat, ScriptedChat};
pub use emotion::{EmotionClassifier, NeutralClassifier, SingleSlotClassifier};
pub use error::{VoiceError, VoiceResult};
pub use pipeline::{Backends, PipelineConfig, RecognizerFactory, VoicePipeline};
pub use recognizer::{
    create_recognizer, HttpRecognizer, RecognizerEvent, ScriptedRecognizer, StreamingRecognizer,
};
#[cfg(feature = "whisper")]
pub use recognizer::WhisperRecognizer;
pub use ring::RingBuffer;
pub use segment::{SegmentState, SegmentationEngine, SegmenterConfig, SpeechSegment};
pub use synth::{
    pace_fragments, run_synthesis_worker, AudioSink, HttpSynthesizer, NullSink, PacingConfig,
    PlaceholderSynthesizer, RodioSink, SpeechSynthesisQueue, SpeechTask, SynthesizerBackend,
};
pub use textflow::{delta_from, SentenceSplitter};
pub use turn::{build_prompt, ConversationTurn, TurnConfig, TurnController};
pub use vad::{HopClassifier, VadConfig, VadDecision, VoiceActivityGate, WebRtcClassifier};
pub use wav::{encode_wav, write_segment_wav};
